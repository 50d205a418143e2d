//! Redirect following for requests issued by collaborators.
//!
//! Proxied browser traffic never follows redirects; the client sees the 3xx.
use http::header::{
  AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION,
  PROXY_AUTHORIZATION, TRANSFER_ENCODING, WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};

use crate::request::Request;
use crate::response::Response;

/// How a collaborator wants redirects handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectPolicy {
  /// follow at all
  pub follow: bool,
  /// most hops in one chain
  pub max_redirects: usize,
  /// keep following when a URL repeats
  pub allow_circular: bool,
}

impl Default for RedirectPolicy {
  fn default() -> RedirectPolicy {
    RedirectPolicy::limited(10)
  }
}

/// An action to perform when a redirect status code is found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
  /// Follow
  Follow,
  /// Stop and hand back the 3xx
  Stop,
}

impl RedirectPolicy {
  /// Follow up to `max` hops, stopping on loops.
  pub fn limited(max: usize) -> Self {
    RedirectPolicy {
      follow: true,
      max_redirects: max,
      allow_circular: false,
    }
  }
  /// Never follow.
  pub fn none() -> Self {
    RedirectPolicy {
      follow: false,
      max_redirects: 0,
      allow_circular: false,
    }
  }

  /// Decide whether to go to `next` after having visited `previous`.
  pub fn check(&self, next: &Uri, previous: &[Uri]) -> Action {
    if !self.follow || previous.len() > self.max_redirects {
      return Action::Stop;
    }
    if !self.allow_circular && previous.iter().any(|p| same_url(p, next)) {
      tracing::debug!(url = %next, "circular redirect, stopping");
      return Action::Stop;
    }
    Action::Follow
  }
}

fn same_url(a: &Uri, b: &Uri) -> bool {
  a.scheme() == b.scheme()
    && a.host().map(str::to_ascii_lowercase) == b.host().map(str::to_ascii_lowercase)
    && crate::request::default_port(a) == crate::request::default_port(b)
    && a.path_and_query().map(|p| p.as_str()).unwrap_or("/")
      == b.path_and_query().map(|p| p.as_str()).unwrap_or("/")
}

/// Whether `status` is a redirect that can be followed for this response.
pub(crate) fn is_redirect(response: &Response) -> bool {
  match response.status_code() {
    StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => true,
    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
    _ => false,
  }
}

/// Resolve the `Location` header against the URL that produced it.
pub(crate) fn location(response: &Response, current: &Uri) -> Option<Uri> {
  let val = response.headers().get(LOCATION)?.to_str().ok()?.trim();
  if val.starts_with("https://") || val.starts_with("http://") {
    return val.parse().ok();
  }
  let path = if let Some(rest) = val.strip_prefix("//") {
    return format!("{}://{}", current.scheme_str().unwrap_or("http"), rest)
      .parse()
      .ok();
  } else if val.starts_with('/') {
    val.to_string()
  } else {
    // relative to the current directory
    let base = current.path();
    let dir = &base[..base.rfind('/').map(|i| i + 1).unwrap_or(0)];
    format!("{}{}", if dir.is_empty() { "/" } else { dir }, val)
  };
  Uri::builder()
    .scheme(current.scheme_str().unwrap_or("http"))
    .authority(current.authority()?.as_str())
    .path_and_query(path)
    .build()
    .ok()
}

/// Turn `request` into the request for the next hop.
pub(crate) fn next_request(request: &Request, status: StatusCode, next: Uri, previous: &[Uri]) -> Request {
  let mut next_request = request.clone();
  match status {
    StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
      if !matches!(*request.method(), Method::GET | Method::HEAD) {
        *next_request.method_mut() = Method::GET;
      }
      *next_request.body_mut() = None;
      for header in &[TRANSFER_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, CONTENT_LENGTH] {
        next_request.headers_mut().remove(header);
      }
    }
    _ => {}
  }
  if let Some(authority) = next.authority() {
    if let Ok(host) = http::HeaderValue::from_str(authority.as_str()) {
      next_request.headers_mut().insert(http::header::HOST, host);
    }
  }
  remove_sensitive_headers(next_request.headers_mut(), &next, previous);
  *next_request.uri_mut() = next;
  next_request
}

pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Uri, previous: &[Uri]) {
  if let Some(previous) = previous.last() {
    let cross_host = next.host() != previous.host() || next.port_u16() != previous.port_u16();
    if cross_host {
      headers.remove(AUTHORIZATION);
      headers.remove(COOKIE);
      headers.remove("cookie2");
      headers.remove(PROXY_AUTHORIZATION);
      headers.remove(WWW_AUTHENTICATE);
    }
  }
}
