use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};

use crate::body::Body;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// How the request target is written on the start line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
  /// `/path?query`, used toward origin servers
  Origin,
  /// `http://host/path?query`, used toward a plain HTTP upstream proxy
  Absolute,
  /// `host:port`, used by `CONNECT`
  Authority,
}

/// A request as seen by the proxy.
///
/// The uri is always absolute: requests arriving in origin-form get their
/// scheme and authority from the tunnel or `Host` header they came with.
#[derive(Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
  #[serde(with = "http_serde::uri")]
  uri: http::Uri,
  #[serde(with = "http_serde::version")]
  version: Version,
  #[serde(with = "http_serde::method")]
  method: Method,
  #[serde(with = "http_serde::header_map")]
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  pub(crate) fn from_parts(
    method: Method,
    uri: http::Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<Body>,
  ) -> Self {
    Request {
      uri,
      version,
      method,
      headers,
      body,
    }
  }
  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request: waylay::Request = waylay::Request::builder()
  ///     .method("GET")
  ///     .uri("https://www.rust-lang.org/")
  ///     .header("X-Custom-Foo", "Bar")
  ///     .body(())
  ///     .unwrap()
  ///     .into();
  /// assert_eq!(request.host(), Some("www.rust-lang.org"));
  /// ```
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Serialize the request for the wire.
  ///
  /// `Content-Length` always reflects the body actually carried, and any
  /// `Transfer-Encoding` is dropped since bodies are held de-chunked.
  pub fn to_raw(&self, target: RequestTarget) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    match target {
      RequestTarget::Origin => {
        http_requests.extend(self.uri.path().as_bytes());
        if let Some(q) = self.uri.query() {
          http_requests.extend([63]);
          http_requests.extend(q.as_bytes());
        }
      }
      RequestTarget::Absolute => http_requests.extend(self.uri.to_string().as_bytes()),
      RequestTarget::Authority => http_requests.extend(self.authority_with_port().as_bytes()),
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    headers.remove(TRANSFER_ENCODING);
    let body_len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
    if body_len > 0 || headers.contains_key(CONTENT_LENGTH) {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      http_requests.extend(b.as_ref());
    }
    Bytes::from(http_requests)
  }
}

impl Request {
  /// Get the HTTP Method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the HTTP Method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the absolute uri of this request.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the uri.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap<HeaderValue> {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap<HeaderValue> {
    &mut self.headers
  }
  /// Get the body, if any.
  #[inline]
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Replace the body; an empty value clears it.
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// The request uri as a string, the form scope patterns are matched against.
  pub fn url(&self) -> String {
    self.uri.to_string()
  }
  /// Host part of the uri.
  pub fn host(&self) -> Option<&str> {
    self.uri.host()
  }
  /// Port of the uri, falling back to the scheme default.
  pub fn port(&self) -> u16 {
    default_port(&self.uri)
  }
  /// Whether the request is aimed at an `https` origin.
  pub fn is_https(&self) -> bool {
    self.uri.scheme() == Some(&http::uri::Scheme::HTTPS)
  }
  /// `host:port`, the form used by `CONNECT`.
  pub fn authority_with_port(&self) -> String {
    format!("{}:{}", self.host().unwrap_or_default(), self.port())
  }
  /// Whether the client wants the connection kept open after this exchange.
  pub fn wants_keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

pub(crate) fn default_port(uri: &http::Uri) -> u16 {
  match uri.port_u16() {
    Some(p) => p,
    None => match uri.scheme_str() {
      Some("https") | Some("wss") => 443,
      Some("socks5") | Some("socks5h") => 1080,
      _ => 80,
    },
  }
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let tokens: Vec<String> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .collect();
  if tokens.iter().any(|t| t == "close") {
    return false;
  }
  if tokens.iter().any(|t| t == "keep-alive") {
    return true;
  }
  version == Version::HTTP_11
}
