use std::fmt::Debug;

use bytes::Bytes;
#[cfg(feature = "charset")]
use encoding_rs::{Encoding, UTF_8};
#[cfg(feature = "gzip")]
use flate2::read::MultiGzDecoder;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE, TRANSFER_ENCODING};
use http::{HeaderValue, Response as HttpResponse, StatusCode};
#[cfg(feature = "charset")]
use mime::Mime;
#[cfg(feature = "gzip")]
use std::io::Read;

use crate::body::Body;
use crate::errors::Result;
use crate::request::keep_alive;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A response, either read from upstream or made up by the proxy.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Response {
  #[serde(with = "http_serde::version")]
  version: http::Version,
  #[serde(with = "http_serde::status_code")]
  status_code: StatusCode,
  #[serde(with = "http_serde::header_map")]
  headers: http::HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  pub(crate) fn from_parts(
    version: http::Version,
    status_code: StatusCode,
    headers: http::HeaderMap,
    body: Option<Body>,
  ) -> Self {
    Response {
      version,
      status_code,
      headers,
      body,
    }
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// A response generated by the proxy itself, with a plain text body
  /// explaining what happened.
  pub fn synthetic<M: Into<String>>(status_code: StatusCode, message: M) -> Response {
    let body = Body::from(message.into());
    let mut headers = http::HeaderMap::new();
    headers.insert(
      CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response {
      version: http::Version::HTTP_11,
      status_code,
      headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
  /// Serialize the response for the client.
  ///
  /// Body bytes are written untouched. Since bodies are held de-chunked the
  /// framing is re-expressed as a `Content-Length`, except for responses that
  /// never carry a body where the upstream header is kept as is.
  pub fn to_raw(&self, head_request: bool) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(format!("{}", self.status_code).as_bytes());
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    if !head_request && self.may_have_body() {
      headers.remove(TRANSFER_ENCODING);
      let len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
      headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if !head_request {
      if let Some(b) = self.body() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  fn may_have_body(&self) -> bool {
    !(self.status_code.is_informational()
      || self.status_code == StatusCode::NO_CONTENT
      || self.status_code == StatusCode::NOT_MODIFIED)
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get a mutable reference to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut StatusCode {
    &mut self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the response body as received.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Replace the body; an empty value clears it.
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// Whether the upstream asked for the connection to be closed.
  pub fn wants_keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
  /// Whether the server agreed to switch protocols (e.g. WebSocket).
  pub fn is_upgrade(&self) -> bool {
    self.status_code == StatusCode::SWITCHING_PROTOCOLS
  }
  /// Parse the `Set-Cookie` headers. Invalid ones are skipped.
  pub fn cookies(&self) -> Vec<cookie::Cookie<'static>> {
    self
      .headers
      .get_all(SET_COOKIE)
      .iter()
      .filter_map(|v| std::str::from_utf8(v.as_bytes()).ok())
      .filter_map(|v| cookie::Cookie::parse(v.to_owned()).ok())
      .collect()
  }
  /// Mark the response so the client connection is closed after it.
  pub(crate) fn close_connection(mut self) -> Self {
    self
      .headers
      .insert(CONNECTION, HeaderValue::from_static("close"));
    self
  }
}

impl Response {
  /// The body with any `gzip` content coding removed, for inspection.
  ///
  /// The body delivered to the client is never altered by this.
  #[cfg(feature = "gzip")]
  pub fn decoded_body(&self) -> Result<Bytes> {
    let body = match &self.body {
      Some(b) => b.clone().into_bytes(),
      None => return Ok(Bytes::new()),
    };
    match self.headers.get(http::header::CONTENT_ENCODING) {
      Some(ce) if ce == "gzip" => {
        let mut gzip_body = Vec::new();
        let mut d = MultiGzDecoder::new(&body[..]);
        d.read_to_end(&mut gzip_body)?;
        Ok(Bytes::from(gzip_body))
      }
      _ => Ok(body),
    }
  }
  /// Body decoded with the charset named in `Content-Type`, falling back to
  /// `default_encoding`. Gzip bodies are inflated first.
  #[cfg(feature = "charset")]
  pub fn text_with_charset(&self, default_encoding: &str) -> Result<String> {
    #[cfg(feature = "gzip")]
    let body = self.decoded_body()?;
    #[cfg(not(feature = "gzip"))]
    let body = self.body.clone().unwrap_or_default().into_bytes();
    let content_type = self
      .headers
      .get(CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.parse::<Mime>().ok());
    let header_encoding = content_type
      .as_ref()
      .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
      .unwrap_or(default_encoding);
    let mut decode_text = String::new();
    for encoding_name in &[header_encoding, default_encoding] {
      let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);
      let (text, _, is_errors) = encoding.decode(&body);
      if !is_errors {
        decode_text = text.to_string();
        break;
      }
    }
    Ok(decode_text)
  }
  /// Get the response text, decoded per the `Content-Type` charset when
  /// the `charset` feature is on, lossy UTF-8 otherwise.
  pub fn text(&self) -> Result<String> {
    #[cfg(feature = "charset")]
    {
      self.text_with_charset("utf-8")
    }
    #[cfg(not(feature = "charset"))]
    Ok(self.body.clone().unwrap_or_default().to_string_lossy())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(feature = "charset")]
  #[test]
  fn text_follows_the_declared_charset() {
    let latin1: Response = Response::builder()
      .header(CONTENT_TYPE, "text/html; charset=iso-8859-1")
      .body(b"caf\xe9".to_vec())
      .unwrap()
      .into();
    assert_eq!(latin1.text_with_charset("utf-8").unwrap(), "caf\u{e9}");
    let undeclared: Response = Response::builder().body("plain").unwrap().into();
    assert_eq!(undeclared.text().unwrap(), "plain");
  }

  #[test]
  fn synthetic_response_is_self_describing() {
    let resp = Response::synthetic(StatusCode::BAD_GATEWAY, "connection refused");
    let raw = String::from_utf8(resp.to_raw(false).to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(raw.contains("content-length: 18\r\n"));
    assert!(raw.ends_with("connection refused"));
  }

  #[test]
  fn chunked_response_is_reframed() {
    let resp: Response = Response::builder()
      .status(200)
      .header(TRANSFER_ENCODING, "chunked")
      .body("hello")
      .unwrap()
      .into();
    let raw = String::from_utf8(resp.to_raw(false).to_vec()).unwrap();
    assert!(!raw.contains("transfer-encoding"));
    assert!(raw.contains("content-length: 5\r\n"));
    let head = String::from_utf8(resp.to_raw(true).to_vec()).unwrap();
    assert!(head.contains("transfer-encoding: chunked"));
    assert!(!head.ends_with("hello"));
  }

  #[test]
  fn parses_set_cookie_headers() {
    let resp: Response = Response::builder()
      .header(SET_COOKIE, "JSESSIONID=abc; Path=/")
      .header(SET_COOKIE, "theme=dark")
      .body(())
      .unwrap()
      .into();
    let names: Vec<String> = resp.cookies().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, vec!["JSESSIONID", "theme"]);
  }
}
