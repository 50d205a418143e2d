//! HTTP/1.x message heads and bodies read off a byte stream.
//!
//! Every read is bounded: start line, header section and body each have
//! their own limit so a hostile peer cannot make the proxy buffer without end.
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::{CR_LF, SPACE};

const MAX_CHUNK_LINE: usize = 4096;

/// Size limits applied while reading one message.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
  /// longest accepted start line
  pub max_line: usize,
  /// longest accepted header section
  pub max_header_bytes: usize,
  /// largest accepted body
  pub max_body: usize,
}

impl Default for Limits {
  fn default() -> Self {
    Limits {
      max_line: 8 * 1024,
      max_header_bytes: 64 * 1024,
      max_body: 10 * 1024 * 1024,
    }
  }
}

/// What to do when a body grows past `Limits::max_body`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oversize {
  /// fail with `Error::PayloadTooLarge`
  Reject,
  /// keep the first `max_body` bytes and stop reading
  Truncate,
}

/// Where a request arriving in origin-form is actually going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
  /// `http` for plain tunnels, `https` for intercepted TLS
  pub scheme: Scheme,
  /// `host:port` from the `CONNECT` line
  pub authority: Authority,
}

impl TunnelTarget {
  /// Host part of the authority.
  pub fn host(&self) -> &str {
    self.authority.host()
  }
  /// Port of the authority, 443 when absent.
  pub fn port(&self) -> u16 {
    self.authority.port_u16().unwrap_or(443)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

/// A body plus whether it was cut short.
#[derive(Debug, Default)]
pub(crate) struct BodyRead {
  pub bytes: Bytes,
  pub truncated: bool,
}

/// Read one line including its terminator. Returns 0 on a clean EOF before
/// the first byte.
pub(crate) async fn read_line<R>(reader: &mut R, limit: usize, line: &mut Vec<u8>) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  loop {
    let (done, used) = {
      let available = reader.fill_buf().await?;
      if available.is_empty() {
        if line.is_empty() {
          return Ok(0);
        }
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed mid-line",
        ));
      }
      match available.iter().position(|b| *b == b'\n') {
        Some(i) => {
          line.extend_from_slice(&available[..=i]);
          (true, i + 1)
        }
        None => {
          line.extend_from_slice(available);
          (false, available.len())
        }
      }
    };
    reader.consume(used);
    if line.len() > limit {
      return Err(Error::HeaderTooLarge(limit));
    }
    if done {
      return Ok(line.len());
    }
  }
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Split one header line into name and value.
pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = trim_line(buffer);
  let colon = buffer
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::InvalidRequest("header line without colon".to_string()))?;
  let (name, value) = (&buffer[..colon], &buffer[colon + 1..]);
  let value = value.trim_ascii();
  let name = http::HeaderName::from_bytes(name)
    .map_err(|e| Error::InvalidRequest(format!("bad header name: {e}")))?;
  let value = http::HeaderValue::from_bytes(value)
    .map_err(|e| Error::InvalidRequest(format!("bad header value: {e}")))?;
  Ok((name, value))
}

pub(crate) async fn read_headers<R>(reader: &mut R, limit: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0usize;
  loop {
    let length = read_line(reader, limit, &mut header_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside header section",
      ));
    }
    total += length;
    if total > limit {
      return Err(Error::HeaderTooLarge(limit));
    }
    if trim_line(&header_line).is_empty() {
      break;
    }
    if header_line[0] == b' ' || header_line[0] == b'\t' {
      return Err(Error::InvalidRequest(
        "obsolete header line folding".to_string(),
      ));
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  let mut found: Option<u64> = None;
  for value in headers.get_all(CONTENT_LENGTH) {
    for part in value
      .to_str()
      .map_err(|_| Error::InvalidRequest("non-ascii content-length".to_string()))?
      .split(',')
    {
      let n: u64 = part
        .trim()
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("bad content-length {part:?}")))?;
      match found {
        Some(prev) if prev != n => {
          return Err(Error::InvalidRequest(
            "conflicting content-length values".to_string(),
          ))
        }
        _ => found = Some(n),
      }
    }
  }
  Ok(found)
}

fn is_chunked(headers: &HeaderMap) -> Option<bool> {
  let codings: Vec<String> = headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect();
  if codings.is_empty() {
    return None;
  }
  Some(codings.last().map(|c| c == "chunked").unwrap_or(false))
}

pub(crate) fn request_framing(headers: &HeaderMap) -> Result<Framing> {
  let length = content_length(headers)?;
  match (is_chunked(headers), length) {
    (Some(_), Some(_)) => Err(Error::InvalidRequest(
      "both transfer-encoding and content-length".to_string(),
    )),
    (Some(true), None) => Ok(Framing::Chunked),
    (Some(false), None) => Err(Error::InvalidRequest(
      "transfer-encoding without final chunked coding".to_string(),
    )),
    (None, Some(0)) | (None, None) => Ok(Framing::Empty),
    (None, Some(n)) => Ok(Framing::Length(n)),
  }
}

pub(crate) fn response_framing(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<Framing> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(Framing::Empty);
  }
  match is_chunked(headers) {
    Some(true) => return Ok(Framing::Chunked),
    Some(false) => return Ok(Framing::UntilClose),
    None => {}
  }
  match content_length(headers)? {
    Some(0) => Ok(Framing::Empty),
    Some(n) => Ok(Framing::Length(n)),
    None => Ok(Framing::UntilClose),
  }
}

async fn read_exact_capped<R>(reader: &mut R, want: u64, body: &mut Vec<u8>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let before = body.len();
  (&mut *reader).take(want).read_to_end(body).await?;
  if ((body.len() - before) as u64) < want {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed inside body",
    ));
  }
  Ok(())
}

pub(crate) async fn read_body<R>(
  reader: &mut R,
  framing: Framing,
  max: usize,
  oversize: Oversize,
) -> Result<BodyRead>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut truncated = false;
  match framing {
    Framing::Empty => {}
    Framing::Length(n) => {
      if n > max as u64 {
        if oversize == Oversize::Reject {
          return Err(Error::PayloadTooLarge(max));
        }
        truncated = true;
      }
      read_exact_capped(reader, n.min(max as u64), &mut body).await?;
    }
    Framing::Chunked => {
      let mut line = Vec::new();
      loop {
        if read_line(reader, MAX_CHUNK_LINE, &mut line).await? == 0 {
          return Err(new_io_error(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside chunked body",
          ));
        }
        let size_text = String::from_utf8_lossy(trim_line(&line));
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_text, 16)
          .map_err(|_| Error::InvalidRequest(format!("bad chunk size {size_text:?}")))?;
        if size == 0 {
          // trailers are read and discarded
          loop {
            if read_line(reader, MAX_CHUNK_LINE, &mut line).await? == 0
              || trim_line(&line).is_empty()
            {
              break;
            }
          }
          break;
        }
        let room = (max - body.len()) as u64;
        if size > room {
          if oversize == Oversize::Reject {
            return Err(Error::PayloadTooLarge(max));
          }
          read_exact_capped(reader, room, &mut body).await?;
          truncated = true;
          break;
        }
        read_exact_capped(reader, size, &mut body).await?;
        if read_line(reader, MAX_CHUNK_LINE, &mut line).await? == 0 || !trim_line(&line).is_empty() {
          return Err(Error::InvalidRequest(
            "chunk data not followed by CRLF".to_string(),
          ));
        }
      }
    }
    Framing::UntilClose => {
      (&mut *reader)
        .take(max as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > max {
        if oversize == Oversize::Reject {
          return Err(Error::PayloadTooLarge(max));
        }
        body.truncate(max);
        truncated = true;
      }
    }
  }
  Ok(BodyRead {
    bytes: Bytes::from(body),
    truncated,
  })
}

fn parse_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::InvalidRequest(format!(
      "unsupported version {}",
      v.escape_ascii()
    ))),
  }
}

fn request_uri(
  method: &Method,
  target: &[u8],
  headers: &HeaderMap,
  tunnel: Option<&TunnelTarget>,
) -> Result<Uri> {
  let target = std::str::from_utf8(target)
    .map_err(|_| Error::InvalidRequest("non-utf8 request target".to_string()))?;
  if method == Method::CONNECT {
    let authority: Authority = target
      .parse()
      .map_err(|_| Error::InvalidRequest(format!("bad CONNECT target {target:?}")))?;
    return Ok(Uri::builder().authority(authority).build()?);
  }
  if target.starts_with('/') || target == "*" {
    let (scheme, authority) = match tunnel {
      Some(t) => (t.scheme.clone(), t.authority.clone()),
      None => {
        let host = headers
          .get(HOST)
          .and_then(|h| h.to_str().ok())
          .ok_or_else(|| Error::InvalidRequest("origin-form request without Host".to_string()))?;
        let authority: Authority = host
          .parse()
          .map_err(|_| Error::InvalidRequest(format!("bad Host header {host:?}")))?;
        (Scheme::HTTP, authority)
      }
    };
    let path = if target == "*" { "/" } else { target };
    return Ok(
      Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()?,
    );
  }
  let uri: Uri = target
    .parse()
    .map_err(|_| Error::InvalidRequest(format!("bad request target {target:?}")))?;
  match (uri.scheme_str(), uri.authority()) {
    (Some("http") | Some("https"), Some(_)) => Ok(uri),
    _ => Err(Error::InvalidRequest(format!(
      "unsupported request target {target:?}"
    ))),
  }
}

/// Read one request from a client. `Ok(None)` means the client closed the
/// connection between requests.
pub(crate) async fn read_request<R>(
  reader: &mut R,
  limits: &Limits,
  tunnel: Option<&TunnelTarget>,
) -> Result<Option<Request>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  // tolerate stray CRLF between pipelined requests
  loop {
    let n = match read_line(reader, limits.max_line, &mut line).await {
      Ok(n) => n,
      Err(Error::HeaderTooLarge(_)) => {
        return Err(Error::InvalidRequest("request line too long".to_string()))
      }
      Err(e) => return Err(e),
    };
    if n == 0 {
      return Ok(None);
    }
    if !trim_line(&line).is_empty() {
      break;
    }
  }
  let start = trim_line(&line);
  let parts: Vec<&[u8]> = start.split(|b| b == &SPACE[0]).collect();
  if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
    return Err(Error::InvalidRequest(format!(
      "malformed request line {:?}",
      start.escape_ascii().to_string()
    )));
  }
  let method = Method::from_bytes(parts[0])
    .map_err(|_| Error::InvalidRequest("bad method".to_string()))?;
  let version = parse_version(parts[2])?;
  let headers = read_headers(reader, limits.max_header_bytes).await?;
  let uri = request_uri(&method, parts[1], &headers, tunnel)?;
  let framing = if method == Method::CONNECT {
    Framing::Empty
  } else {
    request_framing(&headers)?
  };
  let body = read_body(reader, framing, limits.max_body, Oversize::Reject).await?;
  let body = if body.bytes.is_empty() {
    None
  } else {
    Some(Body::from(body.bytes))
  };
  Ok(Some(Request::from_parts(method, uri, version, headers, body)))
}

/// Read one final response from upstream, skipping interim `1xx` responses
/// other than `101`.
pub(crate) async fn read_response<R>(
  reader: &mut R,
  method: &Method,
  limits: &Limits,
  oversize: Oversize,
) -> Result<(Response, bool)>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  loop {
    if read_line(reader, limits.max_line, &mut line).await? == 0 {
      return Err(Error::Upstream(
        "connection closed before response".to_string(),
      ));
    }
    let status_line = trim_line(&line);
    let mut parts = status_line.splitn(3, |b| b == &SPACE[0]);
    let version = parse_version(parts.next().unwrap_or_default())
      .map_err(|_| Error::Upstream("invalid http version and status_code data".to_string()))?;
    let status = StatusCode::from_bytes(parts.next().unwrap_or_default())
      .map_err(|_| Error::Upstream("invalid http version and status_code data".to_string()))?;
    let headers = read_headers(reader, limits.max_header_bytes).await?;
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    let framing = response_framing(method, status, &headers)?;
    let body = read_body(reader, framing, limits.max_body, oversize).await?;
    let response = Response::from_parts(
      version,
      status,
      headers,
      if body.bytes.is_empty() {
        None
      } else {
        Some(Body::from(body.bytes))
      },
    );
    return Ok((response, body.truncated));
  }
}

/// Read a bare response head, byte by byte, so nothing past the blank line
/// is consumed. Used for `CONNECT` replies from upstream proxies.
pub(crate) async fn read_head_unbuffered<R>(reader: &mut R, limit: usize) -> Result<StatusCode>
where
  R: tokio::io::AsyncRead + Unpin,
{
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if reader.read(&mut byte).await? == 0 {
      return Err(Error::Upstream(
        "proxy closed the connection during CONNECT".to_string(),
      ));
    }
    head.push(byte[0]);
    if head.len() > limit {
      return Err(Error::HeaderTooLarge(limit));
    }
  }
  let first = head
    .split(|b| *b == CR_LF[1])
    .next()
    .map(trim_line)
    .unwrap_or_default();
  let code = first
    .split(|b| b == &SPACE[0])
    .nth(1)
    .ok_or_else(|| Error::Upstream("bad CONNECT reply".to_string()))?;
  StatusCode::from_bytes(code).map_err(|_| Error::Upstream("bad CONNECT reply".to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  async fn parse(raw: &'static [u8], limits: Limits) -> Result<Option<Request>> {
    let mut reader = BufReader::new(raw);
    read_request(&mut reader, &limits, None).await
  }

  #[tokio::test]
  async fn absolute_form_with_body() {
    let req = parse(
      b"POST http://example.com/login HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello",
      Limits::default(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.url(), "http://example.com/login");
    assert_eq!(req.body().as_ref().unwrap().as_ref(), b"hello");
  }

  #[tokio::test]
  async fn chunked_request_is_dechunked() {
    let req = parse(
      b"PUT /a HTTP/1.1\r\nHost: h:81\r\nTransfer-Encoding: chunked\r\n\r\n3;x=y\r\nabc\r\n2\r\nde\r\n0\r\nTrailer: v\r\n\r\n",
      Limits::default(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(req.url(), "http://h:81/a");
    assert_eq!(req.body().as_ref().unwrap().as_ref(), b"abcde");
  }

  #[tokio::test]
  async fn chunk_without_trailing_crlf_is_rejected() {
    let glued = parse(
      b"PUT /a HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXY\r\n0\r\n\r\n",
      Limits::default(),
    )
    .await;
    assert!(matches!(glued, Err(Error::InvalidRequest(_))));
  }

  #[tokio::test]
  async fn tunnelled_origin_form_uses_tunnel_authority() {
    let tunnel = TunnelTarget {
      scheme: Scheme::HTTPS,
      authority: "example.com:443".parse().unwrap(),
    };
    let mut reader = BufReader::new(&b"GET /x?y=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]);
    let req = read_request(&mut reader, &Limits::default(), Some(&tunnel))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(req.url(), "https://example.com:443/x?y=1");
    assert!(req.is_https());
  }

  #[tokio::test]
  async fn malformed_requests_are_rejected() {
    let bad_line = parse(b"GARBAGE\r\n\r\n", Limits::default()).await;
    assert!(matches!(bad_line, Err(Error::InvalidRequest(_))));
    let smuggle = parse(
      b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
      Limits::default(),
    )
    .await;
    assert!(matches!(smuggle, Err(Error::InvalidRequest(_))));
    let no_host = parse(b"GET / HTTP/1.1\r\n\r\n", Limits::default()).await;
    assert!(matches!(no_host, Err(Error::InvalidRequest(_))));
  }

  #[tokio::test]
  async fn limits_are_enforced() {
    let limits = Limits {
      max_body: 4,
      ..Limits::default()
    };
    let big = parse(
      b"POST http://a/ HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789",
      limits,
    )
    .await;
    assert!(matches!(big, Err(Error::PayloadTooLarge(4))));
    let limits = Limits {
      max_header_bytes: 32,
      ..Limits::default()
    };
    let fat = parse(
      b"GET http://a/ HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n",
      limits,
    )
    .await;
    assert!(matches!(fat, Err(Error::HeaderTooLarge(32))));
  }

  #[tokio::test]
  async fn clean_eof_yields_none() {
    assert!(parse(b"", Limits::default()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn response_skips_continue_and_truncates() {
    let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
    let mut reader = BufReader::new(&raw[..]);
    let limits = Limits {
      max_body: 4,
      ..Limits::default()
    };
    let (resp, truncated) = read_response(&mut reader, &Method::GET, &limits, Oversize::Truncate)
      .await
      .unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert!(truncated);
    assert_eq!(resp.body().as_ref().unwrap().as_ref(), b"0123");
  }

  #[tokio::test]
  async fn response_until_close_and_head() {
    let raw = b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nstream-body";
    let mut reader = BufReader::new(&raw[..]);
    let (resp, _) = read_response(&mut reader, &Method::GET, &Limits::default(), Oversize::Reject)
      .await
      .unwrap();
    assert_eq!(resp.body().as_ref().unwrap().as_ref(), b"stream-body");

    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let (resp, _) = read_response(&mut reader, &Method::HEAD, &Limits::default(), Oversize::Reject)
      .await
      .unwrap();
    assert!(resp.body().is_none());
    assert_eq!(resp.content_length(), Some(99));
  }
}
