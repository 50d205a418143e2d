//! Client-facing listener.
//!
//! One task per accepted connection. Requests on a connection are handled
//! strictly one after the other; `CONNECT` turns the connection into a
//! tunnel that is either intercepted (TLS terminated with a minted leaf
//! certificate, or plain HTTP) or relayed untouched.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::CONNECTION;
use http::uri::{Authority, Scheme};
use http::{HeaderValue, Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::ca::CertificateAuthority;
use crate::config::{ProxyConfig, TlsFailurePolicy};
use crate::engine::{strip_hop_by_hop, Delivery, ProxyEngine};
use crate::errors::{Error, Result};
use crate::http1::{self, Limits, TunnelTarget};
use crate::request::Request;
use crate::response::Response;
use crate::scope::PatternList;
use crate::transaction::{HttpTransaction, Initiator};

const TLS_HANDSHAKE: u8 = 0x16;
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

/// A client connection at any nesting depth: plain TCP, or TLS inside a
/// tunnel, possibly inside another tunnel.
type ClientStream = BufReader<Box<dyn ClientIo>>;

struct Settings {
  limits: Limits,
  client_idle: Option<Duration>,
  intercept_tls: bool,
  passthrough: PatternList,
  on_tls_failure: TlsFailurePolicy,
}

/// Accepts client connections and feeds their requests to the engine.
pub struct ProxyServer {
  engine: Arc<ProxyEngine>,
  ca: Arc<CertificateAuthority>,
  settings: Settings,
  permits: Arc<Semaphore>,
}

impl ProxyServer {
  /// A server for `engine`, minting tunnel certificates from `ca`.
  pub fn new(
    config: &ProxyConfig,
    engine: Arc<ProxyEngine>,
    ca: Arc<CertificateAuthority>,
  ) -> Result<ProxyServer> {
    Ok(ProxyServer {
      engine,
      ca,
      settings: Settings {
        limits: config.limits.request_limits(),
        client_idle: Some(config.timeouts.client_idle).filter(|d| !d.is_zero()),
        intercept_tls: config.tls.intercept,
        passthrough: PatternList::new(&config.tls.passthrough_hosts)?,
        on_tls_failure: config.tls.on_failure,
      },
      permits: Arc::new(Semaphore::new(config.limits.max_connections)),
    })
  }

  /// Serve connections from `listener` until the task is dropped.
  pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "proxy listening");
    loop {
      let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!("accept failed: {}", e);
          continue;
        }
      };
      let permit = match self.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
          warn!(peer = %peer, "connection limit reached");
          tokio::spawn(reject_busy(stream));
          continue;
        }
      };
      let server = self.clone();
      tokio::spawn(async move {
        let _permit = permit;
        let _ = stream.set_nodelay(true);
        let stream: Box<dyn ClientIo> = Box::new(stream);
        if let Err(e) = server.serve(BufReader::new(stream), peer, None).await {
          debug!(peer = %peer, "connection ended: {}", e);
        }
      });
    }
  }

  fn serve(
    &self,
    mut client: ClientStream,
    peer: SocketAddr,
    tunnel: Option<TunnelTarget>,
  ) -> BoxFuture<'_, Result<()>> {
    async move {
      loop {
        let read = http1::read_request(&mut client, &self.settings.limits, tunnel.as_ref());
        let parsed = match self.settings.client_idle {
          Some(idle) => match tokio::time::timeout(idle, read).await {
            Ok(parsed) => parsed,
            Err(_) => {
              debug!(peer = %peer, "idle connection closed");
              return Ok(());
            }
          },
          None => read.await,
        };
        let request = match parsed {
          Ok(Some(request)) => request,
          Ok(None) => return Ok(()),
          Err(e) => {
            if let Some(status) = e.client_status() {
              debug!(peer = %peer, "rejecting request: {}", e);
              let response = Response::synthetic(status, format!("waylay: {e}")).close_connection();
              write_client(&mut client, &response.to_raw(false)).await?;
            }
            return Err(e);
          }
        };

        if request.method() == Method::CONNECT {
          return self.connect(client, peer, &request).await;
        }

        let head = request.method() == Method::HEAD;
        let keep_alive = request.wants_keep_alive();
        let tx = HttpTransaction::new(request, Initiator::Proxy).with_client_addr(Some(peer));
        let id = tx.id();
        let work = self.engine.process(tx);
        tokio::pin!(work);
        let finished = tokio::select! {
          biased;
          outcome = &mut work => Ok(outcome),
          side = watch_client(&mut client) => Err(side),
        };
        let (tx, delivery) = match finished {
          Ok(outcome) => outcome,
          Err(ClientSide::Gone) => {
            debug!(tx = %id, peer = %peer, "client went away, transaction cancelled");
            return Ok(());
          }
          Err(ClientSide::HalfClosed) => {
            debug!(tx = %id, peer = %peer, "client closed its write side");
            work.await
          }
          Err(ClientSide::Pipelined) => work.await,
        };

        match delivery {
          Delivery::Close => {
            debug!(tx = %id, "dropped, closing client connection");
            return Ok(());
          }
          Delivery::Upgrade(mut upstream) => {
            if let Some(response) = tx.response() {
              write_client(&mut client, &response.to_raw(false)).await?;
            }
            debug!(tx = %id, "protocol switched, relaying");
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            return Ok(());
          }
          Delivery::Respond => {
            let Some(response) = tx.response() else {
              return Ok(());
            };
            let raw = client_response(response, keep_alive).to_raw(head);
            write_client(&mut client, &raw).await?;
            if !keep_alive {
              return Ok(());
            }
          }
        }
      }
    }
    .boxed()
  }

  async fn connect(&self, mut client: ClientStream, peer: SocketAddr, request: &Request) -> Result<()> {
    let authority = request
      .uri()
      .authority()
      .cloned()
      .ok_or_else(|| Error::InvalidRequest("CONNECT without authority".to_string()))?;
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    write_client(&mut client, CONNECTION_ESTABLISHED).await?;

    if !self.settings.intercept_tls || self.settings.passthrough.first_match(&host).is_some() {
      debug!(peer = %peer, host = %host, "relaying tunnel");
      return self.relay(client, &host, port).await;
    }

    let first = match client.fill_buf().await {
      Ok(buf) if !buf.is_empty() => buf[0],
      _ => return Ok(()),
    };
    if first != TLS_HANDSHAKE {
      let target = TunnelTarget {
        authority: tunnel_authority(&host, port, &Scheme::HTTP)?,
        scheme: Scheme::HTTP,
      };
      return self.serve(client, peer, Some(target)).await;
    }

    let sni = host.trim_start_matches('[').trim_end_matches(']');
    let leaf = match self.ca.leaf_for(sni).await {
      Ok(leaf) => leaf,
      Err(e) => match self.settings.on_tls_failure {
        TlsFailurePolicy::Passthrough => {
          warn!(host = %host, "no certificate, relaying tunnel untouched: {}", e);
          return self.relay(client, &host, port).await;
        }
        TlsFailurePolicy::Reject => {
          warn!(host = %host, "no certificate, closing tunnel: {}", e);
          return Err(e);
        }
      },
    };
    let tls = TlsAcceptor::from(leaf.server_config())
      .accept(client)
      .await
      .map_err(|e| {
        warn!(host = %host, peer = %peer, "client TLS handshake failed: {}", e);
        Error::from(e)
      })?;
    let stream: Box<dyn ClientIo> = Box::new(tls);
    let target = TunnelTarget {
      authority: tunnel_authority(&host, port, &Scheme::HTTPS)?,
      scheme: Scheme::HTTPS,
    };
    self.serve(BufReader::new(stream), peer, Some(target)).await
  }

  async fn relay(&self, mut client: ClientStream, host: &str, port: u16) -> Result<()> {
    let mut upstream = self.engine.connector().tunnel(host, port).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
  }
}

/// `host` alone when `port` is the scheme default, so rebuilt urls look
/// the way the browser wrote them.
fn tunnel_authority(host: &str, port: u16, scheme: &Scheme) -> Result<Authority> {
  let default = if *scheme == Scheme::HTTPS { 443 } else { 80 };
  let text = if port == default {
    host.to_string()
  } else {
    format!("{host}:{port}")
  };
  text
    .parse()
    .map_err(|_| Error::InvalidRequest(format!("bad CONNECT target {text:?}")))
}

/// The response as the client should see it: hop-by-hop headers replaced
/// by our own connection decision.
fn client_response(response: &Response, keep_alive: bool) -> Response {
  let mut response = response.clone();
  strip_hop_by_hop(response.headers_mut(), false);
  let connection = if keep_alive { "keep-alive" } else { "close" };
  response
    .headers_mut()
    .insert(CONNECTION, HeaderValue::from_static(connection));
  response
}

/// What the client did while its request was in flight.
#[derive(Debug, PartialEq, Eq)]
enum ClientSide {
  /// sent the next request early
  Pipelined,
  /// shut down its write side; it may still read the response
  HalfClosed,
  /// reset or otherwise failed
  Gone,
}

async fn watch_client<R: AsyncBufRead + Unpin>(client: &mut R) -> ClientSide {
  match client.fill_buf().await {
    Ok([]) => ClientSide::HalfClosed,
    Ok(_) => ClientSide::Pipelined,
    Err(_) => ClientSide::Gone,
  }
}

async fn write_client(client: &mut ClientStream, bytes: &[u8]) -> Result<()> {
  let stream = client.get_mut();
  stream.write_all(bytes).await?;
  stream.flush().await?;
  Ok(())
}

async fn reject_busy(mut stream: TcpStream) {
  let response = Response::synthetic(
    StatusCode::SERVICE_UNAVAILABLE,
    "waylay: too many connections",
  )
  .close_connection();
  let _ = stream.write_all(&response.to_raw(false)).await;
  let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_ports_are_dropped_from_tunnel_urls() {
    assert_eq!(tunnel_authority("a.test", 443, &Scheme::HTTPS).unwrap().as_str(), "a.test");
    assert_eq!(tunnel_authority("a.test", 8443, &Scheme::HTTPS).unwrap().as_str(), "a.test:8443");
    assert_eq!(tunnel_authority("a.test", 443, &Scheme::HTTP).unwrap().as_str(), "a.test:443");
    assert_eq!(tunnel_authority("[::1]", 80, &Scheme::HTTP).unwrap().as_str(), "[::1]");
  }

  #[tokio::test]
  async fn end_of_stream_is_a_half_close() {
    let mut closed: &[u8] = b"";
    assert_eq!(watch_client(&mut closed).await, ClientSide::HalfClosed);
    let mut early: &[u8] = b"GET / HTTP/1.1\r\n";
    assert_eq!(watch_client(&mut early).await, ClientSide::Pipelined);
  }

  #[test]
  fn client_response_carries_our_connection_decision() {
    let upstream: Response = Response::builder()
      .header(CONNECTION, "close")
      .header("keep-alive", "timeout=5")
      .body("ok")
      .unwrap()
      .into();
    let out = client_response(&upstream, true);
    assert_eq!(out.headers()[CONNECTION], "keep-alive");
    assert!(out.headers().get("keep-alive").is_none());
    let raw = String::from_utf8(out.to_raw(false).to_vec()).unwrap();
    assert!(raw.ends_with("\r\n\r\nok"));
  }
}
