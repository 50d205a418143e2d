use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use waylay::breakpoint::{BreakpointRule, Location, Message};
use waylay::hooks::{Hook, HookHelper, HookKind};
use waylay::transaction::Phase;
use waylay::{
  Error, HttpTransaction, Initiator, InterceptingProxy, ProxyConfig, RunningProxy, TransactionState,
};

/// What an upstream saw of one request.
#[derive(Debug, Clone)]
struct Seen {
  head: String,
  body: Vec<u8>,
}

struct Upstream {
  addr: SocketAddr,
  seen: Arc<Mutex<Vec<Seen>>>,
}

/// Answers every request with its body, or its path when the body is empty.
async fn upstream(delay: Duration) -> Upstream {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(answer(stream, delay, log.clone()));
    }
  });
  Upstream { addr, seen }
}

/// Like [`upstream`] but behind TLS with a self-signed certificate.
async fn tls_upstream() -> Upstream {
  let key = rcgen::KeyPair::generate().unwrap();
  let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
    .unwrap()
    .self_signed(&key)
    .unwrap();
  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
      vec![CertificateDer::from(cert.der().to_vec())],
      PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
    )
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let log = log.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          answer(tls, Duration::ZERO, log).await;
        }
      });
    }
  });
  Upstream { addr, seen }
}

async fn answer<S: AsyncRead + AsyncWrite + Unpin>(stream: S, delay: Duration, log: Arc<Mutex<Vec<Seen>>>) {
  let mut stream = BufReader::new(stream);
  let Some((head, body)) = read_message(&mut stream).await else {
    return;
  };
  tokio::time::sleep(delay).await;
  let path = head.split(' ').nth(1).unwrap_or_default().to_string();
  let reply = if body.is_empty() {
    path.into_bytes()
  } else {
    body.clone()
  };
  log.lock().push(Seen { head, body });
  let mut out = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Upstream: yes\r\nContent-Length: {}\r\n\r\n",
    reply.len()
  )
  .into_bytes();
  out.extend_from_slice(&reply);
  let _ = stream.get_mut().write_all(&out).await;
  let _ = stream.get_mut().flush().await;
}

/// Accepts connections and never answers.
async fn silent_upstream() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      held.push(stream);
    }
  });
  addr
}

/// Reads a head and a `Content-Length` framed body.
async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<(String, Vec<u8>)> {
  let mut head = String::new();
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
      return None;
    }
    if line == "\r\n" {
      break;
    }
    head.push_str(&line);
  }
  let length = head
    .lines()
    .filter_map(|l| l.split_once(':'))
    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
    .unwrap_or(0);
  let mut body = vec![0; length];
  reader.read_exact(&mut body).await.ok()?;
  Some((head, body))
}

async fn start_proxy<F: FnOnce(&mut ProxyConfig)>(configure: F) -> (InterceptingProxy, RunningProxy) {
  let mut config = ProxyConfig::default();
  config.listen.addr = "127.0.0.1:0".parse().unwrap();
  configure(&mut config);
  let proxy = InterceptingProxy::new(config).await.unwrap();
  let running = proxy.start().await.unwrap();
  (proxy, running)
}

async fn exchange(proxy: SocketAddr, raw: &[u8]) -> (String, Vec<u8>) {
  let mut stream = BufReader::new(TcpStream::connect(proxy).await.unwrap());
  stream.get_mut().write_all(raw).await.unwrap();
  read_message(&mut stream).await.expect("proxy should answer")
}

fn get(upstream: SocketAddr, path: &str) -> Vec<u8> {
  format!("GET http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nConnection: close\r\n\r\n").into_bytes()
}

fn post(upstream: SocketAddr, path: &str, body: &str) -> Vec<u8> {
  format!(
    "POST http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
    body.len()
  )
  .into_bytes()
}

/// A client config trusting only the proxy's root.
fn trusting(root_pem: &str) -> Arc<ClientConfig> {
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let config = ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  Arc::new(config)
}

/// Opens a tunnel and reads the proxy's `200`.
async fn connect_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut established = Vec::new();
  while !established.ends_with(b"\r\n\r\n") {
    established.push(stream.read_u8().await.unwrap());
  }
  assert!(established.starts_with(b"HTTP/1.1 200"));
  stream
}

#[derive(Default)]
struct Counter {
  received: AtomicUsize,
}

#[async_trait]
impl Hook for Counter {
  fn name(&self) -> &str {
    "counter"
  }
  async fn on_received(
    &self,
    _tx: &HttpTransaction,
    _initiator: Initiator,
    _helper: &HookHelper,
  ) -> waylay::Result<()> {
    self.received.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

struct Failing;

#[async_trait]
impl Hook for Failing {
  fn name(&self) -> &str {
    "failing"
  }
  async fn on_received(
    &self,
    _tx: &HttpTransaction,
    _initiator: Initiator,
    _helper: &HookHelper,
  ) -> waylay::Result<()> {
    Err(Error::Other("scanner broke".to_string()))
  }
}

struct Panicking;

#[async_trait]
impl Hook for Panicking {
  fn name(&self) -> &str {
    "panicking"
  }
  async fn on_received(
    &self,
    _tx: &HttpTransaction,
    _initiator: Initiator,
    _helper: &HookHelper,
  ) -> waylay::Result<()> {
    panic!("scanner exploded")
  }
}

#[tokio::test]
async fn plain_get_completes_and_is_recorded() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();

  let (head, body) = exchange(running.local_addr(), &get(upstream.addr, "/first")).await;
  assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
  assert!(head.to_ascii_lowercase().contains("x-upstream: yes"));
  assert_eq!(body, b"/first");

  let (_, body) = exchange(running.local_addr(), &get(upstream.addr, "/second")).await;
  assert_eq!(body, b"/second");

  let records = core.messages(None, 0, None);
  assert_eq!(records.len(), 2, "both transactions should be recorded");
  assert!(records[1].id > records[0].id, "history ids must grow");
  let tx = &records[0].transaction;
  assert_eq!(tx.state(), TransactionState::Completed);
  assert_eq!(tx.initiator(), Initiator::Proxy);
  assert!(tx.trail().contains(&TransactionState::Forwarded));
  assert_eq!(
    tx.response().and_then(|r| r.body().clone()).map(|b| b.to_vec()),
    Some(b"/first".to_vec())
  );
  let forwarded = upstream.seen.lock()[0].clone();
  assert!(forwarded.head.starts_with("GET /first HTTP/1.1"), "origin form upstream: {}", forwarded.head);
  running.shutdown();
}

#[tokio::test]
async fn connect_tunnel_presents_a_minted_certificate() {
  let (proxy, running) = start_proxy(|_| {}).await;
  let pem = proxy.core().root_ca_pem().await.unwrap();

  let stream = connect_tunnel(running.local_addr(), "example.com:443").await;
  let config = trusting(&pem);
  let server_name = ServerName::try_from("example.com").unwrap();
  // verification against the root alone proves issuer and SAN
  let tls = TlsConnector::from(config)
    .connect(server_name, stream)
    .await
    .expect("the leaf should chain to the configured root");
  let (_, connection) = tls.get_ref();
  assert!(connection.peer_certificates().is_some_and(|chain| !chain.is_empty()));
  running.shutdown();
}

#[tokio::test]
async fn paused_request_continues_unmodified() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  core
    .add_breakpoint(BreakpointRule::new(Location::Url, "/login"))
    .unwrap();
  let mut paused = core.breakpoints().subscribe();

  let addr = running.local_addr();
  let raw = post(upstream.addr, "/login", "user=a");
  let client = tokio::spawn(async move { exchange(addr, &raw).await });
  let message = paused.recv().await.unwrap();
  assert_eq!(message.phase, Phase::Request);
  assert_eq!(core.pending_breaks().len(), 1);
  core.continue_message(message.transaction_id).unwrap();

  let (head, body) = client.await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));
  assert_eq!(body, b"user=a");
  assert_eq!(upstream.seen.lock()[0].body, b"user=a");
  assert!(core.continue_message(message.transaction_id).is_err(), "resolve is exactly once");
  running.shutdown();
}

#[tokio::test]
async fn paused_request_can_be_replaced() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  core
    .add_breakpoint(BreakpointRule::new(Location::Url, "/login"))
    .unwrap();
  let mut paused = core.breakpoints().subscribe();

  let addr = running.local_addr();
  let raw = post(upstream.addr, "/login", "user=a");
  let client = tokio::spawn(async move { exchange(addr, &raw).await });
  let message = paused.recv().await.unwrap();
  let mut edited = message.request.clone();
  edited.set_body("user=admin");
  core
    .replace_message(message.transaction_id, Message::Request(edited))
    .unwrap();

  let (_, body) = client.await.unwrap();
  assert_eq!(body, b"user=admin");
  let seen = upstream.seen.lock()[0].clone();
  assert_eq!(seen.body, b"user=admin");
  assert!(seen.head.to_ascii_lowercase().contains("content-length: 10"));

  let record = &core.messages(None, 0, None)[0];
  let original = record.transaction.request().body().clone().unwrap();
  assert_eq!(original.to_vec(), b"user=a".to_vec(), "the received request is kept as it arrived");
  let sent = record.transaction.sent_request().body().clone().unwrap();
  assert_eq!(sent.to_vec(), b"user=admin".to_vec());
  running.shutdown();
}

#[tokio::test]
async fn silent_upstream_fails_with_bad_gateway() {
  let silent = silent_upstream().await;
  let (proxy, running) = start_proxy(|config| {
    config.timeouts.response = Duration::from_millis(300);
  })
  .await;
  let core = proxy.core();
  let counter = Arc::new(Counter::default());
  core.register_hook(counter.clone(), 0, HookKind::Listener);

  let (head, body) = exchange(running.local_addr(), &get(silent, "/slow")).await;
  assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");
  assert!(String::from_utf8_lossy(&body).starts_with("waylay:"));
  assert_eq!(counter.received.load(Ordering::SeqCst), 1, "received hooks run once");
  let record = &core.messages(None, 0, None)[0];
  assert_eq!(record.transaction.state(), TransactionState::Failed);
  running.shutdown();
}

#[tokio::test]
async fn refused_upstream_fails_with_bad_gateway() {
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let (proxy, running) = start_proxy(|_| {}).await;
  let (head, _) = exchange(running.local_addr(), &get(closed, "/")).await;
  assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");
  assert_eq!(
    proxy.core().messages(None, 0, None)[0].transaction.state(),
    TransactionState::Failed
  );
  running.shutdown();
}

#[tokio::test]
async fn slow_upstream_does_not_block_other_connections() {
  let slow = upstream(Duration::from_millis(1500)).await;
  let fast = upstream(Duration::ZERO).await;
  let (_proxy, running) = start_proxy(|_| {}).await;
  let addr = running.local_addr();

  let slow_request = tokio::spawn(async move { exchange(addr, &get(slow.addr, "/slow")).await });
  tokio::time::sleep(Duration::from_millis(100)).await;
  let started = Instant::now();
  let (_, body) = exchange(addr, &get(fast.addr, "/fast")).await;
  assert_eq!(body, b"/fast");
  assert!(
    started.elapsed() < Duration::from_millis(1000),
    "fast request waited {:?}",
    started.elapsed()
  );
  let (_, body) = slow_request.await.unwrap();
  assert_eq!(body, b"/slow");
  running.shutdown();
}

#[tokio::test]
async fn malformed_request_line_gets_bad_request() {
  let (_proxy, running) = start_proxy(|_| {}).await;
  let (head, _) = exchange(running.local_addr(), b"NOT A REQUEST\r\n\r\n").await;
  assert!(head.starts_with("HTTP/1.1 400"), "unexpected head: {head}");
  running.shutdown();
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
  let upstream = upstream(Duration::ZERO).await;
  let (_proxy, running) = start_proxy(|config| {
    config.limits.max_request_body = 16;
  })
  .await;
  let body = "x".repeat(100);
  let (head, _) = exchange(running.local_addr(), &post(upstream.addr, "/upload", &body)).await;
  assert!(head.starts_with("HTTP/1.1 413"), "unexpected head: {head}");
  assert!(upstream.seen.lock().is_empty(), "nothing may reach the upstream");
  running.shutdown();
}

#[tokio::test]
async fn failing_hooks_do_not_stop_later_hooks() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  let counter = Arc::new(Counter::default());
  core.register_hook(Arc::new(Failing), 0, HookKind::PassiveScan);
  core.register_hook(Arc::new(Panicking), 1, HookKind::PassiveScan);
  core.register_hook(counter.clone(), 2, HookKind::Listener);

  let (head, body) = exchange(running.local_addr(), &get(upstream.addr, "/scan")).await;
  assert!(head.starts_with("HTTP/1.1 200"));
  assert_eq!(body, b"/scan");
  assert_eq!(counter.received.load(Ordering::SeqCst), 1);
  let record = &core.messages(None, 0, None)[0];
  assert_eq!(record.transaction.state(), TransactionState::Completed);
  assert_eq!(record.transaction.hook_failures().len(), 2);
  running.shutdown();
}

#[tokio::test]
async fn excluded_urls_are_forwarded_but_not_recorded() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  core.exclude_from_proxy(r"\.css$").unwrap();
  core.break_on(waylay::BreakType::HttpAll, true);

  let (head, body) = exchange(running.local_addr(), &get(upstream.addr, "/site.css")).await;
  assert!(head.starts_with("HTTP/1.1 200"), "excluded traffic never pauses");
  assert_eq!(body, b"/site.css");
  assert!(core.messages(None, 0, None).is_empty());
  running.shutdown();
}

#[tokio::test]
async fn half_closed_client_still_gets_its_response() {
  let upstream = upstream(Duration::from_millis(100)).await;
  let (_proxy, running) = start_proxy(|_| {}).await;
  let mut stream = TcpStream::connect(running.local_addr()).await.unwrap();
  let request = format!("GET http://{0}/half HTTP/1.0\r\nHost: {0}\r\n\r\n", upstream.addr);
  stream.write_all(request.as_bytes()).await.unwrap();
  stream.shutdown().await.unwrap();
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  let raw = String::from_utf8_lossy(&raw);
  assert!(raw.starts_with("HTTP/1.1 200"), "unexpected answer: {raw:?}");
  assert!(raw.ends_with("/half"));
  running.shutdown();
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
  let upstream = upstream(Duration::ZERO).await;
  let (_proxy, running) = start_proxy(|_| {}).await;
  let up = upstream.addr;
  let mut stream = BufReader::new(TcpStream::connect(running.local_addr()).await.unwrap());
  let both = format!(
    "GET http://{up}/one HTTP/1.1\r\nHost: {up}\r\n\r\nGET http://{up}/two HTTP/1.1\r\nHost: {up}\r\nConnection: close\r\n\r\n"
  );
  stream.get_mut().write_all(both.as_bytes()).await.unwrap();

  let (head, body) = read_message(&mut stream).await.unwrap();
  assert_eq!(body, b"/one");
  assert!(head.to_ascii_lowercase().contains("connection: keep-alive"));
  let (head, body) = read_message(&mut stream).await.unwrap();
  assert_eq!(body, b"/two");
  assert!(head.to_ascii_lowercase().contains("connection: close"));
  assert!(read_message(&mut stream).await.is_none(), "the connection closes after the second answer");
  running.shutdown();
}

#[tokio::test]
async fn https_through_an_intercepted_tunnel_is_forwarded_and_recorded() {
  let upstream = tls_upstream().await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  let pem = core.root_ca_pem().await.unwrap();
  let authority = upstream.addr.to_string();

  let stream = connect_tunnel(running.local_addr(), &authority).await;
  let server_name = ServerName::try_from(upstream.addr.ip().to_string()).unwrap();
  let tls = TlsConnector::from(trusting(&pem))
    .connect(server_name, stream)
    .await
    .expect("the minted leaf should cover the IP literal");
  let mut tls = BufReader::new(tls);
  let request = format!("GET /secure?x=1 HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
  tls.get_mut().write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_message(&mut tls).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
  assert_eq!(body, b"/secure?x=1");

  assert!(upstream.seen.lock()[0].head.starts_with("GET /secure?x=1 HTTP/1.1"));
  let record = &core.messages(None, 0, None)[0];
  assert_eq!(record.transaction.request().url(), format!("https://{authority}/secure?x=1"));
  assert_eq!(record.transaction.state(), TransactionState::Completed);
  running.shutdown();
}

#[tokio::test]
async fn client_reset_while_paused_cancels_the_transaction() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let core = proxy.core();
  core
    .add_breakpoint(BreakpointRule::new(Location::Url, "/wait"))
    .unwrap();
  let mut paused = core.breakpoints().subscribe();

  let mut stream = TcpStream::connect(running.local_addr()).await.unwrap();
  stream.write_all(&get(upstream.addr, "/wait")).await.unwrap();
  let message = paused.recv().await.unwrap();
  assert_eq!(core.pending_breaks().len(), 1);

  socket2::SockRef::from(&stream)
    .set_linger(Some(Duration::ZERO))
    .unwrap();
  drop(stream);

  let deadline = Instant::now() + Duration::from_secs(5);
  while !core.pending_breaks().is_empty() {
    assert!(Instant::now() < deadline, "the paused transaction was never cancelled");
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  assert!(core.continue_message(message.transaction_id).is_err());
  assert!(upstream.seen.lock().is_empty(), "nothing may reach the upstream");
  assert!(core.messages(None, 0, None).is_empty());
  running.shutdown();
}

#[tokio::test]
async fn chunked_request_body_is_forwarded_intact() {
  let upstream = upstream(Duration::ZERO).await;
  let (proxy, running) = start_proxy(|_| {}).await;
  let up = upstream.addr;
  let request = format!(
    "POST http://{up}/chunked HTTP/1.1\r\nHost: {up}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n"
  );
  let (head, body) = exchange(running.local_addr(), request.as_bytes()).await;
  assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
  assert_eq!(body, b"hello world");

  let seen = upstream.seen.lock()[0].clone();
  assert_eq!(seen.body, b"hello world");
  let forwarded = seen.head.to_ascii_lowercase();
  assert!(forwarded.contains("content-length: 11"));
  assert!(!forwarded.contains("transfer-encoding"));
  let record = &proxy.core().messages(None, 0, None)[0];
  assert_eq!(record.transaction.request().body().clone().unwrap().to_vec(), b"hello world".to_vec());
  running.shutdown();
}
