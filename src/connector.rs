use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use crate::upstream::{ProxyChain, UpstreamProxy};

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  verify_tls: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  chain: ProxyChain,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      verify_tls: false,
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      chain: ProxyChain::direct(),
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation toward upstream servers.
  ///
  /// Defaults to `false`.
  pub fn verify_tls(mut self, value: bool) -> ConnectorBuilder {
    self.verify_tls = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Timeout for each read during proxy handshakes.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Timeout for each write.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the TCP connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Route connections through an upstream proxy chain.
  pub fn chain(mut self, chain: ProxyChain) -> ConnectorBuilder {
    self.chain = chain;
    self
  }
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = TlsConnector::from(tls::client_config(self.verify_tls)?);
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      chain: Arc::new(self.chain.clone()),
      tls,
    })
  }
}

/// An open upstream connection and how requests must be written on it.
pub struct UpstreamConnection {
  /// the socket, already TLS-wrapped for `https` targets
  pub socket: Socket,
  /// requests go to a plain HTTP proxy and need absolute-form targets
  pub via_http_proxy: bool,
  /// `Proxy-Authorization` to add to each request when `via_http_proxy`
  pub proxy_auth: Option<HeaderValue>,
}

/// Opens upstream connections: direct, via HTTP `CONNECT`, or via SOCKS5.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  chain: Arc<ProxyChain>,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connect to {addr}")))??,
    };
    if self.nodelay {
      s.set_nodelay(self.nodelay)?;
    }
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve `host` and connect to the first address that accepts.
  pub async fn connect_with_host(&self, host: &str, port: u16) -> Result<Socket> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port)).await?.collect();
    let mut last_error = new_io_error(std::io::ErrorKind::NotFound, "no addr for host");
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => last_error = e,
      }
    }
    Err(last_error)
  }

  /// A raw byte stream to `host:port`, honoring the proxy chain.
  pub async fn tunnel(&self, host: &str, port: u16) -> Result<Socket> {
    match self.chain.proxy_for(host) {
      None => self.connect_with_host(host, port).await,
      Some(proxy) => {
        let mut socket = self.open_proxy(proxy).await?;
        match proxy {
          UpstreamProxy::Http(h) => h.tunnel(&mut socket, host, port).await?,
          UpstreamProxy::Socks5(s) => s.tunnel(&mut socket, host, port).await?,
        }
        Ok(socket)
      }
    }
  }

  /// A connection ready to carry a request to `target`.
  ///
  /// Plain `http` targets behind an HTTP proxy are sent to the proxy in
  /// absolute-form; everything else is tunnelled and, for `https`, wrapped
  /// in TLS with the target host as SNI.
  pub async fn connect(&self, target: &http::Uri) -> Result<UpstreamConnection> {
    let host = target
      .host()
      .ok_or(new_io_error(std::io::ErrorKind::InvalidData, "no host in url"))?;
    let port = crate::request::default_port(target);
    let https = target.scheme() == Some(&http::uri::Scheme::HTTPS);
    if !https {
      if let Some(proxy @ UpstreamProxy::Http(h)) = self.chain.proxy_for(host) {
        let socket = self.open_proxy(proxy).await?;
        return Ok(UpstreamConnection {
          socket,
          via_http_proxy: true,
          proxy_auth: h.auth().cloned(),
        });
      }
    }
    let mut socket = self.tunnel(host, port).await?;
    if https {
      socket = self.upgrade_to_tls(socket, host).await?;
    }
    Ok(UpstreamConnection {
      socket,
      via_http_proxy: false,
      proxy_auth: None,
    })
  }

  async fn open_proxy(&self, proxy: &UpstreamProxy) -> Result<Socket> {
    let (host, port) = proxy.host_port();
    let socket = self.connect_with_host(host, port).await?;
    match proxy {
      UpstreamProxy::Http(h) if h.is_https() => self.upgrade_to_tls(socket, h.host()).await,
      _ => Ok(socket),
    }
  }

  /// Wrap `stream` in TLS toward `domain`.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let name = tls::server_name(domain)?;
    stream
      .upgrade(&self.tls, name)
      .await
      .map_err(|e| Error::Upstream(format!("TLS handshake with {domain} failed: {e}")))
  }
}
