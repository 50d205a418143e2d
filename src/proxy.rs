//! Top-level assembly.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::alert::AlertStore;
use crate::breakpoint::BreakpointManager;
use crate::ca::{CaStore, CertificateAuthority, FileCaStore, MemoryCaStore};
use crate::config::ProxyConfig;
use crate::control::Core;
use crate::engine::{Components, ProxyEngine};
use crate::errors::Result;
use crate::history::{HistoryStore, JsonLinesHistory, MemoryHistory};
use crate::hooks::HookChain;
use crate::scope::Scope;
use crate::server::ProxyServer;
use crate::session::SessionStore;

/// An intercepting proxy wired from one [`ProxyConfig`].
pub struct InterceptingProxy {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  engine: Arc<ProxyEngine>,
  core: Arc<Core>,
}

impl InterceptingProxy {
  /// Build every component. Nothing listens until [`start`](Self::start).
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let store: Arc<dyn CaStore> = match &config.ca.dir {
      Some(dir) => Arc::new(FileCaStore::new(dir)),
      None => Arc::new(MemoryCaStore::new()),
    };
    InterceptingProxy::with_ca_store(config, store).await
  }

  /// Like [`new`](Self::new) but keeping the root CA in `store`.
  pub async fn with_ca_store(config: ProxyConfig, store: Arc<dyn CaStore>) -> Result<Self> {
    let ca = Arc::new(CertificateAuthority::new(store, config.ca.options.clone()));
    let history: Arc<dyn HistoryStore> = match &config.history.path {
      Some(path) => JsonLinesHistory::open(path).await?,
      None => Arc::new(MemoryHistory::new()),
    };
    let components = Components {
      scope: Arc::new(Scope::new(config.scope.rules()?)),
      hooks: Arc::new(HookChain::new(config.timeouts.hook_limit())),
      breakpoints: Arc::new(BreakpointManager::new(config.breakpoints.supervision())),
      sessions: Arc::new(
        SessionStore::default().with_default_token_names(&config.sessions.token_names),
      ),
      history,
      alerts: Arc::new(AlertStore::new()),
    };
    let engine = Arc::new(ProxyEngine::new(&config, components)?);
    let core = Arc::new(Core::new(
      engine.clone(),
      ca.clone(),
      config.redirects.clone(),
    ));
    Ok(InterceptingProxy {
      config,
      ca,
      engine,
      core,
    })
  }

  /// The configuration this proxy was built from.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// The control facade.
  pub fn core(&self) -> Arc<Core> {
    self.core.clone()
  }

  /// Bind `listen.addr` and serve in a background task.
  pub async fn start(&self) -> Result<RunningProxy> {
    let listener = TcpListener::bind(self.config.listen.addr).await?;
    let local_addr = listener.local_addr()?;
    let server = Arc::new(ProxyServer::new(
      &self.config,
      self.engine.clone(),
      self.ca.clone(),
    )?);
    let task = tokio::spawn(async move {
      if let Err(e) = server.run(listener).await {
        tracing::error!("proxy stopped: {}", e);
      }
    });
    Ok(RunningProxy { local_addr, task })
  }
}

/// A proxy serving in the background.
pub struct RunningProxy {
  local_addr: SocketAddr,
  task: JoinHandle<()>,
}

impl RunningProxy {
  /// The bound address, useful when listening on port 0.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections. Connections already accepted run to completion.
  pub fn shutdown(&self) {
    tracing::info!(addr = %self.local_addr, "proxy shutting down");
    self.task.abort();
  }

  /// Wait until the listener stops.
  pub async fn wait(self) {
    let _ = self.task.await;
  }
}
