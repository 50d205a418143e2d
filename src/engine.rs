//! The transaction pipeline.
//!
//! Every request, whether it came through the listener or from a
//! collaborator, walks the same states: scope check, request breakpoint,
//! sending hooks, upstream round trip, response breakpoint, received hooks,
//! history.
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, PROXY_AUTHORIZATION, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use tokio::io::BufReader;
use tracing::{debug, warn};

use crate::alert::AlertStore;
use crate::breakpoint::{BreakpointManager, Decision, Message};
use crate::config::ProxyConfig;
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{Error, Result};
use crate::history::{HistoryStore, MemoryHistory};
use crate::hooks::HookChain;
use crate::http1::{self, Limits, Oversize};
use crate::redirect::{self, Action, RedirectPolicy};
use crate::request::{Request, RequestTarget};
use crate::response::Response;
use crate::scope::Scope;
use crate::session::{SessionStore, SiteKey};
use crate::socket::Socket;
use crate::transaction::{HttpTransaction, Initiator, Phase, TransactionState};

const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "upgrade",
];

/// Redirect handling requested by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
  /// follow 3xx responses
  pub follow_redirects: bool,
  /// most hops followed
  pub max_redirects: usize,
  /// keep following when a url repeats
  pub allow_circular_redirects: bool,
}

impl Default for SendOptions {
  fn default() -> Self {
    SendOptions {
      follow_redirects: false,
      max_redirects: 10,
      allow_circular_redirects: false,
    }
  }
}

impl SendOptions {
  fn policy(&self) -> RedirectPolicy {
    if !self.follow_redirects {
      return RedirectPolicy::none();
    }
    RedirectPolicy {
      follow: true,
      max_redirects: self.max_redirects,
      allow_circular: self.allow_circular_redirects,
    }
  }
}

/// The shared state an engine works with.
#[derive(Clone)]
pub struct Components {
  /// scope and exclusions
  pub scope: Arc<Scope>,
  /// listeners and scanners
  pub hooks: Arc<HookChain>,
  /// breakpoints
  pub breakpoints: Arc<BreakpointManager>,
  /// per-site sessions
  pub sessions: Arc<SessionStore>,
  /// transaction history
  pub history: Arc<dyn HistoryStore>,
  /// alerts raised by hooks
  pub alerts: Arc<AlertStore>,
}

impl Default for Components {
  fn default() -> Self {
    Components {
      scope: Arc::new(Scope::default()),
      hooks: Arc::new(HookChain::default()),
      breakpoints: Arc::new(BreakpointManager::default()),
      sessions: Arc::new(SessionStore::default()),
      history: Arc::new(MemoryHistory::new()),
      alerts: Arc::new(AlertStore::new()),
    }
  }
}

/// How the connection handler should finish a transaction.
pub(crate) enum Delivery {
  /// write the transaction's response
  Respond,
  /// close the client connection without a response
  Close,
  /// write the `101` response, then relay bytes to this upstream connection
  Upgrade(BufReader<Socket>),
}

/// Drives transactions through their states.
pub struct ProxyEngine {
  connector: Connector,
  components: Components,
  response_limits: Limits,
  response_oversize: Oversize,
  response_timeout: Option<Duration>,
  record_out_of_scope: bool,
  apply_sessions: bool,
  extract_sessions: bool,
  breakpoints_all_initiators: bool,
}

impl ProxyEngine {
  /// An engine configured from `config` working on `components`.
  pub fn new(config: &ProxyConfig, components: Components) -> Result<ProxyEngine> {
    let io = Some(config.timeouts.io).filter(|d| !d.is_zero());
    let connector = ConnectorBuilder::default()
      .verify_tls(config.tls.verify_upstream)
      .connect_timeout(Some(config.timeouts.connect).filter(|d| !d.is_zero()))
      .read_timeout(io)
      .write_timeout(io)
      .chain(config.upstream.chain()?)
      .build()?;
    Ok(ProxyEngine {
      connector,
      components,
      response_limits: config.limits.response_limits(),
      response_oversize: config.limits.response_oversize.into(),
      response_timeout: Some(config.timeouts.response).filter(|d| !d.is_zero()),
      record_out_of_scope: config.history.record_out_of_scope,
      apply_sessions: config.sessions.apply_to_proxied,
      extract_sessions: config.sessions.extract_from_proxied,
      breakpoints_all_initiators: config.breakpoints.apply_to_all_initiators,
    })
  }

  /// Scope and exclusions.
  pub fn scope(&self) -> &Arc<Scope> {
    &self.components.scope
  }
  /// Hook chain.
  pub fn hooks(&self) -> &Arc<HookChain> {
    &self.components.hooks
  }
  /// Breakpoint manager.
  pub fn breakpoints(&self) -> &Arc<BreakpointManager> {
    &self.components.breakpoints
  }
  /// Session store.
  pub fn sessions(&self) -> &Arc<SessionStore> {
    &self.components.sessions
  }
  /// History store.
  pub fn history(&self) -> &Arc<dyn HistoryStore> {
    &self.components.history
  }
  /// Alert store.
  pub fn alerts(&self) -> &Arc<AlertStore> {
    &self.components.alerts
  }
  pub(crate) fn connector(&self) -> &Connector {
    &self.connector
  }

  /// Send a request on behalf of a collaborator.
  ///
  /// Redirects are followed only when `options` asks for it; the returned
  /// transaction is the last one of the chain.
  pub async fn send_request(
    &self,
    request: Request,
    initiator: Initiator,
    options: SendOptions,
  ) -> Result<HttpTransaction> {
    check_target(request.uri())?;
    let policy = options.policy();
    let pausable = initiator == Initiator::Proxy || self.breakpoints_all_initiators;
    let mut previous: Vec<Uri> = Vec::new();
    let mut request = request;
    loop {
      let (tx, _) = self.run(HttpTransaction::new(request, initiator), pausable).await;
      let hop = match tx.response() {
        Some(response) if tx.state() == TransactionState::Completed && redirect::is_redirect(response) => {
          redirect::location(response, tx.sent_request().uri()).map(|next| (response.status_code(), next))
        }
        _ => None,
      };
      let Some((status, next)) = hop else {
        return Ok(tx);
      };
      previous.push(tx.sent_request().uri().clone());
      if policy.check(&next, &previous) == Action::Stop {
        return Ok(tx);
      }
      debug!(tx = %tx.id(), to = %next, "following redirect");
      request = redirect::next_request(tx.sent_request(), status, next, &previous);
    }
  }

  /// Run a transaction received by the listener.
  pub(crate) async fn process(&self, tx: HttpTransaction) -> (HttpTransaction, Delivery) {
    self.run(tx, true).await
  }

  async fn run(&self, mut tx: HttpTransaction, pausable: bool) -> (HttpTransaction, Delivery) {
    let initiator = tx.initiator();
    let url = tx.request().url();
    let in_scope = self.components.scope.is_in_scope(&url);
    tx.set_in_scope(in_scope);
    tx.advance(TransactionState::ScopeChecked);
    let intercept = in_scope && pausable;
    let site = SiteKey::from_uri(tx.request().uri()).ok();

    if in_scope && self.apply_sessions && initiator == Initiator::Proxy {
      if let (Some(site), Some(request)) = (&site, tx.request_mut()) {
        self.components.sessions.apply_to_request(site, request);
      }
    }

    if intercept {
      match self.break_point(&tx, Phase::Request).await {
        None | Some(Decision::Continue) => {}
        Some(Decision::Drop) => {
          return self
            .short_circuit(tx, TransactionState::BreakpointRequestPhase, Delivery::Close)
            .await
        }
        Some(Decision::Replace(Message::Request(request))) => tx.replace_outgoing(request),
        Some(Decision::Replace(Message::Response(response))) => {
          tx.replace_response(response);
          return self
            .short_circuit(tx, TransactionState::BreakpointRequestPhase, Delivery::Respond)
            .await;
        }
      }
      tx.advance(TransactionState::BreakpointRequestPhase);
    }

    if in_scope {
      self.components.hooks.run_sending_phase(&mut tx, initiator).await;
    }

    tx.advance(TransactionState::Forwarded);
    let upgrade = match self.forward(&mut tx).await {
      Ok(upgrade) => upgrade,
      Err(e) => {
        warn!(tx = %tx.id(), url = %url, "upstream failed: {}", e);
        tx.fail(
          e.to_string(),
          Response::synthetic(StatusCode::BAD_GATEWAY, format!("waylay: {e}")),
        );
        tx.advance(TransactionState::Failed);
        if in_scope {
          self
            .components
            .hooks
            .run_received_phase(&mut tx, initiator, &self.components.alerts)
            .await;
        }
        self.record(&tx).await;
        return (tx, Delivery::Respond);
      }
    };
    tx.advance(TransactionState::ResponseReceived);

    if in_scope && self.extracts(initiator) {
      if let (Some(site), Some(response)) = (&site, tx.response()) {
        self
          .components
          .sessions
          .extract_from_response(site, tx.sent_request(), response);
      }
    }

    if intercept {
      match self.break_point(&tx, Phase::Response).await {
        Some(Decision::Drop) => {
          return self
            .short_circuit(tx, TransactionState::BreakpointResponsePhase, Delivery::Close)
            .await
        }
        Some(Decision::Replace(Message::Response(response))) => tx.replace_response(response),
        _ => {}
      }
      tx.advance(TransactionState::BreakpointResponsePhase);
    }

    if in_scope {
      self
        .components
        .hooks
        .run_received_phase(&mut tx, initiator, &self.components.alerts)
        .await;
      tx.advance(TransactionState::HooksRun);
    }
    tx.advance(TransactionState::Completed);
    self.record(&tx).await;

    let delivery = match upgrade {
      Some(upstream) if tx.response().is_some_and(Response::is_upgrade) => Delivery::Upgrade(upstream),
      _ => Delivery::Respond,
    };
    (tx, delivery)
  }

  fn extracts(&self, initiator: Initiator) -> bool {
    match initiator {
      Initiator::Proxy => self.extract_sessions,
      Initiator::Authentication => true,
      _ => false,
    }
  }

  async fn break_point(&self, tx: &HttpTransaction, phase: Phase) -> Option<Decision> {
    let breakpoints = &self.components.breakpoints;
    if !breakpoints.matches(tx, phase) {
      return None;
    }
    match breakpoints.pause(tx, phase) {
      Ok(pending) => {
        debug!(tx = %tx.id(), ?phase, "paused");
        let decision = pending.wait().await;
        debug!(tx = %tx.id(), ?phase, ?decision, "resumed");
        Some(decision)
      }
      Err(e) => {
        warn!(tx = %tx.id(), "not pausing: {}", e);
        None
      }
    }
  }

  async fn short_circuit(
    &self,
    mut tx: HttpTransaction,
    phase: TransactionState,
    delivery: Delivery,
  ) -> (HttpTransaction, Delivery) {
    tx.advance(phase);
    tx.advance(TransactionState::ShortCircuited);
    self.record(&tx).await;
    (tx, delivery)
  }

  async fn record(&self, tx: &HttpTransaction) {
    if !tx.in_scope() && !self.record_out_of_scope {
      return;
    }
    if let Err(e) = self.components.history.append(tx).await {
      warn!(tx = %tx.id(), "history append failed: {}", e);
    }
  }

  /// Write the outgoing request upstream and read the response into `tx`.
  ///
  /// Returns the upstream connection when the server switched protocols.
  async fn forward(&self, tx: &mut HttpTransaction) -> Result<Option<BufReader<Socket>>> {
    let mut request = tx.sent_request().clone();
    let upgrade = wants_upgrade(request.headers());
    strip_hop_by_hop(request.headers_mut(), upgrade);
    let connection = if upgrade { "upgrade" } else { "close" };
    request
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static(connection));

    let mut upstream = self.connector.connect(request.uri()).await?;
    let target = if upstream.via_http_proxy {
      if let Some(auth) = upstream.proxy_auth.take() {
        request.headers_mut().insert(PROXY_AUTHORIZATION, auth);
      }
      RequestTarget::Absolute
    } else {
      RequestTarget::Origin
    };
    upstream.socket.write_all(&request.to_raw(target)).await?;
    upstream.socket.flush().await?;
    tx.mark_sent();

    let mut reader = BufReader::new(upstream.socket);
    let read = http1::read_response(
      &mut reader,
      request.method(),
      &self.response_limits,
      self.response_oversize,
    );
    let (response, truncated) = match self.response_timeout {
      Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
        Error::Timeout(format!(
          "no response from {} within {:?}",
          request.authority_with_port(),
          limit
        ))
      })??,
      None => read.await?,
    };
    if truncated {
      warn!(tx = %tx.id(), "response body truncated at {} bytes", self.response_limits.max_body);
    }
    let switched = response.is_upgrade();
    tx.attach_response(response, truncated);
    Ok(switched.then_some(reader))
  }
}

fn check_target(uri: &Uri) -> Result<()> {
  match (uri.scheme_str(), uri.host()) {
    (Some("http") | Some("https"), Some(_)) => Ok(()),
    _ => Err(Error::InvalidRequest(format!("not an absolute http(s) url: {uri}"))),
  }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect()
}

/// Whether the message asks to switch protocols.
pub(crate) fn wants_upgrade(headers: &HeaderMap) -> bool {
  headers.contains_key(UPGRADE) && connection_tokens(headers).iter().any(|t| t == "upgrade")
}

/// Remove headers that only apply to one hop, including the ones the
/// `Connection` header names.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
  for token in connection_tokens(headers) {
    if keep_upgrade && token == "upgrade" {
      continue;
    }
    if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
      headers.remove(name);
    }
  }
  for name in HOP_BY_HOP {
    if keep_upgrade && *name == "upgrade" {
      continue;
    }
    headers.remove(*name);
  }
}
