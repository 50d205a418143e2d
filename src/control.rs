//! Local control operations, the surface a REST or UI layer wraps.
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertStore};
use crate::breakpoint::{BreakpointId, BreakpointManager, BreakpointRule, Decision, Message, PausedMessage};
use crate::ca::CertificateAuthority;
use crate::config::RedirectsConfig;
use crate::engine::{ProxyEngine, SendOptions};
use crate::errors::{BreakpointError, Error, Result};
use crate::history::{HistoryId, HistoryRecord, HistoryStore};
use crate::hooks::{Hook, HookChain, HookId, HookKind};
use crate::request::Request;
use crate::scope::Scope;
use crate::session::{AuthHelper, Authenticator, Credentials, HttpSession, SessionStore, SiteKey};
use crate::transaction::{HttpTransaction, Initiator, Phase, TransactionId};

/// Which messages `break_on` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakType {
  /// requests and responses
  HttpAll,
  /// requests only
  HttpRequest,
  /// responses only
  HttpResponse,
}

/// Facade over the running proxy's shared state.
pub struct Core {
  engine: Arc<ProxyEngine>,
  ca: Arc<CertificateAuthority>,
  redirects: RedirectsConfig,
}

impl Core {
  /// Control over `engine` and `ca`; `redirects` bounds followed chains.
  pub fn new(engine: Arc<ProxyEngine>, ca: Arc<CertificateAuthority>, redirects: RedirectsConfig) -> Self {
    Core {
      engine,
      ca,
      redirects,
    }
  }

  /// The engine, for collaborators that send with their own initiator.
  pub fn engine(&self) -> &Arc<ProxyEngine> {
    &self.engine
  }
  /// Scope and exclusions.
  pub fn scope(&self) -> &Arc<Scope> {
    self.engine.scope()
  }
  /// Hook chain.
  pub fn hooks(&self) -> &Arc<HookChain> {
    self.engine.hooks()
  }
  /// Breakpoint manager.
  pub fn breakpoints(&self) -> &Arc<BreakpointManager> {
    self.engine.breakpoints()
  }
  /// Session store.
  pub fn session_store(&self) -> &Arc<SessionStore> {
    self.engine.sessions()
  }
  /// History store.
  pub fn history(&self) -> &Arc<dyn HistoryStore> {
    self.engine.history()
  }
  /// Alert store.
  pub fn alert_store(&self) -> &Arc<AlertStore> {
    self.engine.alerts()
  }

  /// Send a manually composed request through the full pipeline.
  pub async fn send_request(&self, request: Request, follow_redirects: bool) -> Result<HttpTransaction> {
    let options = SendOptions {
      follow_redirects,
      max_redirects: self.redirects.max_redirects,
      allow_circular_redirects: self.redirects.allow_circular,
    };
    self
      .engine
      .send_request(request, Initiator::Manual, options)
      .await
  }

  /// Alerts whose url starts with `base_url`.
  pub fn alerts(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<Alert> {
    self.engine.alerts().alerts(base_url, start, count)
  }

  /// Number of alerts whose url starts with `base_url`.
  pub fn number_of_alerts(&self, base_url: Option<&str>) -> usize {
    self.engine.alerts().count(base_url)
  }

  /// History records whose url starts with `base_url`.
  pub fn messages(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<HistoryRecord> {
    self.engine.history().list(base_url, start, count)
  }

  /// One history record.
  pub fn message(&self, id: HistoryId) -> Result<HistoryRecord> {
    self
      .engine
      .history()
      .get(id)
      .ok_or_else(|| Error::History(format!("no history record with id {id}")))
  }

  /// Set or clear the note on a history record.
  pub async fn set_note(&self, id: HistoryId, note: Option<String>) -> Result<()> {
    self.engine.history().set_note(id, note).await
  }

  /// Tag a history record.
  pub async fn add_tag(&self, id: HistoryId, tag: &str) -> Result<bool> {
    self.engine.history().add_tag(id, tag.to_string()).await
  }

  /// Untag a history record.
  pub async fn remove_tag(&self, id: HistoryId, tag: &str) -> Result<bool> {
    self.engine.history().remove_tag(id, tag).await
  }

  /// Break on every message of the given type.
  pub fn break_on(&self, kind: BreakType, on: bool) {
    let breakpoints = self.engine.breakpoints();
    match kind {
      BreakType::HttpAll => {
        breakpoints.set_break_all(Phase::Request, on);
        breakpoints.set_break_all(Phase::Response, on);
      }
      BreakType::HttpRequest => breakpoints.set_break_all(Phase::Request, on),
      BreakType::HttpResponse => breakpoints.set_break_all(Phase::Response, on),
    }
  }

  /// Add a breakpoint rule.
  pub fn add_breakpoint(&self, rule: BreakpointRule) -> Result<BreakpointId> {
    self.engine.breakpoints().register(rule)
  }

  /// Remove a breakpoint rule.
  pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<()> {
    if self.engine.breakpoints().unregister(id) {
      Ok(())
    } else {
      Err(BreakpointError::UnknownRule(id.0).into())
    }
  }

  /// Let a paused transaction go on unchanged.
  pub fn continue_message(&self, id: TransactionId) -> Result<()> {
    self.engine.breakpoints().resolve(id, Decision::Continue)
  }

  /// Drop a paused transaction.
  pub fn drop_message(&self, id: TransactionId) -> Result<()> {
    self.engine.breakpoints().resolve(id, Decision::Drop)
  }

  /// Let a paused transaction go on with an edited message.
  pub fn replace_message(&self, id: TransactionId, message: Message) -> Result<()> {
    self.engine.breakpoints().resolve(id, Decision::Replace(message))
  }

  /// Transactions waiting for a decision.
  pub fn pending_breaks(&self) -> Vec<PausedMessage> {
    self.engine.breakpoints().pending()
  }

  /// Make `session` the active one for `site`.
  pub fn set_active_session(&self, site: &str, session: &str) -> Result<()> {
    self.engine.sessions().set_active(&site.parse()?, session)
  }

  /// Leave `site` without an active session.
  pub fn unset_active_session(&self, site: &str) -> Result<()> {
    self.engine.sessions().unset_active(&site.parse()?);
    Ok(())
  }

  /// Create a session without tokens.
  pub fn create_empty_session(&self, site: &str, name: Option<&str>) -> Result<HttpSession> {
    self.engine.sessions().create_empty(&site.parse()?, name)
  }

  /// Sessions of `site`.
  pub fn sessions(&self, site: &str) -> Result<Vec<HttpSession>> {
    Ok(self.engine.sessions().sessions(&site.parse()?))
  }

  /// Track `token` as a session token for `site`.
  pub fn add_session_token(&self, site: &str, token: &str) -> Result<bool> {
    Ok(self.engine.sessions().add_token_name(&site.parse()?, token))
  }

  /// Stop tracking `token` for `site`.
  pub fn remove_session_token(&self, site: &str, token: &str) -> Result<bool> {
    Ok(self.engine.sessions().remove_token_name(&site.parse()?, token))
  }

  /// Run a login procedure; the session it produces becomes active for the
  /// site of the returned transaction.
  pub async fn authenticate(
    &self,
    authenticator: &dyn Authenticator,
    params: &HashMap<String, String>,
    credentials: &Credentials,
  ) -> Result<HttpTransaction> {
    let helper = AuthHelper::new(self.engine.clone()).follow_redirects(
      self.redirects.max_redirects,
      self.redirects.allow_circular,
    );
    let tx = authenticator.authenticate(&helper, params, credentials).await?;
    let site = SiteKey::from_uri(tx.request().uri())?;
    tracing::info!(site = %site, tx = %tx.id(), "authenticated");
    Ok(tx)
  }

  /// Register a listener or scanner.
  pub fn register_hook(&self, hook: Arc<dyn Hook>, ordinal: i32, kind: HookKind) -> HookId {
    self.engine.hooks().register(hook, ordinal, kind)
  }

  /// Enable or disable every passive scanner.
  pub fn pscan_set_enabled(&self, enabled: bool) {
    self.engine.hooks().set_kind_enabled(HookKind::PassiveScan, enabled);
  }

  /// Exclude urls matching `regex` from interception.
  pub fn exclude_from_proxy(&self, regex: &str) -> Result<()> {
    self.engine.scope().exclude(regex)
  }

  /// Drop every exclusion.
  pub fn clear_excluded_from_proxy(&self) {
    self.engine.scope().clear_exclusions()
  }

  /// Current exclusion patterns.
  pub fn excluded_from_proxy(&self) -> Vec<String> {
    self.engine.scope().snapshot().exclude().patterns().to_vec()
  }

  /// The root certificate clients must trust, PEM encoded.
  pub async fn root_ca_pem(&self) -> Result<String> {
    self.ca.root_pem().await
  }

  /// Replace the root certificate; every previously minted leaf is forgotten.
  pub async fn generate_root_ca(&self) -> Result<String> {
    Ok(self.ca.regenerate_root().await?.pem)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::{CaOptions, MemoryCaStore};
  use crate::config::ProxyConfig;
  use crate::engine::Components;

  fn core() -> Core {
    let engine = ProxyEngine::new(&ProxyConfig::default(), Components::default()).unwrap();
    let ca = CertificateAuthority::new(Arc::new(MemoryCaStore::new()), CaOptions::default());
    Core::new(Arc::new(engine), Arc::new(ca), RedirectsConfig::default())
  }

  #[test]
  fn exclusions_round_trip() {
    let core = core();
    core.exclude_from_proxy(r"\.css$").unwrap();
    assert!(core.exclude_from_proxy("(").is_err());
    assert_eq!(core.excluded_from_proxy(), vec![r"\.css$".to_string()]);
    assert!(!core.scope().is_in_scope("http://a.test/site.css"));
    core.clear_excluded_from_proxy();
    assert!(core.excluded_from_proxy().is_empty());
  }

  #[test]
  fn breakpoint_controls() {
    let core = core();
    core.break_on(BreakType::HttpAll, true);
    assert!(core.breakpoints().is_break_all(Phase::Request));
    assert!(core.breakpoints().is_break_all(Phase::Response));
    core.break_on(BreakType::HttpRequest, false);
    assert!(!core.breakpoints().is_break_all(Phase::Request));
    let id = core
      .add_breakpoint(BreakpointRule::new(crate::breakpoint::Location::Url, "login"))
      .unwrap();
    core.remove_breakpoint(id).unwrap();
    assert!(core.remove_breakpoint(id).is_err());
    assert!(matches!(
      core.continue_message(TransactionId(u64::MAX)),
      Err(Error::Breakpoint(BreakpointError::NotPaused(_)))
    ));
  }

  #[test]
  fn session_controls_parse_sites() {
    let core = core();
    let session = core.create_empty_session("app.test:443", Some("admin")).unwrap();
    core.set_active_session("https://app.test", session.name()).unwrap();
    assert_eq!(core.sessions("https://app.test:443/").unwrap().len(), 1);
    assert!(core.add_session_token("https://app.test", "auth_token").unwrap());
    assert!(core.set_active_session("not a site", "admin").is_err());
  }

  #[test]
  fn session_store_and_site_sessions_agree() {
    let core = core();
    core.create_empty_session("https://shop.test", None).unwrap();
    let site: SiteKey = "https://shop.test".parse().unwrap();
    assert_eq!(core.session_store().sessions(&site).len(), 1);
    assert_eq!(core.sessions("https://shop.test").unwrap().len(), 1);
    assert!(core.sessions("https://other.test").unwrap().is_empty());
  }

  #[tokio::test]
  async fn root_ca_can_be_replaced() {
    let core = core();
    let first = core.root_ca_pem().await.unwrap();
    let second = core.generate_root_ca().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(core.root_ca_pem().await.unwrap(), second);
  }
}
