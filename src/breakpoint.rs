//! Breakpoints: pause matching transactions until a controller decides.
//!
//! A paused transaction only blocks the connection it belongs to. The wait is
//! a oneshot channel owned by [`PendingDecision`]; [`BreakpointManager::resolve`]
//! sends the decision. Dropping the `PendingDecision` (e.g. because the client
//! went away) removes the pause.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::errors::{BreakpointError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transaction::{HttpTransaction, Initiator, Phase, TransactionId};

/// Which part of the message a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
  /// full request URL
  Url,
  /// request header section
  RequestHeader,
  /// request body
  RequestBody,
  /// response header section
  ResponseHeader,
  /// response body
  ResponseBody,
}

impl Location {
  /// The phase a rule on this location applies to by default.
  pub fn phase(self) -> Phase {
    match self {
      Location::Url | Location::RequestHeader | Location::RequestBody => Phase::Request,
      Location::ResponseHeader | Location::ResponseBody => Phase::Response,
    }
  }
}

/// How the pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
  /// substring
  Contains,
  /// regular expression search
  Regex,
}

/// Which transactions a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleScope {
  /// every transaction
  Global,
  /// one transaction only
  Transaction(TransactionId),
}

/// A pause predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRule {
  /// inspected part
  pub location: Location,
  /// text or regex
  pub pattern: String,
  /// how `pattern` is matched
  pub match_kind: MatchKind,
  /// pause when the pattern does NOT match
  pub inverse: bool,
  /// case-insensitive matching
  pub ignore_case: bool,
  /// global or per transaction
  pub scope: RuleScope,
  /// overrides the phase derived from `location`
  pub phase: Option<Phase>,
}

impl BreakpointRule {
  /// A case-sensitive global substring rule.
  pub fn new<S: Into<String>>(location: Location, pattern: S) -> Self {
    BreakpointRule {
      location,
      pattern: pattern.into(),
      match_kind: MatchKind::Contains,
      inverse: false,
      ignore_case: false,
      scope: RuleScope::Global,
      phase: None,
    }
  }
  /// Treat the pattern as a regex.
  pub fn regex(mut self) -> Self {
    self.match_kind = MatchKind::Regex;
    self
  }
  /// Pause when the pattern does not match.
  pub fn inverse(mut self, inverse: bool) -> Self {
    self.inverse = inverse;
    self
  }
  /// Match case-insensitively.
  pub fn ignore_case(mut self, ignore_case: bool) -> Self {
    self.ignore_case = ignore_case;
    self
  }
  /// Restrict to one transaction.
  pub fn scope(mut self, scope: RuleScope) -> Self {
    self.scope = scope;
    self
  }
  /// Force a phase.
  pub fn phase(mut self, phase: Phase) -> Self {
    self.phase = Some(phase);
    self
  }
  /// Phase this rule is evaluated in.
  pub fn effective_phase(&self) -> Phase {
    self.phase.unwrap_or(self.location.phase())
  }
}

/// Rule handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointId(pub u64);

struct CompiledRule {
  id: BreakpointId,
  rule: BreakpointRule,
  regex: Option<Regex>,
  needle: String,
}

fn header_text(headers: &http::HeaderMap) -> String {
  let mut text = String::new();
  for (name, value) in headers {
    text.push_str(name.as_str());
    text.push_str(": ");
    text.push_str(&String::from_utf8_lossy(value.as_bytes()));
    text.push_str("\r\n");
  }
  text
}

impl CompiledRule {
  fn compile(id: BreakpointId, rule: BreakpointRule) -> Result<Self> {
    let regex = match rule.match_kind {
      MatchKind::Regex => Some(
        RegexBuilder::new(&rule.pattern)
          .case_insensitive(rule.ignore_case)
          .build()?,
      ),
      MatchKind::Contains => None,
    };
    let needle = if rule.ignore_case {
      rule.pattern.to_lowercase()
    } else {
      rule.pattern.clone()
    };
    Ok(CompiledRule {
      id,
      rule,
      regex,
      needle,
    })
  }

  fn subject(&self, tx: &HttpTransaction) -> Option<String> {
    let request = tx.sent_request();
    Some(match self.rule.location {
      Location::Url => request.url(),
      Location::RequestHeader => header_text(request.headers()),
      Location::RequestBody => request
        .body()
        .as_ref()
        .map(|b| b.to_string_lossy())
        .unwrap_or_default(),
      Location::ResponseHeader => header_text(tx.response()?.headers()),
      Location::ResponseBody => tx
        .response()?
        .body()
        .as_ref()
        .map(|b| b.to_string_lossy())
        .unwrap_or_default(),
    })
  }

  fn matches(&self, tx: &HttpTransaction, phase: Phase) -> bool {
    if self.rule.effective_phase() != phase {
      return false;
    }
    if let RuleScope::Transaction(id) = self.rule.scope {
      if id != tx.id() {
        return false;
      }
    }
    let Some(subject) = self.subject(tx) else {
      return false;
    };
    let found = match &self.regex {
      Some(regex) => regex.is_match(&subject),
      None if self.rule.ignore_case => subject.to_lowercase().contains(&self.needle),
      None => subject.contains(&self.needle),
    };
    found != self.rule.inverse
  }
}

/// A substitute message supplied by a controller.
#[derive(Debug, Clone)]
pub enum Message {
  /// replace the outgoing request
  Request(Request),
  /// answer with this response
  Response(Response),
}

/// What to do with a paused transaction.
#[derive(Debug, Clone)]
pub enum Decision {
  /// go on unchanged
  Continue,
  /// drop the transaction; the client gets no response
  Drop,
  /// go on with the given message
  Replace(Message),
}

/// What happens when `max_pause` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeoutAction {
  /// continue unchanged
  #[default]
  Continue,
  /// drop the transaction
  Drop,
}

/// Limits on pausing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Supervision {
  /// longest a transaction stays paused; `None` waits forever
  pub max_pause: Option<Duration>,
  /// decision applied when `max_pause` elapses
  pub on_timeout: TimeoutAction,
  /// most transactions paused at once; `None` is unlimited
  pub max_paused: Option<usize>,
}

/// A paused transaction as seen by a controller.
#[derive(Debug, Clone)]
pub struct PausedMessage {
  /// transaction id
  pub transaction_id: TransactionId,
  /// where it is paused
  pub phase: Phase,
  /// who issued it
  pub initiator: Initiator,
  /// the outgoing request at the time of the pause
  pub request: Request,
  /// the response, for response-phase pauses
  pub response: Option<Response>,
  /// when it paused
  pub paused_at: SystemTime,
}

struct Waiter {
  token: u64,
  message: PausedMessage,
  sender: oneshot::Sender<Decision>,
}

type Waiters = Arc<Mutex<HashMap<TransactionId, Waiter>>>;

/// The wait side of a pause.
pub struct PendingDecision {
  id: TransactionId,
  token: u64,
  receiver: Option<oneshot::Receiver<Decision>>,
  waiters: Waiters,
  supervision: Supervision,
}

impl PendingDecision {
  /// Transaction this pause belongs to.
  pub fn transaction_id(&self) -> TransactionId {
    self.id
  }

  /// Wait for the controller (or the supervision timeout).
  pub async fn wait(mut self) -> Decision {
    let Some(receiver) = self.receiver.take() else {
      return Decision::Continue;
    };
    let received = match self.supervision.max_pause {
      None => receiver.await,
      Some(limit) => match tokio::time::timeout(limit, receiver).await {
        Ok(received) => received,
        Err(_) => {
          tracing::warn!(tx = %self.id, "breakpoint not resolved within {:?}", limit);
          return match self.supervision.on_timeout {
            TimeoutAction::Continue => Decision::Continue,
            TimeoutAction::Drop => Decision::Drop,
          };
        }
      },
    };
    // sender gone means the manager released the pause without a decision
    received.unwrap_or(Decision::Continue)
  }
}

impl Drop for PendingDecision {
  fn drop(&mut self) {
    let mut waiters = self.waiters.lock();
    if waiters.get(&self.id).is_some_and(|w| w.token == self.token) {
      waiters.remove(&self.id);
    }
  }
}

/// Rule registry and pause/resume bookkeeping.
pub struct BreakpointManager {
  enabled: AtomicBool,
  break_requests: AtomicBool,
  break_responses: AtomicBool,
  rules: RwLock<Arc<Vec<Arc<CompiledRule>>>>,
  next_rule: AtomicU64,
  next_token: AtomicU64,
  waiters: Waiters,
  events: broadcast::Sender<PausedMessage>,
  supervision: RwLock<Supervision>,
}

impl Default for BreakpointManager {
  fn default() -> Self {
    BreakpointManager::new(Supervision::default())
  }
}

impl BreakpointManager {
  /// An enabled manager without rules.
  pub fn new(supervision: Supervision) -> Self {
    let (events, _) = broadcast::channel(64);
    BreakpointManager {
      enabled: AtomicBool::new(true),
      break_requests: AtomicBool::new(false),
      break_responses: AtomicBool::new(false),
      rules: RwLock::new(Arc::new(Vec::new())),
      next_rule: AtomicU64::new(1),
      next_token: AtomicU64::new(1),
      waiters: Arc::new(Mutex::new(HashMap::new())),
      events,
      supervision: RwLock::new(supervision),
    }
  }

  /// Add a rule.
  pub fn register(&self, rule: BreakpointRule) -> Result<BreakpointId> {
    let id = BreakpointId(self.next_rule.fetch_add(1, Ordering::SeqCst));
    let compiled = Arc::new(CompiledRule::compile(id, rule)?);
    let mut rules = self.rules.write();
    let mut next = rules.as_ref().clone();
    next.push(compiled);
    *rules = Arc::new(next);
    Ok(id)
  }

  /// Remove a rule. Returns false for unknown ids.
  pub fn unregister(&self, id: BreakpointId) -> bool {
    let mut rules = self.rules.write();
    if !rules.iter().any(|r| r.id == id) {
      return false;
    }
    let next = rules.iter().filter(|r| r.id != id).cloned().collect();
    *rules = Arc::new(next);
    true
  }

  /// Registered rules.
  pub fn rules(&self) -> Vec<(BreakpointId, BreakpointRule)> {
    self
      .rules
      .read()
      .iter()
      .map(|r| (r.id, r.rule.clone()))
      .collect()
  }

  /// Turn matching on or off. Turning it off also releases every pause.
  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::SeqCst);
    if !enabled {
      self.release_all();
    }
  }

  /// Whether matching is on.
  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Pause every transaction in `phase`, regardless of rules.
  pub fn set_break_all(&self, phase: Phase, on: bool) {
    match phase {
      Phase::Request => self.break_requests.store(on, Ordering::SeqCst),
      Phase::Response => self.break_responses.store(on, Ordering::SeqCst),
    }
  }

  /// Whether break-all is on for `phase`.
  pub fn is_break_all(&self, phase: Phase) -> bool {
    match phase {
      Phase::Request => self.break_requests.load(Ordering::SeqCst),
      Phase::Response => self.break_responses.load(Ordering::SeqCst),
    }
  }

  /// Replace the pause limits.
  pub fn set_supervision(&self, supervision: Supervision) {
    *self.supervision.write() = supervision;
  }

  /// Current pause limits.
  pub fn supervision(&self) -> Supervision {
    *self.supervision.read()
  }

  /// Whether `tx` should pause in `phase`. Always false while disabled.
  pub fn matches(&self, tx: &HttpTransaction, phase: Phase) -> bool {
    if !self.is_enabled() {
      return false;
    }
    if self.is_break_all(phase) {
      return true;
    }
    let rules = self.rules.read().clone();
    rules.iter().any(|r| r.matches(tx, phase))
  }

  /// Register a pause for `tx`. The caller waits on the returned handle.
  pub fn pause(&self, tx: &HttpTransaction, phase: Phase) -> Result<PendingDecision> {
    let supervision = self.supervision();
    let id = tx.id();
    let mut waiters = self.waiters.lock();
    if waiters.contains_key(&id) {
      return Err(BreakpointError::AlreadyPaused(id).into());
    }
    if let Some(max) = supervision.max_paused {
      if waiters.len() >= max {
        tracing::warn!(tx = %id, "{} transactions already paused, not pausing", max);
        return Err(BreakpointError::TooManyPaused(max).into());
      }
    }
    let (sender, receiver) = oneshot::channel();
    let token = self.next_token.fetch_add(1, Ordering::SeqCst);
    let message = PausedMessage {
      transaction_id: id,
      phase,
      initiator: tx.initiator(),
      request: tx.sent_request().clone(),
      response: tx.response().cloned(),
      paused_at: SystemTime::now(),
    };
    waiters.insert(
      id,
      Waiter {
        token,
        message: message.clone(),
        sender,
      },
    );
    drop(waiters);
    tracing::debug!(tx = %id, ?phase, "paused");
    let _ = self.events.send(message);
    Ok(PendingDecision {
      id,
      token,
      receiver: Some(receiver),
      waiters: self.waiters.clone(),
      supervision,
    })
  }

  /// Hand `decision` to the paused transaction `id`.
  ///
  /// Fails with `NotPaused` when nothing is pending (including a second
  /// resolve) and with `InvalidDecision` when a request is offered to a
  /// response-phase pause; the pause stays in place in that case.
  pub fn resolve(&self, id: TransactionId, decision: Decision) -> Result<()> {
    let mut waiters = self.waiters.lock();
    let waiter = waiters.get(&id).ok_or(BreakpointError::NotPaused(id))?;
    if waiter.message.phase == Phase::Response {
      if let Decision::Replace(Message::Request(_)) = decision {
        return Err(
          BreakpointError::InvalidDecision(
            id,
            "a request cannot replace a message paused in the response phase".to_string(),
          )
          .into(),
        );
      }
    }
    let waiter = waiters.remove(&id).ok_or(BreakpointError::NotPaused(id))?;
    waiter
      .sender
      .send(decision)
      .map_err(|_| BreakpointError::NotPaused(id))?;
    tracing::debug!(tx = %id, "resolved");
    Ok(())
  }

  /// Transactions waiting for a decision, oldest first.
  pub fn pending(&self) -> Vec<PausedMessage> {
    let mut pending: Vec<PausedMessage> = self
      .waiters
      .lock()
      .values()
      .map(|w| w.message.clone())
      .collect();
    pending.sort_by_key(|m| (m.paused_at, m.transaction_id));
    pending
  }

  /// Notifications for every new pause.
  pub fn subscribe(&self) -> broadcast::Receiver<PausedMessage> {
    self.events.subscribe()
  }

  /// Escape hatch: stop matching, clear break-all and release every pause
  /// with `Continue`.
  pub fn disable_all(&self) {
    self.break_requests.store(false, Ordering::SeqCst);
    self.break_responses.store(false, Ordering::SeqCst);
    self.set_enabled(false);
  }

  fn release_all(&self) {
    let released: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
    for waiter in released {
      tracing::debug!(tx = %waiter.message.transaction_id, "released");
      let _ = waiter.sender.send(Decision::Continue);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;
  use http::StatusCode;

  fn tx(url: &str, body: &'static str) -> HttpTransaction {
    let request: Request = Request::builder()
      .method("POST")
      .uri(url)
      .header("X-Token", "Secret")
      .body(body)
      .unwrap()
      .into();
    HttpTransaction::new(request, Initiator::Proxy)
  }

  #[test]
  fn rules_match_by_location_and_flags() {
    let manager = BreakpointManager::default();
    manager.register(BreakpointRule::new(Location::Url, "/login")).unwrap();
    let login = tx("http://a.test/login", "");
    let home = tx("http://a.test/home", "");
    assert!(manager.matches(&login, Phase::Request));
    assert!(!manager.matches(&home, Phase::Request));
    assert!(!manager.matches(&login, Phase::Response));

    let manager = BreakpointManager::default();
    manager
      .register(BreakpointRule::new(Location::RequestHeader, "x-token: secret").ignore_case(true))
      .unwrap();
    assert!(manager.matches(&home, Phase::Request));

    let manager = BreakpointManager::default();
    manager
      .register(BreakpointRule::new(Location::RequestBody, r"^user=\w+$").regex().inverse(true))
      .unwrap();
    assert!(manager.matches(&tx("http://a.test/", "other"), Phase::Request));
    assert!(!manager.matches(&tx("http://a.test/", "user=bob"), Phase::Request));
  }

  #[test]
  fn disabled_manager_never_matches() {
    let manager = BreakpointManager::default();
    manager.register(BreakpointRule::new(Location::Url, "a.test")).unwrap();
    manager.set_break_all(Phase::Request, true);
    let t = tx("http://a.test/", "");
    assert!(manager.matches(&t, Phase::Request));
    manager.set_enabled(false);
    assert!(!manager.matches(&t, Phase::Request));
  }

  #[test]
  fn per_transaction_scope() {
    let manager = BreakpointManager::default();
    let a = tx("http://a.test/", "");
    let b = tx("http://a.test/", "");
    manager
      .register(BreakpointRule::new(Location::Url, "a.test").scope(RuleScope::Transaction(a.id())))
      .unwrap();
    assert!(manager.matches(&a, Phase::Request));
    assert!(!manager.matches(&b, Phase::Request));
  }

  #[test]
  fn response_rules_need_a_response() {
    let manager = BreakpointManager::default();
    let id = manager
      .register(BreakpointRule::new(Location::ResponseBody, "denied"))
      .unwrap();
    let mut t = tx("http://a.test/", "");
    assert!(!manager.matches(&t, Phase::Response));
    t.attach_response(Response::synthetic(StatusCode::FORBIDDEN, "access denied"), false);
    assert!(manager.matches(&t, Phase::Response));
    assert!(manager.unregister(id));
    assert!(!manager.unregister(id));
    assert!(!manager.matches(&t, Phase::Response));
  }

  #[tokio::test]
  async fn resolve_is_exactly_once() {
    let manager = BreakpointManager::default();
    let t = tx("http://a.test/login", "");
    let pending = manager.pause(&t, Phase::Request).unwrap();
    assert!(matches!(
      manager.pause(&t, Phase::Request),
      Err(Error::Breakpoint(BreakpointError::AlreadyPaused(_)))
    ));
    assert_eq!(manager.pending().len(), 1);
    manager.resolve(t.id(), Decision::Continue).unwrap();
    assert!(matches!(pending.wait().await, Decision::Continue));
    assert!(matches!(
      manager.resolve(t.id(), Decision::Drop),
      Err(Error::Breakpoint(BreakpointError::NotPaused(_)))
    ));
    assert!(manager.pending().is_empty());
  }

  #[tokio::test]
  async fn request_cannot_replace_response() {
    let manager = BreakpointManager::default();
    let t = tx("http://a.test/", "");
    let pending = manager.pause(&t, Phase::Response).unwrap();
    let replacement = t.sent_request().clone();
    assert!(matches!(
      manager.resolve(t.id(), Decision::Replace(Message::Request(replacement))),
      Err(Error::Breakpoint(BreakpointError::InvalidDecision(..)))
    ));
    assert_eq!(manager.pending().len(), 1);
    let response = Response::synthetic(StatusCode::OK, "edited");
    manager
      .resolve(t.id(), Decision::Replace(Message::Response(response)))
      .unwrap();
    match pending.wait().await {
      Decision::Replace(Message::Response(r)) => assert_eq!(r.status_code(), StatusCode::OK),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[tokio::test]
  async fn dropping_the_wait_removes_the_pause() {
    let manager = BreakpointManager::default();
    let mut events = manager.subscribe();
    let t = tx("http://a.test/", "");
    let pending = manager.pause(&t, Phase::Request).unwrap();
    assert_eq!(events.recv().await.unwrap().transaction_id, t.id());
    drop(pending);
    assert!(manager.pending().is_empty());
    assert!(manager.resolve(t.id(), Decision::Continue).is_err());
  }

  #[tokio::test]
  async fn supervision_caps_pauses() {
    let manager = BreakpointManager::new(Supervision {
      max_pause: Some(Duration::from_millis(20)),
      on_timeout: TimeoutAction::Drop,
      max_paused: Some(1),
    });
    let a = tx("http://a.test/", "");
    let b = tx("http://a.test/", "");
    let pending = manager.pause(&a, Phase::Request).unwrap();
    assert!(matches!(
      manager.pause(&b, Phase::Request),
      Err(Error::Breakpoint(BreakpointError::TooManyPaused(1)))
    ));
    assert!(matches!(pending.wait().await, Decision::Drop));
    assert!(manager.pending().is_empty());
  }

  #[tokio::test]
  async fn disable_all_releases_everything() {
    let manager = BreakpointManager::default();
    manager.set_break_all(Phase::Response, true);
    let a = tx("http://a.test/", "");
    let pending = manager.pause(&a, Phase::Request).unwrap();
    manager.disable_all();
    assert!(matches!(pending.wait().await, Decision::Continue));
    assert!(!manager.is_break_all(Phase::Response));
    assert!(!manager.is_enabled());
  }
}
