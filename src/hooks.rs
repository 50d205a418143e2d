//! Ordered hook chain invoked by the engine around forwarding.
//!
//! The sending phase may rewrite the outgoing request in place. The received
//! phase only observes: the response is already decided, so hooks there get
//! a shared reference and a [`HookHelper`] to raise alerts with.
//!
//! A failing, panicking or slow hook never stops the phase. The failure is
//! logged and recorded on the transaction as a [`HookFailure`].
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertDraft, AlertStore};
use crate::errors::Result;
use crate::transaction::{HookFailure, HttpTransaction, Initiator, Phase, TransactionId};

/// An observer/transformer of transactions.
#[async_trait]
pub trait Hook: Send + Sync {
  /// Name used in logs, failures and alert attribution.
  fn name(&self) -> &str;
  /// Called before forwarding; may edit `tx.request_mut()`.
  async fn on_sending(&self, _tx: &mut HttpTransaction, _initiator: Initiator) -> Result<()> {
    Ok(())
  }
  /// Called once the response is final.
  async fn on_received(
    &self,
    _tx: &HttpTransaction,
    _initiator: Initiator,
    _helper: &HookHelper,
  ) -> Result<()> {
    Ok(())
  }
}

/// What a hook is, so whole groups can be switched at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
  /// plain listener
  Listener,
  /// passive scanner
  PassiveScan,
  /// active scanner
  ActiveScan,
  /// user script
  Script,
}

/// Registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HookId(pub u64);

/// Snapshot of one registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRegistration {
  /// id
  pub id: HookId,
  /// hook name
  pub name: String,
  /// position, lower runs first
  pub ordinal: i32,
  /// kind
  pub kind: HookKind,
  /// whether the hook itself is enabled
  pub enabled: bool,
}

struct HookEntry {
  id: HookId,
  seq: u64,
  ordinal: i32,
  kind: HookKind,
  enabled: AtomicBool,
  hook: Arc<dyn Hook>,
}

/// Given to received-phase hooks.
pub struct HookHelper {
  alerts: Arc<AlertStore>,
  transaction_id: TransactionId,
  initiator: Initiator,
  url: String,
  hook: String,
}

impl HookHelper {
  /// Raise an alert attributed to the current hook and transaction.
  pub fn raise_alert(&self, draft: AlertDraft) -> Alert {
    self.alerts.raise(
      draft,
      self.url.clone(),
      self.transaction_id,
      self.initiator,
      &self.hook,
    )
  }
}

/// Registry plus phase runner.
pub struct HookChain {
  entries: RwLock<Arc<Vec<Arc<HookEntry>>>>,
  disabled_kinds: RwLock<HashSet<HookKind>>,
  next_id: AtomicU64,
  timeout: Option<Duration>,
}

impl Default for HookChain {
  fn default() -> Self {
    HookChain::new(None)
  }
}

impl HookChain {
  /// An empty chain; each hook call is cut off after `timeout` when set.
  pub fn new(timeout: Option<Duration>) -> Self {
    HookChain {
      entries: RwLock::new(Arc::new(Vec::new())),
      disabled_kinds: RwLock::new(HashSet::new()),
      next_id: AtomicU64::new(1),
      timeout,
    }
  }

  /// Add a hook. Lower ordinals run first; equal ordinals run in
  /// registration order.
  pub fn register(&self, hook: Arc<dyn Hook>, ordinal: i32, kind: HookKind) -> HookId {
    let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
    let id = HookId(seq);
    let entry = Arc::new(HookEntry {
      id,
      seq,
      ordinal,
      kind,
      enabled: AtomicBool::new(true),
      hook,
    });
    let mut entries = self.entries.write();
    let mut next: Vec<Arc<HookEntry>> = entries.as_ref().clone();
    next.push(entry);
    next.sort_by_key(|e| (e.ordinal, e.seq));
    *entries = Arc::new(next);
    tracing::debug!(hook = id.0, ordinal, "hook registered");
    id
  }

  /// Remove a hook. Returns false if it was not registered.
  pub fn unregister(&self, id: HookId) -> bool {
    let mut entries = self.entries.write();
    if !entries.iter().any(|e| e.id == id) {
      return false;
    }
    let next: Vec<Arc<HookEntry>> = entries.iter().filter(|e| e.id != id).cloned().collect();
    *entries = Arc::new(next);
    true
  }

  /// Enable or disable one hook; it keeps its position either way.
  pub fn set_enabled(&self, id: HookId, enabled: bool) -> bool {
    match self.snapshot().iter().find(|e| e.id == id) {
      Some(entry) => {
        entry.enabled.store(enabled, Ordering::SeqCst);
        true
      }
      None => false,
    }
  }

  /// Enable or disable every hook of `kind`.
  pub fn set_kind_enabled(&self, kind: HookKind, enabled: bool) {
    let mut disabled = self.disabled_kinds.write();
    if enabled {
      disabled.remove(&kind);
    } else {
      disabled.insert(kind);
    }
  }

  /// Whether hooks of `kind` run.
  pub fn is_kind_enabled(&self, kind: HookKind) -> bool {
    !self.disabled_kinds.read().contains(&kind)
  }

  /// All registrations in invocation order.
  pub fn registrations(&self) -> Vec<HookRegistration> {
    self
      .snapshot()
      .iter()
      .map(|e| HookRegistration {
        id: e.id,
        name: e.hook.name().to_string(),
        ordinal: e.ordinal,
        kind: e.kind,
        enabled: e.enabled.load(Ordering::SeqCst),
      })
      .collect()
  }

  fn snapshot(&self) -> Arc<Vec<Arc<HookEntry>>> {
    self.entries.read().clone()
  }

  fn active(&self) -> Vec<Arc<HookEntry>> {
    let disabled = self.disabled_kinds.read().clone();
    self
      .snapshot()
      .iter()
      .filter(|e| e.enabled.load(Ordering::SeqCst) && !disabled.contains(&e.kind))
      .cloned()
      .collect()
  }

  /// Run every enabled hook's `on_sending` in order.
  pub async fn run_sending_phase(&self, tx: &mut HttpTransaction, initiator: Initiator) {
    let mut failures = Vec::new();
    for entry in self.active() {
      let outcome = self.guarded(entry.hook.on_sending(tx, initiator)).await;
      if let Err(message) = outcome {
        failures.push(self.failure(&entry, tx.id(), Phase::Request, message));
      }
    }
    tx.record_hook_failures(failures);
  }

  /// Run every enabled hook's `on_received` in order.
  pub async fn run_received_phase(
    &self,
    tx: &mut HttpTransaction,
    initiator: Initiator,
    alerts: &Arc<AlertStore>,
  ) {
    let mut failures = Vec::new();
    let url = tx.request().url();
    for entry in self.active() {
      let helper = HookHelper {
        alerts: alerts.clone(),
        transaction_id: tx.id(),
        initiator,
        url: url.clone(),
        hook: entry.hook.name().to_string(),
      };
      let outcome = self.guarded(entry.hook.on_received(tx, initiator, &helper)).await;
      if let Err(message) = outcome {
        failures.push(self.failure(&entry, tx.id(), Phase::Response, message));
      }
    }
    tx.record_hook_failures(failures);
  }

  async fn guarded<F>(&self, call: F) -> std::result::Result<(), String>
  where
    F: Future<Output = Result<()>>,
  {
    let call = AssertUnwindSafe(call).catch_unwind();
    let outcome = match self.timeout {
      Some(limit) => match tokio::time::timeout(limit, call).await {
        Ok(outcome) => outcome,
        Err(_) => return Err(format!("timed out after {limit:?}")),
      },
      None => call.await,
    };
    match outcome {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(e.to_string()),
      Err(panic) => Err(panic_message(panic.as_ref())),
    }
  }

  fn failure(&self, entry: &HookEntry, tx: TransactionId, phase: Phase, message: String) -> HookFailure {
    let hook = entry.hook.name().to_string();
    tracing::warn!(tx = %tx, hook = %hook, ?phase, "hook failed: {}", message);
    HookFailure {
      hook,
      phase,
      message,
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    format!("panicked: {s}")
  } else if let Some(s) = panic.downcast_ref::<String>() {
    format!("panicked: {s}")
  } else {
    "panicked".to_string()
  }
}

/// Logs every transaction at `debug`.
pub struct LoggingHook;

#[async_trait]
impl Hook for LoggingHook {
  fn name(&self) -> &str {
    "logging"
  }
  async fn on_sending(&self, tx: &mut HttpTransaction, initiator: Initiator) -> Result<()> {
    let request = tx.sent_request();
    tracing::debug!(tx = %tx.id(), ?initiator, "{} {}", request.method(), request.uri());
    for (name, value) in request.headers() {
      tracing::trace!(tx = %tx.id(), "  {}: {:?}", name, value);
    }
    Ok(())
  }
  async fn on_received(
    &self,
    tx: &HttpTransaction,
    initiator: Initiator,
    _helper: &HookHelper,
  ) -> Result<()> {
    if let Some(response) = tx.response() {
      tracing::debug!(tx = %tx.id(), ?initiator, state = ?tx.state(), "{}", response.status_code());
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alert::{Confidence, Risk};
  use crate::errors::Error;
  use crate::request::Request;
  use parking_lot::Mutex;

  struct Recorder {
    name: String,
    calls: Arc<Mutex<Vec<String>>>,
  }

  #[async_trait]
  impl Hook for Recorder {
    fn name(&self) -> &str {
      &self.name
    }
    async fn on_sending(&self, tx: &mut HttpTransaction, _initiator: Initiator) -> Result<()> {
      self.calls.lock().push(format!("send:{}", self.name));
      if let Some(request) = tx.request_mut() {
        request
          .headers_mut()
          .append("x-seen", http::HeaderValue::from_str(&self.name).unwrap());
      }
      Ok(())
    }
    async fn on_received(
      &self,
      _tx: &HttpTransaction,
      _initiator: Initiator,
      helper: &HookHelper,
    ) -> Result<()> {
      self.calls.lock().push(format!("recv:{}", self.name));
      helper.raise_alert(AlertDraft::new(self.name.clone(), Risk::Low, Confidence::Low));
      Ok(())
    }
  }

  struct Broken {
    panic: bool,
  }

  #[async_trait]
  impl Hook for Broken {
    fn name(&self) -> &str {
      if self.panic {
        "panicky"
      } else {
        "failing"
      }
    }
    async fn on_sending(&self, _tx: &mut HttpTransaction, _initiator: Initiator) -> Result<()> {
      if self.panic {
        panic!("boom");
      }
      Err(Error::Other("nope".to_string()))
    }
  }

  struct Slow;

  #[async_trait]
  impl Hook for Slow {
    fn name(&self) -> &str {
      "slow"
    }
    async fn on_sending(&self, _tx: &mut HttpTransaction, _initiator: Initiator) -> Result<()> {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(())
    }
  }

  fn tx() -> HttpTransaction {
    let request: Request = Request::builder().uri("http://a.test/").body(()).unwrap().into();
    HttpTransaction::new(request, Initiator::Proxy)
  }

  fn recorder(name: &str, calls: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Hook> {
    Arc::new(Recorder {
      name: name.to_string(),
      calls: calls.clone(),
    })
  }

  #[tokio::test]
  async fn ordinal_then_registration_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let chain = HookChain::default();
    chain.register(recorder("b", &calls), 10, HookKind::Listener);
    chain.register(recorder("a", &calls), 5, HookKind::Listener);
    chain.register(recorder("c", &calls), 10, HookKind::Listener);
    let mut tx = tx();
    chain.run_sending_phase(&mut tx, Initiator::Proxy).await;
    assert_eq!(*calls.lock(), ["send:a", "send:b", "send:c"]);
    let seen: Vec<_> = tx.sent_request().headers().get_all("x-seen").iter().collect();
    assert_eq!(seen, ["a", "b", "c"]);
  }

  #[tokio::test]
  async fn disabled_hooks_keep_their_position() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let chain = HookChain::default();
    chain.register(recorder("a", &calls), 1, HookKind::Listener);
    let b = chain.register(recorder("b", &calls), 2, HookKind::Listener);
    chain.register(recorder("c", &calls), 3, HookKind::Listener);
    assert!(chain.set_enabled(b, false));
    chain.run_sending_phase(&mut tx(), Initiator::Proxy).await;
    assert_eq!(*calls.lock(), ["send:a", "send:c"]);
    calls.lock().clear();
    chain.set_enabled(b, true);
    chain.run_sending_phase(&mut tx(), Initiator::Proxy).await;
    assert_eq!(*calls.lock(), ["send:a", "send:b", "send:c"]);
    assert!(!chain.registrations().is_empty());
    assert!(chain.unregister(b));
    assert!(!chain.set_enabled(b, true));
  }

  #[tokio::test]
  async fn failures_are_isolated_and_recorded() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let chain = HookChain::new(Some(Duration::from_millis(50)));
    chain.register(Arc::new(Broken { panic: false }), 1, HookKind::Script);
    chain.register(Arc::new(Broken { panic: true }), 2, HookKind::Script);
    chain.register(Arc::new(Slow), 3, HookKind::Script);
    chain.register(recorder("after", &calls), 4, HookKind::Listener);
    let mut tx = tx();
    chain.run_sending_phase(&mut tx, Initiator::Proxy).await;
    assert_eq!(*calls.lock(), ["send:after"]);
    let failed: Vec<_> = tx.hook_failures().iter().map(|f| f.hook.as_str()).collect();
    assert_eq!(failed, ["failing", "panicky", "slow"]);
    assert!(tx.hook_failures()[1].message.contains("boom"));
  }

  #[tokio::test]
  async fn kinds_can_be_switched_off_and_alerts_are_attributed() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let alerts = Arc::new(AlertStore::new());
    let chain = HookChain::default();
    chain.register(recorder("pscan", &calls), 1, HookKind::PassiveScan);
    chain.register(recorder("log", &calls), 2, HookKind::Listener);
    chain.set_kind_enabled(HookKind::PassiveScan, false);
    let mut tx = tx();
    chain.run_received_phase(&mut tx, Initiator::Spider, &alerts).await;
    assert_eq!(*calls.lock(), ["recv:log"]);
    chain.set_kind_enabled(HookKind::PassiveScan, true);
    chain.run_received_phase(&mut tx, Initiator::Spider, &alerts).await;
    let raised = alerts.alerts(None, 0, None);
    assert_eq!(raised.len(), 3);
    assert_eq!(raised[2].source_hook, "log");
    assert_eq!(raised[0].initiator, Initiator::Spider);
    assert_eq!(raised[0].transaction_id, tx.id());
    assert_eq!(raised[0].url, "http://a.test/");
  }
}
