//! Alerts raised by hooks while observing traffic.
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::transaction::{Initiator, TransactionId};

/// Alert id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertId(pub u64);

/// How bad the finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Risk {
  /// 0
  Informational,
  /// 1
  Low,
  /// 2
  Medium,
  /// 3
  High,
}

/// How sure the hook is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
  /// marked as false positive
  FalsePositive,
  /// low
  Low,
  /// medium
  Medium,
  /// high
  High,
  /// confirmed by a user
  Confirmed,
}

/// What a hook fills in before raising an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDraft {
  /// short title
  pub name: String,
  /// risk
  pub risk: Risk,
  /// confidence
  pub confidence: Confidence,
  /// affected URL, defaults to the transaction's URL
  pub url: Option<String>,
  /// affected parameter
  pub param: Option<String>,
  /// matching evidence
  pub evidence: Option<String>,
  /// longer explanation
  pub description: String,
}

impl AlertDraft {
  /// A draft with the required fields.
  pub fn new<S: Into<String>>(name: S, risk: Risk, confidence: Confidence) -> Self {
    AlertDraft {
      name: name.into(),
      risk,
      confidence,
      url: None,
      param: None,
      evidence: None,
      description: String::new(),
    }
  }
  /// Set the affected URL.
  pub fn url<S: Into<String>>(mut self, url: S) -> Self {
    self.url = Some(url.into());
    self
  }
  /// Set the affected parameter.
  pub fn param<S: Into<String>>(mut self, param: S) -> Self {
    self.param = Some(param.into());
    self
  }
  /// Set the evidence.
  pub fn evidence<S: Into<String>>(mut self, evidence: S) -> Self {
    self.evidence = Some(evidence.into());
    self
  }
  /// Set the description.
  pub fn description<S: Into<String>>(mut self, description: S) -> Self {
    self.description = description.into();
    self
  }
}

/// A stored alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
  /// id
  pub id: AlertId,
  /// short title
  pub name: String,
  /// risk
  pub risk: Risk,
  /// confidence
  pub confidence: Confidence,
  /// affected URL
  pub url: String,
  /// affected parameter
  pub param: Option<String>,
  /// matching evidence
  pub evidence: Option<String>,
  /// longer explanation
  pub description: String,
  /// transaction the alert was raised on
  pub transaction_id: TransactionId,
  /// who issued that transaction
  pub initiator: Initiator,
  /// name of the hook that raised it
  pub source_hook: String,
}

/// All alerts raised so far.
#[derive(Debug)]
pub struct AlertStore {
  alerts: RwLock<Vec<Alert>>,
  next_id: AtomicU64,
}

impl Default for AlertStore {
  fn default() -> Self {
    AlertStore {
      alerts: RwLock::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }
}

impl AlertStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn raise(
    &self,
    draft: AlertDraft,
    url: String,
    transaction_id: TransactionId,
    initiator: Initiator,
    source_hook: &str,
  ) -> Alert {
    let mut alerts = self.alerts.write();
    let alert = Alert {
      id: AlertId(self.next_id.fetch_add(1, Ordering::SeqCst)),
      name: draft.name,
      risk: draft.risk,
      confidence: draft.confidence,
      url: draft.url.unwrap_or(url),
      param: draft.param,
      evidence: draft.evidence,
      description: draft.description,
      transaction_id,
      initiator,
      source_hook: source_hook.to_string(),
    };
    tracing::info!(tx = %transaction_id, hook = source_hook, risk = ?alert.risk, "alert: {}", alert.name);
    alerts.push(alert.clone());
    alert
  }

  /// Alerts whose URL starts with `base_url`, skipping `start` and
  /// returning at most `count`.
  pub fn alerts(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<Alert> {
    self
      .alerts
      .read()
      .iter()
      .filter(|a| base_url.map_or(true, |b| a.url.starts_with(b)))
      .skip(start)
      .take(count.unwrap_or(usize::MAX))
      .cloned()
      .collect()
  }

  /// Number of alerts whose URL starts with `base_url`.
  pub fn count(&self, base_url: Option<&str>) -> usize {
    self
      .alerts
      .read()
      .iter()
      .filter(|a| base_url.map_or(true, |b| a.url.starts_with(b)))
      .count()
  }

  /// The alert with `id`.
  pub fn get(&self, id: AlertId) -> Option<Alert> {
    self.alerts.read().iter().find(|a| a.id == id).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn alerts_are_filtered_and_paged() {
    let store = AlertStore::new();
    for n in 0..4 {
      store.raise(
        AlertDraft::new(format!("a{n}"), Risk::Low, Confidence::Medium),
        format!("http://a.test/{n}"),
        TransactionId(n),
        Initiator::Proxy,
        "pscan",
      );
    }
    store.raise(
      AlertDraft::new("b", Risk::High, Confidence::High).url("http://b.test/"),
      "http://ignored/".to_string(),
      TransactionId(9),
      Initiator::Spider,
      "pscan",
    );
    assert_eq!(store.count(None), 5);
    assert_eq!(store.count(Some("http://a.test")), 4);
    let page = store.alerts(Some("http://a.test"), 1, Some(2));
    assert_eq!(page.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), ["a1", "a2"]);
    let b = store.alerts(Some("http://b.test"), 0, None);
    assert_eq!(b[0].initiator, Initiator::Spider);
    assert_eq!(store.get(b[0].id).unwrap().url, "http://b.test/");
  }
}
