//! One request/response exchange and everything recorded about it.
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::request::Request;
use crate::response::Response;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, monotonically assigned transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
  pub(crate) fn next() -> Self {
    TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for TransactionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Which component issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Initiator {
  /// Browser traffic through the listener
  Proxy,
  /// Active scanner
  ActiveScan,
  /// Spider
  Spider,
  /// Fuzzer
  Fuzzer,
  /// Authentication method collaborators
  Authentication,
  /// Manually composed request
  Manual,
  /// Update check
  CheckForUpdates,
  /// User script
  UserScript,
  /// Access control testing
  AccessControl,
}

impl Initiator {
  /// Stable numeric code, as exposed over the control API.
  pub fn code(self) -> u8 {
    match self {
      Initiator::Proxy => 1,
      Initiator::ActiveScan => 2,
      Initiator::Spider => 3,
      Initiator::Fuzzer => 4,
      Initiator::Authentication => 5,
      Initiator::Manual => 6,
      Initiator::CheckForUpdates => 7,
      Initiator::UserScript => 8,
      Initiator::AccessControl => 9,
    }
  }
  /// Inverse of [`Initiator::code`].
  pub fn from_code(code: u8) -> Option<Self> {
    Some(match code {
      1 => Initiator::Proxy,
      2 => Initiator::ActiveScan,
      3 => Initiator::Spider,
      4 => Initiator::Fuzzer,
      5 => Initiator::Authentication,
      6 => Initiator::Manual,
      7 => Initiator::CheckForUpdates,
      8 => Initiator::UserScript,
      9 => Initiator::AccessControl,
      _ => return None,
    })
  }
}

/// Request or response side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
  /// before forwarding
  Request,
  /// after the response arrived
  Response,
}

/// Lifecycle of a transaction inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
  /// Parsed from the client or handed in by a collaborator
  Received,
  /// Scope and exclusions evaluated
  ScopeChecked,
  /// Request breakpoint evaluated (and resolved, if it paused)
  BreakpointRequestPhase,
  /// Request written upstream
  Forwarded,
  /// Response read from upstream
  ResponseReceived,
  /// Response breakpoint evaluated
  BreakpointResponsePhase,
  /// Received-phase hooks ran
  HooksRun,
  /// Done, response delivered
  Completed,
  /// A breakpoint decision ended the transaction early
  ShortCircuited,
  /// Upstream could not be reached or answered badly
  Failed,
}

impl TransactionState {
  /// Whether no further transition is possible.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TransactionState::Completed | TransactionState::ShortCircuited | TransactionState::Failed
    )
  }
}

/// A hook that errored, panicked or timed out while handling a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
  /// Hook name
  pub hook: String,
  /// Phase it failed in
  pub phase: Phase,
  /// What went wrong
  pub message: String,
}

/// A request/response pair plus metadata.
///
/// `request()` is the request exactly as it was received and never changes.
/// The outgoing copy may be edited by sending-phase hooks and breakpoint
/// decisions until a response is attached, after which it is frozen too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransaction {
  id: TransactionId,
  initiator: Initiator,
  state: TransactionState,
  trail: Vec<TransactionState>,
  request: Request,
  outgoing: Request,
  response: Option<Response>,
  created_at: SystemTime,
  sent_at: Option<SystemTime>,
  received_at: Option<SystemTime>,
  client_addr: Option<SocketAddr>,
  in_scope: bool,
  note: Option<String>,
  tags: BTreeSet<String>,
  hook_failures: Vec<HookFailure>,
  error: Option<String>,
  truncated: bool,
}

impl HttpTransaction {
  /// A fresh transaction in state `Received` with a newly assigned id.
  pub fn new(request: Request, initiator: Initiator) -> Self {
    HttpTransaction {
      id: TransactionId::next(),
      initiator,
      state: TransactionState::Received,
      trail: vec![TransactionState::Received],
      outgoing: request.clone(),
      request,
      response: None,
      created_at: SystemTime::now(),
      sent_at: None,
      received_at: None,
      client_addr: None,
      in_scope: true,
      note: None,
      tags: BTreeSet::new(),
      hook_failures: Vec::new(),
      error: None,
      truncated: false,
    }
  }
  pub(crate) fn with_client_addr(mut self, addr: Option<SocketAddr>) -> Self {
    self.client_addr = addr;
    self
  }
  /// Transaction id.
  pub fn id(&self) -> TransactionId {
    self.id
  }
  /// Who issued the request.
  pub fn initiator(&self) -> Initiator {
    self.initiator
  }
  /// Current state.
  pub fn state(&self) -> TransactionState {
    self.state
  }
  /// Every state visited so far, in order.
  pub fn trail(&self) -> &[TransactionState] {
    &self.trail
  }
  /// The request as received.
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// The request as it was (or will be) sent upstream.
  pub fn sent_request(&self) -> &Request {
    &self.outgoing
  }
  /// The outgoing request, editable until a response is attached.
  pub fn request_mut(&mut self) -> Option<&mut Request> {
    if self.response.is_some() {
      None
    } else {
      Some(&mut self.outgoing)
    }
  }
  /// The response, once attached.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  /// When the transaction was created.
  pub fn created_at(&self) -> SystemTime {
    self.created_at
  }
  /// When the request was written upstream.
  pub fn sent_at(&self) -> Option<SystemTime> {
    self.sent_at
  }
  /// When the response was attached.
  pub fn received_at(&self) -> Option<SystemTime> {
    self.received_at
  }
  /// Time between sending and receiving.
  pub fn round_trip(&self) -> Option<Duration> {
    self.received_at?.duration_since(self.sent_at?).ok()
  }
  /// Address of the client connection, for proxied traffic.
  pub fn client_addr(&self) -> Option<SocketAddr> {
    self.client_addr
  }
  /// Whether the scope check passed.
  pub fn in_scope(&self) -> bool {
    self.in_scope
  }
  /// Free text note.
  pub fn note(&self) -> Option<&str> {
    self.note.as_deref()
  }
  /// Set or clear the note.
  pub fn set_note<S: Into<String>>(&mut self, note: Option<S>) {
    self.note = note.map(Into::into);
  }
  /// Tags.
  pub fn tags(&self) -> &BTreeSet<String> {
    &self.tags
  }
  /// Add a tag. Returns false if it was already present.
  pub fn add_tag<S: Into<String>>(&mut self, tag: S) -> bool {
    self.tags.insert(tag.into())
  }
  /// Remove a tag. Returns false if it was absent.
  pub fn remove_tag(&mut self, tag: &str) -> bool {
    self.tags.remove(tag)
  }
  /// Hooks that failed while handling this transaction.
  pub fn hook_failures(&self) -> &[HookFailure] {
    &self.hook_failures
  }
  /// Why the transaction failed, if it did.
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }
  /// Whether the response body was cut at the configured limit.
  pub fn is_truncated(&self) -> bool {
    self.truncated
  }
}

impl HttpTransaction {
  pub(crate) fn advance(&mut self, state: TransactionState) {
    tracing::debug!(tx = %self.id, from = ?self.state, to = ?state, "transition");
    self.state = state;
    self.trail.push(state);
  }
  pub(crate) fn set_in_scope(&mut self, in_scope: bool) {
    self.in_scope = in_scope;
  }
  pub(crate) fn replace_outgoing(&mut self, request: Request) {
    self.outgoing = request;
  }
  pub(crate) fn mark_sent(&mut self) {
    self.sent_at = Some(SystemTime::now());
  }
  pub(crate) fn attach_response(&mut self, response: Response, truncated: bool) {
    self.response = Some(response);
    self.truncated = truncated;
    self.received_at = Some(SystemTime::now());
  }
  pub(crate) fn replace_response(&mut self, response: Response) {
    if self.received_at.is_none() {
      self.received_at = Some(SystemTime::now());
    }
    self.response = Some(response);
  }
  pub(crate) fn fail(&mut self, error: String, response: Response) {
    self.error = Some(error);
    self.replace_response(response);
  }
  pub(crate) fn record_hook_failures(&mut self, failures: Vec<HookFailure>) {
    self.hook_failures.extend(failures);
  }
}
