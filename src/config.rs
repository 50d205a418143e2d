//! Proxy configuration.
//!
//! Every section has sensible defaults so a config file only needs the
//! values that differ. Durations are written as milliseconds.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breakpoint::{Supervision, TimeoutAction};
use crate::ca::CaOptions;
use crate::errors::{Error, Result};
use crate::http1::{Limits, Oversize};
use crate::scope::{PatternList, ScopeRules};
use crate::upstream::{ProxyChain, UpstreamProxy};

/// Everything needed to assemble an intercepting proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// where clients connect
  pub listen: ListenConfig,
  /// root CA storage and subject
  pub ca: CaConfig,
  /// TLS interception toward clients and upstream
  pub tls: TlsConfig,
  /// size and connection caps
  pub limits: LimitsConfig,
  /// timeouts
  pub timeouts: TimeoutsConfig,
  /// upstream proxy chain
  pub upstream: UpstreamConfig,
  /// breakpoint supervision
  pub breakpoints: BreakpointsConfig,
  /// scope and exclusions
  pub scope: ScopeConfig,
  /// history recording
  pub history: HistoryConfig,
  /// session tracking
  pub sessions: SessionsConfig,
  /// redirect following for collaborator requests
  pub redirects: RedirectsConfig,
}

/// `[listen]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
  /// listener address
  pub addr: SocketAddr,
}

impl Default for ListenConfig {
  fn default() -> Self {
    ListenConfig {
      addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
    }
  }
}

/// `[ca]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
  /// directory holding `ca_cert.pem` and `ca_key.pem`; in memory when unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dir: Option<PathBuf>,
  /// subject and validity of generated certificates
  #[serde(flatten)]
  pub options: CaOptions,
}

/// What to do with a CONNECT tunnel whose certificate cannot be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsFailurePolicy {
  /// relay the encrypted bytes untouched
  #[default]
  Passthrough,
  /// close the client connection
  Reject,
}

/// `[tls]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
  /// terminate TLS inside CONNECT tunnels
  pub intercept: bool,
  /// host patterns whose tunnels are always relayed untouched
  pub passthrough_hosts: Vec<String>,
  /// applied when a leaf certificate cannot be produced
  pub on_failure: TlsFailurePolicy,
  /// verify upstream server certificates against the webpki roots
  pub verify_upstream: bool,
}

impl Default for TlsConfig {
  fn default() -> Self {
    TlsConfig {
      intercept: true,
      passthrough_hosts: Vec::new(),
      on_failure: TlsFailurePolicy::default(),
      verify_upstream: false,
    }
  }
}

/// What to do with an upstream response body over `max_response_body`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OversizePolicy {
  /// keep the first `max_response_body` bytes and flag the transaction
  #[default]
  Truncate,
  /// fail the transaction
  Abort,
}

impl From<OversizePolicy> for Oversize {
  fn from(value: OversizePolicy) -> Self {
    match value {
      OversizePolicy::Truncate => Oversize::Truncate,
      OversizePolicy::Abort => Oversize::Reject,
    }
  }
}

/// `[limits]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
  /// concurrent client connections
  pub max_connections: usize,
  /// longest request or status line
  pub max_line: usize,
  /// largest header section
  pub max_header_bytes: usize,
  /// largest client request body
  pub max_request_body: usize,
  /// largest upstream response body
  pub max_response_body: usize,
  /// oversize upstream bodies
  pub response_oversize: OversizePolicy,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    let wire = Limits::default();
    LimitsConfig {
      max_connections: 1000,
      max_line: wire.max_line,
      max_header_bytes: wire.max_header_bytes,
      max_request_body: wire.max_body,
      max_response_body: 100 * 1024 * 1024,
      response_oversize: OversizePolicy::default(),
    }
  }
}

impl LimitsConfig {
  /// Limits for reading client requests.
  pub fn request_limits(&self) -> Limits {
    Limits {
      max_line: self.max_line,
      max_header_bytes: self.max_header_bytes,
      max_body: self.max_request_body,
    }
  }
  /// Limits for reading upstream responses.
  pub fn response_limits(&self) -> Limits {
    Limits {
      max_line: self.max_line,
      max_header_bytes: self.max_header_bytes,
      max_body: self.max_response_body,
    }
  }
}

/// `[timeouts]`, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
  /// TCP connect toward upstream or the upstream proxy
  #[serde(with = "duration_ms")]
  pub connect: Duration,
  /// each read/write on an upstream socket
  #[serde(with = "duration_ms")]
  pub io: Duration,
  /// whole response read after the request was written
  #[serde(with = "duration_ms")]
  pub response: Duration,
  /// idle keep-alive client connections
  #[serde(with = "duration_ms")]
  pub client_idle: Duration,
  /// one hook call; 0 means no limit
  #[serde(with = "duration_ms")]
  pub hook: Duration,
}

impl Default for TimeoutsConfig {
  fn default() -> Self {
    TimeoutsConfig {
      connect: Duration::from_secs(10),
      io: Duration::from_secs(30),
      response: Duration::from_secs(60),
      client_idle: Duration::from_secs(60),
      hook: Duration::from_secs(10),
    }
  }
}

impl TimeoutsConfig {
  /// The per-call hook limit, `None` when disabled.
  pub fn hook_limit(&self) -> Option<Duration> {
    Some(self.hook).filter(|d| !d.is_zero())
  }
}

/// `[upstream]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// `http://`, `https://`, `socks5://` or `socks5h://` proxy url
  #[serde(skip_serializing_if = "Option::is_none")]
  pub proxy: Option<String>,
  /// host patterns connected to directly
  pub skip: Vec<String>,
}

impl UpstreamConfig {
  /// The routing described by this section.
  pub fn chain(&self) -> Result<ProxyChain> {
    let proxy = self.proxy.as_deref().map(UpstreamProxy::parse).transpose()?;
    Ok(ProxyChain::new(proxy, PatternList::new(&self.skip)?))
  }
}

/// `[breakpoints]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointsConfig {
  /// longest a transaction stays paused; unset waits forever
  #[serde(
    with = "option_duration_ms",
    skip_serializing_if = "Option::is_none"
  )]
  pub max_pause: Option<Duration>,
  /// decision applied when `max_pause` elapses
  pub on_timeout: TimeoutAction,
  /// most transactions paused at once; unset is unlimited
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_paused: Option<usize>,
  /// also pause requests issued by collaborators, not only browser traffic
  pub apply_to_all_initiators: bool,
}

impl BreakpointsConfig {
  /// Supervision settings for the breakpoint manager.
  pub fn supervision(&self) -> Supervision {
    Supervision {
      max_pause: self.max_pause,
      on_timeout: self.on_timeout,
      max_paused: self.max_paused,
    }
  }
}

/// `[scope]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
  /// url patterns in scope; empty means everything
  pub include: Vec<String>,
  /// url patterns excluded from interception
  pub exclude: Vec<String>,
}

impl ScopeConfig {
  /// Compiled rules.
  pub fn rules(&self) -> Result<ScopeRules> {
    ScopeRules::new(&self.include, &self.exclude)
  }
}

/// `[history]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
  /// JSON lines file; history stays in memory when unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
  /// also record traffic that is out of scope
  pub record_out_of_scope: bool,
}

/// `[sessions]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
  /// inject the active session into proxied requests
  pub apply_to_proxied: bool,
  /// learn session tokens from proxied responses
  pub extract_from_proxied: bool,
  /// token names tracked on top of the built-in list
  pub token_names: Vec<String>,
}

impl Default for SessionsConfig {
  fn default() -> Self {
    SessionsConfig {
      apply_to_proxied: false,
      extract_from_proxied: true,
      token_names: Vec::new(),
    }
  }
}

/// `[redirects]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectsConfig {
  /// most hops followed when a collaborator asks to follow
  pub max_redirects: usize,
  /// keep following when a url repeats
  pub allow_circular: bool,
}

impl Default for RedirectsConfig {
  fn default() -> Self {
    RedirectsConfig {
      max_redirects: 10,
      allow_circular: false,
    }
  }
}

impl ProxyConfig {
  /// Parse a TOML document.
  pub fn from_toml_str(text: &str) -> Result<ProxyConfig> {
    let config: ProxyConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Read and parse a TOML file.
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<ProxyConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    ProxyConfig::from_toml_str(&text)
  }

  /// Render as TOML.
  pub fn to_toml_string(&self) -> Result<String> {
    toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
  }

  /// Check values that would only fail later, at connection time.
  pub fn validate(&self) -> Result<()> {
    let limits = &self.limits;
    if limits.max_connections == 0 {
      return Err(Error::Config("limits.max_connections must be positive".to_string()));
    }
    if limits.max_line == 0 || limits.max_header_bytes == 0 {
      return Err(Error::Config(
        "limits.max_line and limits.max_header_bytes must be positive".to_string(),
      ));
    }
    if self.breakpoints.max_paused == Some(0) {
      return Err(Error::Config(
        "breakpoints.max_paused must be positive or unset".to_string(),
      ));
    }
    if self.ca.options.root_validity_days <= 0 {
      return Err(Error::Config("ca.root_validity_days must be positive".to_string()));
    }
    self
      .upstream
      .chain()
      .map_err(|e| Error::Config(format!("upstream: {e}")))?;
    self
      .scope
      .rules()
      .map_err(|e| Error::Config(format!("scope: {e}")))?;
    PatternList::new(&self.tls.passthrough_hosts)
      .map_err(|e| Error::Config(format!("tls.passthrough_hosts: {e}")))?;
    Ok(())
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

mod option_duration_ms {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
  }
}
