#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # waylay
//!
//! The `waylay` crate is the core of an intercepting HTTP/HTTPS proxy for
//! security testing.
//!
//! - HTTP/1.x listener with keep-alive and `CONNECT` tunnels
//! - TLS interception with leaf certificates minted by a local [root CA](ca)
//! - [Breakpoints](breakpoint) that pause requests and responses until a
//!   controller continues, edits or drops them
//! - Ordered [hooks](hooks) for listeners and passive scanners, isolated from
//!   each other's failures
//! - Per-site [HTTP sessions](session), [scope and exclusions](scope),
//!   transaction [history](history) and [alerts](alert)
//! - Upstream HTTP, HTTPS and SOCKS5 proxies
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> waylay::Result<()> {
//! let config = waylay::ProxyConfig::from_toml_str(r#"
//!   [listen]
//!   addr = "127.0.0.1:8080"
//!   [ca]
//!   dir = ".waylay"
//! "#)?;
//! let proxy = waylay::InterceptingProxy::new(config).await?;
//! let running = proxy.start().await?;
//! println!("install this root: {}", proxy.core().root_ca_pem().await?);
//! running.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pausing traffic
//!
//! ```rust,no_run
//! # async fn run(core: std::sync::Arc<waylay::Core>) -> waylay::Result<()> {
//! use waylay::breakpoint::{BreakpointRule, Location};
//!
//! core.add_breakpoint(BreakpointRule::new(Location::Url, "/login"))?;
//! let mut paused = core.breakpoints().subscribe();
//! while let Ok(message) = paused.recv().await {
//!   core.continue_message(message.transaction_id)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **cli**: the `waylay` binary.
//! - **charset**: Improved support for decoding text.
//! - **gzip**: Decoding of gzip response bodies for inspection.
//!
/// Alerts raised by hooks
pub mod alert;
mod body;
/// Breakpoints
pub mod breakpoint;
/// Root CA and leaf certificates
pub mod ca;
/// Configuration
pub mod config;
mod connector;
mod control;
mod engine;
mod errors;
/// Transaction history
pub mod history;
/// Hook chain
pub mod hooks;
mod http1;
mod proxy;
/// Redirect Handling
pub mod redirect;
mod request;
mod response;
/// Scope and exclusions
pub mod scope;
mod server;
/// HTTP sessions
pub mod session;
mod socket;
mod tls;
/// Transactions
pub mod transaction;
/// Upstream proxies
pub mod upstream;

pub use body::Body;
pub use config::ProxyConfig;
pub use connector::{Connector, ConnectorBuilder, UpstreamConnection};
pub use control::{BreakType, Core};
pub use engine::{Components, ProxyEngine, SendOptions};
pub use errors::{BreakpointError, Error, ReplyError, Result, SessionError};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use http1::{Limits, Oversize, TunnelTarget};
pub use proxy::{InterceptingProxy, RunningProxy};
pub use request::{Request, RequestTarget};
pub use response::Response;
pub use server::ProxyServer;
pub use socket::Socket;
pub use transaction::{HttpTransaction, Initiator, TransactionId, TransactionState};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
