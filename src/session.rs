//! HTTP session tokens per site.
//!
//! Each site (scheme, host, port) has any number of named sessions and at
//! most one active one. Tokens are tracked by name; which names count as
//! session tokens is configurable per site. How tokens are pulled out of a
//! response and put into a request is delegated to a [`SessionManagement`]
//! implementation, cookies by default.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cookie::Cookie;
use dashmap::DashMap;
use http::header::COOKIE;
use http::{HeaderName, HeaderValue, Uri};
use serde::{Deserialize, Serialize};

use crate::engine::{ProxyEngine, SendOptions};
use crate::errors::{Error, Result, SessionError};
use crate::request::Request;
use crate::response::Response;
use crate::transaction::{HttpTransaction, Initiator};

/// Token names tracked for every new site.
pub const DEFAULT_TOKEN_NAMES: &[&str] = &[
  "asp.net_sessionid",
  "aspsessionid",
  "siteserver",
  "cfid",
  "cftoken",
  "jsessionid",
  "phpsessid",
  "sessid",
  "sid",
  "viewstate",
  "zenid",
];

/// `scheme://host:port`, lowercased, default port filled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteKey(String);

impl SiteKey {
  /// Site of an absolute URI.
  pub fn from_uri(uri: &Uri) -> Result<SiteKey> {
    let host = uri
      .host()
      .ok_or_else(|| SessionError::InvalidSite(uri.to_string()))?;
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
      return Err(SessionError::InvalidSite(uri.to_string()).into());
    }
    Ok(SiteKey(format!(
      "{}://{}:{}",
      scheme,
      host.to_ascii_lowercase(),
      crate::request::default_port(uri)
    )))
  }
  /// The key text.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl FromStr for SiteKey {
  type Err = Error;
  /// Accepts `host:port`, `host` or any absolute http(s) URL.
  fn from_str(s: &str) -> Result<SiteKey> {
    let s = s.trim();
    let uri: Uri = if s.contains("://") {
      s.parse()
    } else if s.ends_with(":443") {
      format!("https://{s}").parse()
    } else {
      format!("http://{s}").parse()
    }
    .map_err(|_| SessionError::InvalidSite(s.to_string()))?;
    SiteKey::from_uri(&uri)
  }
}

impl fmt::Display for SiteKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Where a token travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenSource {
  /// `Cookie` / `Set-Cookie`
  Cookie,
  /// a request header of the same name
  Header,
}

/// One session token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
  /// name as seen on the wire
  pub name: String,
  /// value
  pub value: String,
  /// cookie or header
  pub source: TokenSource,
}

/// A named set of token values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSession {
  name: String,
  tokens: BTreeMap<String, SessionToken>,
}

impl HttpSession {
  fn new<S: Into<String>>(name: S) -> Self {
    HttpSession {
      name: name.into(),
      tokens: BTreeMap::new(),
    }
  }
  /// Session name.
  pub fn name(&self) -> &str {
    &self.name
  }
  /// Tokens by lowercase name.
  pub fn tokens(&self) -> impl Iterator<Item = &SessionToken> {
    self.tokens.values()
  }
  /// Token value by name, case-insensitively.
  pub fn token(&self, name: &str) -> Option<&SessionToken> {
    self.tokens.get(&name.to_ascii_lowercase())
  }
  fn set_token(&mut self, token: SessionToken) -> bool {
    let key = token.name.to_ascii_lowercase();
    if self.tokens.get(&key) == Some(&token) {
      return false;
    }
    self.tokens.insert(key, token);
    true
  }
  fn remove_token(&mut self, name: &str) -> bool {
    self.tokens.remove(&name.to_ascii_lowercase()).is_some()
  }
  fn matches_tokens(&self, tokens: &[SessionToken]) -> bool {
    !tokens.is_empty()
      && tokens
        .iter()
        .all(|t| self.token(&t.name).is_some_and(|mine| mine.value == t.value))
  }
}

/// Pulls tokens out of traffic and injects them back.
pub trait SessionManagement: Send + Sync {
  /// Tokens in `response` (for `request`) whose names are tracked.
  fn extract_web_session(
    &self,
    token_names: &BTreeSet<String>,
    request: &Request,
    response: &Response,
  ) -> Vec<SessionToken>;
  /// Remove every tracked token from `request`.
  fn clear_web_session_identifiers(&self, token_names: &BTreeSet<String>, request: &mut Request);
  /// Make `request` carry `session`'s tokens. Returns whether anything was set.
  fn process_message_to_match_session(
    &self,
    session: &HttpSession,
    token_names: &BTreeSet<String>,
    request: &mut Request,
  ) -> bool;
}

/// Session tokens carried in cookies.
#[derive(Debug, Default, Clone, Copy)]
pub struct CookieSessionManagement;

fn cookie_pairs(request: &Request) -> Vec<(String, String)> {
  let mut pairs = Vec::new();
  for value in request.headers().get_all(COOKIE) {
    let Ok(text) = value.to_str() else {
      continue;
    };
    for cookie in Cookie::split_parse(text).flatten() {
      pairs.push((cookie.name().to_string(), cookie.value().to_string()));
    }
  }
  pairs
}

fn write_cookie_header(request: &mut Request, pairs: &[(String, String)]) {
  request.headers_mut().remove(COOKIE);
  if pairs.is_empty() {
    return;
  }
  let text = pairs
    .iter()
    .map(|(n, v)| format!("{n}={v}"))
    .collect::<Vec<_>>()
    .join("; ");
  if let Ok(value) = HeaderValue::from_str(&text) {
    request.headers_mut().insert(COOKIE, value);
  }
}

impl SessionManagement for CookieSessionManagement {
  fn extract_web_session(
    &self,
    token_names: &BTreeSet<String>,
    _request: &Request,
    response: &Response,
  ) -> Vec<SessionToken> {
    response
      .cookies()
      .into_iter()
      .filter(|c| token_names.contains(&c.name().to_ascii_lowercase()))
      .map(|c| SessionToken {
        name: c.name().to_string(),
        value: c.value().to_string(),
        source: TokenSource::Cookie,
      })
      .collect()
  }

  fn clear_web_session_identifiers(&self, token_names: &BTreeSet<String>, request: &mut Request) {
    let kept: Vec<(String, String)> = cookie_pairs(request)
      .into_iter()
      .filter(|(n, _)| !token_names.contains(&n.to_ascii_lowercase()))
      .collect();
    write_cookie_header(request, &kept);
  }

  fn process_message_to_match_session(
    &self,
    session: &HttpSession,
    token_names: &BTreeSet<String>,
    request: &mut Request,
  ) -> bool {
    self.clear_web_session_identifiers(token_names, request);
    let mut pairs = cookie_pairs(request);
    let mut applied = false;
    for token in session.tokens() {
      match token.source {
        TokenSource::Cookie => {
          pairs.push((token.name.clone(), token.value.clone()));
          applied = true;
        }
        TokenSource::Header => {
          if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(token.name.as_bytes()),
            HeaderValue::from_str(&token.value),
          ) {
            request.headers_mut().insert(name, value);
            applied = true;
          }
        }
      }
    }
    write_cookie_header(request, &pairs);
    applied
  }
}

#[derive(Debug, Clone)]
struct SiteSessions {
  sessions: Vec<HttpSession>,
  active: Option<String>,
  token_names: BTreeSet<String>,
  next_auto: usize,
}

impl SiteSessions {
  fn new(defaults: &BTreeSet<String>) -> Self {
    SiteSessions {
      sessions: Vec::new(),
      active: None,
      token_names: defaults.clone(),
      next_auto: 0,
    }
  }
  fn find(&self, name: &str) -> Option<usize> {
    self.sessions.iter().position(|s| s.name == name)
  }
  fn active_session(&self) -> Option<&HttpSession> {
    let name = self.active.as_deref()?;
    self.sessions.iter().find(|s| s.name == name)
  }
  fn auto_name(&mut self) -> String {
    loop {
      let name = format!("Session {}", self.next_auto);
      self.next_auto += 1;
      if self.find(&name).is_none() {
        return name;
      }
    }
  }
}

/// Sessions for every site seen so far.
pub struct SessionStore {
  sites: DashMap<SiteKey, SiteSessions>,
  default_token_names: BTreeSet<String>,
  management: Arc<dyn SessionManagement>,
}

impl Default for SessionStore {
  fn default() -> Self {
    SessionStore::new(Arc::new(CookieSessionManagement))
  }
}

fn unknown(site: &SiteKey, name: &str) -> Error {
  SessionError::UnknownSession {
    site: site.to_string(),
    name: name.to_string(),
  }
  .into()
}

impl SessionStore {
  /// A store delegating extraction and injection to `management`.
  pub fn new(management: Arc<dyn SessionManagement>) -> Self {
    SessionStore {
      sites: DashMap::new(),
      default_token_names: DEFAULT_TOKEN_NAMES.iter().map(|s| s.to_string()).collect(),
      management,
    }
  }

  /// Add names tracked for every site created from now on.
  pub fn with_default_token_names<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self
      .default_token_names
      .extend(names.into_iter().map(|s| s.as_ref().to_ascii_lowercase()));
    self
  }

  fn site_mut(&self, site: &SiteKey) -> dashmap::mapref::one::RefMut<'_, SiteKey, SiteSessions> {
    self
      .sites
      .entry(site.clone())
      .or_insert_with(|| SiteSessions::new(&self.default_token_names))
  }

  /// The entry of a site that must already have `session`; lookups never create sites.
  fn known_site(
    &self,
    site: &SiteKey,
    session: &str,
  ) -> Result<dashmap::mapref::one::RefMut<'_, SiteKey, SiteSessions>> {
    self.sites.get_mut(site).ok_or_else(|| unknown(site, session))
  }

  /// Sites with any session state.
  pub fn sites(&self) -> Vec<SiteKey> {
    let mut sites: Vec<SiteKey> = self.sites.iter().map(|e| e.key().clone()).collect();
    sites.sort();
    sites
  }

  /// Snapshot of the active session.
  pub fn get_active(&self, site: &SiteKey) -> Option<HttpSession> {
    self.sites.get(site)?.active_session().cloned()
  }

  /// Make `name` the active session; the previous one stays stored.
  pub fn set_active(&self, site: &SiteKey, name: &str) -> Result<()> {
    let mut entry = self.known_site(site, name)?;
    entry.find(name).ok_or_else(|| unknown(site, name))?;
    entry.active = Some(name.to_string());
    Ok(())
  }

  /// Clear the active session.
  pub fn unset_active(&self, site: &SiteKey) {
    if let Some(mut entry) = self.sites.get_mut(site) {
      entry.active = None;
    }
  }

  /// A new session without tokens, auto-named `Session N` when `name` is `None`.
  pub fn create_empty(&self, site: &SiteKey, name: Option<&str>) -> Result<HttpSession> {
    let mut entry = self.site_mut(site);
    let name = match name {
      Some(name) => {
        if entry.find(name).is_some() {
          return Err(
            SessionError::DuplicateSession {
              site: site.to_string(),
              name: name.to_string(),
            }
            .into(),
          );
        }
        name.to_string()
      }
      None => entry.auto_name(),
    };
    let session = HttpSession::new(name);
    entry.sessions.push(session.clone());
    Ok(session)
  }

  /// Snapshots of all sessions of `site`.
  pub fn sessions(&self, site: &SiteKey) -> Vec<HttpSession> {
    self
      .sites
      .get(site)
      .map(|e| e.sessions.clone())
      .unwrap_or_default()
  }

  /// Delete a session; deleting the active one leaves the site without one.
  pub fn remove_session(&self, site: &SiteKey, name: &str) -> Result<()> {
    let mut entry = self.known_site(site, name)?;
    let index = entry.find(name).ok_or_else(|| unknown(site, name))?;
    entry.sessions.remove(index);
    if entry.active.as_deref() == Some(name) {
      entry.active = None;
    }
    Ok(())
  }

  /// Rename a session.
  pub fn rename_session(&self, site: &SiteKey, old: &str, new: &str) -> Result<()> {
    let mut entry = self.known_site(site, old)?;
    let index = entry.find(old).ok_or_else(|| unknown(site, old))?;
    if old != new && entry.find(new).is_some() {
      return Err(
        SessionError::DuplicateSession {
          site: site.to_string(),
          name: new.to_string(),
        }
        .into(),
      );
    }
    entry.sessions[index].name = new.to_string();
    if entry.active.as_deref() == Some(old) {
      entry.active = Some(new.to_string());
    }
    Ok(())
  }

  /// Track `name` as a session token for `site`.
  pub fn add_token_name(&self, site: &SiteKey, name: &str) -> bool {
    self.site_mut(site).token_names.insert(name.to_ascii_lowercase())
  }

  /// Stop tracking `name`; its values are dropped from every session.
  pub fn remove_token_name(&self, site: &SiteKey, name: &str) -> bool {
    if !self.sites.contains_key(site) && !self.default_token_names.contains(&name.to_ascii_lowercase()) {
      return false;
    }
    let mut entry = self.site_mut(site);
    let removed = entry.token_names.remove(&name.to_ascii_lowercase());
    if removed {
      for session in entry.sessions.iter_mut() {
        session.remove_token(name);
      }
    }
    removed
  }

  /// Names tracked for `site`.
  pub fn token_names(&self, site: &SiteKey) -> BTreeSet<String> {
    match self.sites.get(site) {
      Some(entry) => entry.token_names.clone(),
      None => self.default_token_names.clone(),
    }
  }

  /// Set or clear one token value in a session.
  pub fn set_token_value(
    &self,
    site: &SiteKey,
    session: &str,
    token: &str,
    value: Option<&str>,
    source: TokenSource,
  ) -> Result<()> {
    let mut entry = self.known_site(site, session)?;
    let index = entry.find(session).ok_or_else(|| unknown(site, session))?;
    match value {
      Some(value) => {
        entry.sessions[index].set_token(SessionToken {
          name: token.to_string(),
          value: value.to_string(),
          source,
        });
      }
      None => {
        entry.sessions[index].remove_token(token);
      }
    }
    Ok(())
  }

  /// Inject the active session of `site` into `request`.
  pub fn apply_to_request(&self, site: &SiteKey, request: &mut Request) -> bool {
    let snapshot = self.sites.get(site).and_then(|entry| {
      entry
        .active_session()
        .cloned()
        .map(|session| (session, entry.token_names.clone()))
    });
    match snapshot {
      Some((session, names)) => self
        .management
        .process_message_to_match_session(&session, &names, request),
      None => false,
    }
  }

  /// Record tokens set by `response`.
  ///
  /// Values go into the active session. Without one, a stored session that
  /// already holds exactly these values becomes active, or a new auto-named
  /// session is created and activated.
  pub fn extract_from_response(&self, site: &SiteKey, request: &Request, response: &Response) -> bool {
    let names = self.token_names(site);
    let tokens = self
      .management
      .extract_web_session(&names, request, response);
    if tokens.is_empty() {
      return false;
    }
    let mut entry = self.site_mut(site);
    let index = match entry.active.clone().and_then(|name| entry.find(&name)) {
      Some(index) => index,
      None => match entry.sessions.iter().position(|s| s.matches_tokens(&tokens)) {
        Some(index) => {
          entry.active = Some(entry.sessions[index].name.clone());
          return true;
        }
        None => {
          let name = entry.auto_name();
          entry.sessions.push(HttpSession::new(name.clone()));
          entry.active = Some(name);
          entry.sessions.len() - 1
        }
      },
    };
    let mut changed = false;
    for token in tokens {
      changed |= entry.sessions[index].set_token(token);
    }
    if changed {
      tracing::debug!(site = %site, session = %entry.sessions[index].name, "session tokens updated");
    }
    changed
  }
}

/// Username/password pair handed to an [`Authenticator`].
#[derive(Clone, Default)]
pub struct Credentials {
  /// user
  pub username: String,
  /// password
  pub password: String,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &"***")
      .finish()
  }
}

/// Sends requests on behalf of an [`Authenticator`].
pub struct AuthHelper {
  engine: Arc<ProxyEngine>,
  options: SendOptions,
}

impl AuthHelper {
  /// A helper that does not follow redirects.
  pub fn new(engine: Arc<ProxyEngine>) -> Self {
    AuthHelper {
      engine,
      options: SendOptions::default(),
    }
  }
  /// Follow redirects with the given limits.
  pub fn follow_redirects(mut self, max_redirects: usize, allow_circular: bool) -> Self {
    self.options = SendOptions {
      follow_redirects: true,
      max_redirects,
      allow_circular_redirects: allow_circular,
    };
    self
  }
  /// Send `request` through the engine as an authentication request.
  pub async fn send(&self, request: Request) -> Result<HttpTransaction> {
    self
      .engine
      .send_request(request, Initiator::Authentication, self.options)
      .await
  }
}

/// A login procedure.
#[async_trait]
pub trait Authenticator: Send + Sync {
  /// Log in and return the transaction whose response carries the session.
  async fn authenticate(
    &self,
    helper: &AuthHelper,
    params: &HashMap<String, String>,
    credentials: &Credentials,
  ) -> Result<HttpTransaction>;
}
