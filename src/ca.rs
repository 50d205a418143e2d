//! Certificate Authority (CA) used for TLS interception.
//!
//! The root key pair is loaded from, or generated into, a [`CaStore`] the
//! first time it is needed. Leaf certificates are minted per host, signed by
//! the root and cached until the root changes or the entry expires.
//!
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::errors::{certificate, Result};
use crate::tls;

/// Certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// PEM encoded root certificate and key as persisted.
#[derive(Clone)]
pub struct StoredCa {
  /// certificate PEM
  pub cert_pem: String,
  /// private key PEM
  pub key_pem: String,
}

impl std::fmt::Debug for StoredCa {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StoredCa")
      .field("cert_pem", &self.cert_pem)
      .finish_non_exhaustive()
  }
}

/// Where root CA material lives between runs.
#[async_trait]
pub trait CaStore: Send + Sync {
  /// The stored root, if any.
  async fn load(&self) -> Result<Option<StoredCa>>;
  /// Replace the stored root.
  async fn save(&self, ca: &StoredCa) -> Result<()>;
}

/// Root CA kept as `ca_cert.pem` / `ca_key.pem` in a directory.
#[derive(Debug, Clone)]
pub struct FileCaStore {
  dir: PathBuf,
}

impl FileCaStore {
  /// Store under `dir`; the directory is created on first save.
  pub fn new(dir: impl AsRef<Path>) -> Self {
    FileCaStore {
      dir: dir.as_ref().to_path_buf(),
    }
  }
  /// Path of the certificate file.
  pub fn cert_path(&self) -> PathBuf {
    self.dir.join(CA_CERT_FILE)
  }
  /// Path of the key file.
  pub fn key_path(&self) -> PathBuf {
    self.dir.join(CA_KEY_FILE)
  }
}

#[async_trait]
impl CaStore for FileCaStore {
  async fn load(&self) -> Result<Option<StoredCa>> {
    let (cert_path, key_path) = (self.cert_path(), self.key_path());
    if !tokio::fs::try_exists(&cert_path).await? || !tokio::fs::try_exists(&key_path).await? {
      return Ok(None);
    }
    Ok(Some(StoredCa {
      cert_pem: tokio::fs::read_to_string(&cert_path).await?,
      key_pem: tokio::fs::read_to_string(&key_path).await?,
    }))
  }

  async fn save(&self, ca: &StoredCa) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir).await?;
    let mut cert_file = tokio::fs::File::create(self.cert_path()).await?;
    cert_file.write_all(ca.cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut key_file = options.open(self.key_path()).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      // mode() only applies when the file is created
      tokio::fs::set_permissions(self.key_path(), std::fs::Permissions::from_mode(0o600)).await?;
    }
    key_file.write_all(ca.key_pem.as_bytes()).await?;
    key_file.flush().await?;
    Ok(())
  }
}

/// Root CA kept in memory; useful for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryCaStore {
  inner: parking_lot::Mutex<Option<StoredCa>>,
}

impl MemoryCaStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }
  /// Whether a root was saved.
  pub fn is_populated(&self) -> bool {
    self.inner.lock().is_some()
  }
}

#[async_trait]
impl CaStore for MemoryCaStore {
  async fn load(&self) -> Result<Option<StoredCa>> {
    Ok(self.inner.lock().clone())
  }
  async fn save(&self, ca: &StoredCa) -> Result<()> {
    *self.inner.lock() = Some(ca.clone());
    Ok(())
  }
}

/// Subject and validity settings for generated certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaOptions {
  /// root CN
  pub common_name: String,
  /// root O
  pub organization: String,
  /// root validity in days
  pub root_validity_days: i64,
  /// most leaves kept in the cache
  pub cache_capacity: u64,
}

impl Default for CaOptions {
  fn default() -> Self {
    CaOptions {
      common_name: "Waylay Proxy CA".to_string(),
      organization: "Waylay".to_string(),
      root_validity_days: 3650,
      cache_capacity: 1000,
    }
  }
}

/// The root certificate clients must trust.
#[derive(Debug, Clone)]
pub struct RootCertificate {
  /// DER bytes
  pub der: CertificateDer<'static>,
  /// PEM text
  pub pem: String,
}

/// A minted leaf plus everything needed to serve TLS with it.
pub struct LeafCertificate {
  host: String,
  epoch: u64,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for LeafCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCertificate")
      .field("host", &self.host)
      .field("epoch", &self.epoch)
      .finish_non_exhaustive()
  }
}

impl LeafCertificate {
  /// Host the certificate was issued for.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Root epoch it was signed under.
  pub fn epoch(&self) -> u64 {
    self.epoch
  }
  /// `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// Leaf private key.
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
  /// Ready server configuration presenting this leaf.
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

struct Root {
  issuer: Issuer<'static, KeyPair>,
  certificate: RootCertificate,
  epoch: u64,
}

impl Root {
  fn load(stored: &StoredCa, epoch: u64) -> Result<Root> {
    let key_pair =
      KeyPair::from_pem(&stored.key_pem).map_err(|e| certificate("Failed to parse CA key", e))?;
    let issuer = Issuer::from_ca_cert_pem(&stored.cert_pem, key_pair)
      .map_err(|e| certificate("Failed to create issuer from CA cert", e))?;
    let der = rustls_pemfile::certs(&mut stored.cert_pem.as_bytes())
      .next()
      .ok_or_else(|| certificate("Failed to parse PEM", "no certificate found"))?
      .map_err(|e| certificate("Failed to parse PEM", e))?;
    Ok(Root {
      issuer,
      certificate: RootCertificate {
        der,
        pem: stored.cert_pem.clone(),
      },
      epoch,
    })
  }

  fn generate(options: &CaOptions, epoch: u64) -> Result<(Root, StoredCa)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, options.common_name.as_str());
    dn.push(DnType::OrganizationName, options.organization.as_str());
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(options.root_validity_days);

    let key_pair = KeyPair::generate().map_err(|e| certificate("Failed to generate key pair", e))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| certificate("Failed to generate CA", e))?;
    let stored = StoredCa {
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
    };
    let der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&stored.cert_pem, key_pair)
      .map_err(|e| certificate("Failed to create issuer", e))?;
    let root = Root {
      issuer,
      certificate: RootCertificate {
        der,
        pem: stored.cert_pem.clone(),
      },
      epoch,
    };
    Ok((root, stored))
  }

  /// Generate a server certificate signed by this root.
  fn issue(&self, host: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    // IP literals get an IP SAN and the textual IP as DNS SAN
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(
        host
          .try_into()
          .map_err(|e| certificate(&format!("Invalid domain name {host}"), e))?,
      )]
    };
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate().map_err(|e| certificate("Failed to generate key pair", e))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| certificate("Failed to sign server cert", e))?;
    let chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.certificate.der.clone(),
    ];
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| certificate("Failed to serialize server key", e))?;
    let server_config = tls::server_config(chain.clone(), key.clone_key())?;
    Ok(LeafCertificate {
      host: host.to_string(),
      epoch: self.epoch,
      chain,
      key,
      server_config,
    })
  }
}

/// Root CA plus a per-host leaf cache.
pub struct CertificateAuthority {
  store: Arc<dyn CaStore>,
  options: CaOptions,
  root: parking_lot::RwLock<Option<Arc<Root>>>,
  init: tokio::sync::Mutex<()>,
  epoch: AtomicU64,
  cache: Cache<(u64, String), Arc<LeafCertificate>>,
}

impl CertificateAuthority {
  /// A CA backed by `store`. Nothing is loaded or generated until the
  /// root or a leaf is first requested.
  pub fn new(store: Arc<dyn CaStore>, options: CaOptions) -> Self {
    // entries expire at half the leaf lifetime so a served leaf is never stale
    let cache = Cache::builder()
      .max_capacity(options.cache_capacity)
      .time_to_live(std::time::Duration::from_secs((TTL_SECS / 2) as u64))
      .build();
    CertificateAuthority {
      store,
      options,
      root: parking_lot::RwLock::new(None),
      init: tokio::sync::Mutex::new(()),
      epoch: AtomicU64::new(0),
      cache,
    }
  }

  /// Current root epoch; bumped by every [`regenerate_root`](Self::regenerate_root).
  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  async fn root(&self) -> Result<Arc<Root>> {
    let cached = self.root.read().clone();
    if let Some(root) = cached {
      return Ok(root);
    }
    let _guard = self.init.lock().await;
    let cached = self.root.read().clone();
    if let Some(root) = cached {
      return Ok(root);
    }
    let epoch = self.epoch();
    let root = match self.store.load().await? {
      Some(stored) => Root::load(&stored, epoch)?,
      None => {
        let (root, stored) = Root::generate(&self.options, epoch)?;
        self.store.save(&stored).await?;
        tracing::info!("generated new root CA {:?}", self.options.common_name);
        root
      }
    };
    let root = Arc::new(root);
    *self.root.write() = Some(root.clone());
    Ok(root)
  }

  /// The root certificate, loading or generating it on first use.
  pub async fn root_certificate(&self) -> Result<RootCertificate> {
    Ok(self.root().await?.certificate.clone())
  }

  /// Root certificate as PEM for installation in a client trust store.
  pub async fn root_pem(&self) -> Result<String> {
    Ok(self.root().await?.certificate.pem.clone())
  }

  /// A leaf for `host`, minted on first request and cached per root epoch.
  /// Concurrent callers for the same host share one generation.
  pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let root = self.root().await?;
    let host = host
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_ascii_lowercase();
    let key = (root.epoch, host.clone());
    self
      .cache
      .try_get_with(key, async move {
        tracing::debug!(host = %host, epoch = root.epoch, "minting leaf certificate");
        root.issue(&host).map(Arc::new)
      })
      .await
      .map_err(|e| crate::errors::Error::Certificate(e.to_string()))
  }

  /// Mint and persist a new root, invalidating every cached leaf.
  pub async fn regenerate_root(&self) -> Result<RootCertificate> {
    let _guard = self.init.lock().await;
    let epoch = self.epoch() + 1;
    let (root, stored) = Root::generate(&self.options, epoch)?;
    self.store.save(&stored).await?;
    let certificate = root.certificate.clone();
    *self.root.write() = Some(Arc::new(root));
    self.epoch.store(epoch, Ordering::SeqCst);
    self.cache.invalidate_all();
    tracing::info!(epoch, "root CA regenerated");
    Ok(certificate)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio_rustls::rustls::client::danger::ServerCertVerifier;
  use tokio_rustls::rustls::client::WebPkiServerVerifier;
  use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
  use tokio_rustls::rustls::RootCertStore;

  fn verifies(root: &RootCertificate, leaf: &LeafCertificate, name: &str) -> bool {
    let mut roots = RootCertStore::empty();
    roots.add(root.der.clone()).unwrap();
    let verifier = WebPkiServerVerifier::builder_with_provider(
      Arc::new(roots),
      Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()),
    )
    .build()
    .unwrap();
    let name = ServerName::try_from(name.to_string()).unwrap();
    verifier
      .verify_server_cert(&leaf.chain()[0], &leaf.chain()[1..], &name, &[], UnixTime::now())
      .is_ok()
  }

  #[tokio::test]
  async fn root_is_generated_lazily() {
    let store = Arc::new(MemoryCaStore::new());
    let ca = CertificateAuthority::new(store.clone(), CaOptions::default());
    assert!(!store.is_populated());
    let root = ca.root_certificate().await.unwrap();
    assert!(store.is_populated());
    assert!(root.pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(ca.root_pem().await.unwrap(), root.pem);
  }

  #[tokio::test]
  async fn leaves_are_cached_per_epoch() {
    let ca = CertificateAuthority::new(Arc::new(MemoryCaStore::new()), CaOptions::default());
    let a = ca.leaf_for("Example.com").await.unwrap();
    let b = ca.leaf_for("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.host(), "example.com");
    let root = ca.root_certificate().await.unwrap();
    assert!(verifies(&root, &a, "example.com"));
    assert!(!verifies(&root, &a, "other.example"));

    let new_root = ca.regenerate_root().await.unwrap();
    assert_eq!(ca.epoch(), 1);
    let c = ca.leaf_for("example.com").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(c.epoch(), 1);
    assert!(verifies(&new_root, &c, "example.com"));
    assert!(!verifies(&new_root, &a, "example.com"));
  }

  #[tokio::test]
  async fn ip_literals_get_ip_sans() {
    let ca = CertificateAuthority::new(Arc::new(MemoryCaStore::new()), CaOptions::default());
    let leaf = ca.leaf_for("127.0.0.1").await.unwrap();
    let root = ca.root_certificate().await.unwrap();
    assert!(verifies(&root, &leaf, "127.0.0.1"));
  }

  #[tokio::test]
  async fn concurrent_requests_share_one_leaf() {
    let ca = Arc::new(CertificateAuthority::new(
      Arc::new(MemoryCaStore::new()),
      CaOptions::default(),
    ));
    let mut tasks = Vec::new();
    for _ in 0..8 {
      let ca = ca.clone();
      tasks.push(tokio::spawn(async move { ca.leaf_for("shared.test").await.unwrap() }));
    }
    let mut leaves = Vec::new();
    for t in tasks {
      leaves.push(t.await.unwrap());
    }
    assert!(leaves.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
  }

  #[tokio::test]
  async fn file_store_round_trips() {
    let dir = std::env::temp_dir().join(format!("waylay-ca-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let first = {
      let ca = CertificateAuthority::new(Arc::new(FileCaStore::new(&dir)), CaOptions::default());
      ca.root_pem().await.unwrap()
    };
    let ca = CertificateAuthority::new(Arc::new(FileCaStore::new(&dir)), CaOptions::default());
    assert_eq!(ca.root_pem().await.unwrap(), first);
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let mode = std::fs::metadata(dir.join(CA_KEY_FILE)).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o600);
    }
    let _ = std::fs::remove_dir_all(&dir);
  }
}
