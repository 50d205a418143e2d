//! rustls configuration for both legs of an intercepted connection.
//!
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, SignatureScheme,
};

use crate::errors::Result;

/// Only HTTP/1.1 is spoken on either side.
const ALPN_HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client configuration used toward origin servers and `https://` proxies.
///
/// With `verify` off every certificate is accepted, which is what a
/// debugging proxy pointed at test systems usually wants.
pub(crate) fn client_config(verify: bool) -> Result<Arc<rustls::ClientConfig>> {
  let builder =
    rustls::ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let mut config = if verify {
    let roots = rustls::RootCertStore {
      roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

/// Server configuration presenting a minted leaf to the client.
pub(crate) fn server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(Arc::new(config))
}

/// Turn a host into the name sent in SNI.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(host.to_owned())
    .map_err(|e| crate::errors::Error::Upstream(format!("invalid server name {host:?}: {e}")))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
