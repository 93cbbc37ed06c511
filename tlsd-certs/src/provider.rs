use crate::{
  dir::CertDirectory,
  error::*,
  file::CertFile,
  resolve::{CertResolver, HelloInfo, ResolveCert, SingleCertResolver, WithDefaultServerName},
};
use rustls::{server::ResolvesServerCert, ServerConfig};
use std::{path::Path, sync::Arc};

#[cfg(feature = "acme")]
use crate::acme::AutoCert;

/// Where the daemon and the TLS-terminating listeners get their certificates.
pub enum CertProvider {
  /// Hello-driven lookup: a certificate directory or a single bundle file.
  Lookup(Arc<dyn ResolveCert>),
  /// Automatic acquisition through the ACME tls-alpn-01 flow.
  #[cfg(feature = "acme")]
  Acme(AutoCert),
}

impl CertProvider {
  pub fn directory(path: impl AsRef<Path>) -> Self {
    Self::Lookup(Arc::new(CertDirectory::new(path)))
  }

  pub fn file(path: impl AsRef<Path>) -> Self {
    Self::Lookup(Arc::new(CertFile::new(path)))
  }

  #[cfg(feature = "acme")]
  pub fn autocert(hostnames: Vec<String>) -> CertResult<Self> {
    Ok(Self::Acme(AutoCert::spawn(hostnames)?))
  }

  /// Substitute `server_name` when a client omits SNI. Only meaningful for
  /// lookup providers; ACME challenges always carry a real SNI.
  pub fn with_default_server_name(self, server_name: &str) -> Self {
    match self {
      Self::Lookup(inner) => Self::Lookup(Arc::new(WithDefaultServerName::new(server_name, inner))),
      #[cfg(feature = "acme")]
      other => other,
    }
  }

  /// The provider as a rustls certificate resolver, for configs whose
  /// certificate is picked during the handshake.
  pub fn rustls_resolver(&self) -> Arc<dyn ResolvesServerCert> {
    match self {
      Self::Lookup(inner) => Arc::new(CertResolver::new(inner.clone())),
      #[cfg(feature = "acme")]
      Self::Acme(auto) => auto.rustls_resolver(),
    }
  }

  /// Build a per-connection server config advertising exactly `alpn`. For a
  /// lookup provider the certificate is fetched now, from the peeked hello, so
  /// a missing certificate fails before any handshake bytes are written.
  pub fn server_config(&self, hello: &HelloInfo, alpn: Vec<Vec<u8>>) -> CertResult<Arc<ServerConfig>> {
    let resolver: Arc<dyn ResolvesServerCert> = match self {
      Self::Lookup(inner) => Arc::new(SingleCertResolver::new(inner.resolve(hello)?)),
      #[cfg(feature = "acme")]
      Self::Acme(auto) => auto.rustls_resolver(),
    };
    let mut config = ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver);
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  #[tokio::test]
  async fn lookup_provider_builds_single_alpn_config() {
    let cert = rcgen::generate_simple_self_signed(vec!["cfg.example".to_string()]).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}{}", cert.cert.pem(), cert.key_pair.serialize_pem()).unwrap();

    let provider = CertProvider::file(file.path());
    let hello = HelloInfo::default().with_server_name("cfg.example");
    let config = provider.server_config(&hello, vec![b"h2".to_vec()]).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
  }

  #[tokio::test]
  async fn lookup_provider_surfaces_missing_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let provider = CertProvider::directory(dir.path());
    let hello = HelloInfo::default().with_server_name("nobody.example");
    let err = provider.server_config(&hello, vec![b"h2".to_vec()]).unwrap_err();
    assert!(matches!(err, CertError::NoCertificate(_)));
  }
}
