use crate::{error::*, log::*};
use rustls::{
  server::{ClientHello, ResolvesServerCert},
  sign::CertifiedKey,
  CipherSuite, SignatureScheme,
};
use std::{fmt, sync::Arc};

/* ------------------------------------------------ */
/// The parts of a TLS ClientHello that drive certificate selection and backend
/// routing, owned so it can outlive the handshake buffers it was peeked from.
#[derive(Clone, Debug, Default)]
pub struct HelloInfo {
  /// SNI hostname, if the client sent one.
  pub server_name: Option<String>,
  /// ALPN protocols in the client's preference order.
  pub alpn: Vec<Vec<u8>>,
  pub signature_schemes: Vec<SignatureScheme>,
  pub cipher_suites: Vec<CipherSuite>,
}

impl HelloInfo {
  pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
    Self {
      server_name: hello.server_name().map(str::to_string),
      alpn: hello
        .alpn()
        .map(|protos| protos.map(<[u8]>::to_vec).collect())
        .unwrap_or_default(),
      signature_schemes: hello.signature_schemes().to_vec(),
      cipher_suites: hello.cipher_suites().to_vec(),
    }
  }

  pub fn with_server_name(&self, server_name: &str) -> Self {
    let mut hello = self.clone();
    hello.server_name = Some(server_name.to_string());
    hello
  }
}

/* ------------------------------------------------ */
/// Certificate selection driven by a peeked hello.
pub trait ResolveCert: Send + Sync {
  fn resolve(&self, hello: &HelloInfo) -> CertResult<Arc<CertifiedKey>>;
}

/// Substitutes a configured server name when the client did not send SNI, then
/// delegates.
pub struct WithDefaultServerName {
  default_server_name: String,
  inner: Arc<dyn ResolveCert>,
}

impl WithDefaultServerName {
  pub fn new(default_server_name: &str, inner: Arc<dyn ResolveCert>) -> Self {
    Self {
      default_server_name: default_server_name.to_string(),
      inner,
    }
  }
}

impl ResolveCert for WithDefaultServerName {
  fn resolve(&self, hello: &HelloInfo) -> CertResult<Arc<CertifiedKey>> {
    if hello.server_name.as_deref().unwrap_or("").is_empty() {
      self.inner.resolve(&hello.with_server_name(&self.default_server_name))
    } else {
      self.inner.resolve(hello)
    }
  }
}

/* ------------------------------------------------ */
/// Adapts a [`ResolveCert`] to the rustls resolver interface so it can sit
/// inside a `ServerConfig`.
pub struct CertResolver {
  inner: Arc<dyn ResolveCert>,
}

impl CertResolver {
  pub fn new(inner: Arc<dyn ResolveCert>) -> Self {
    Self { inner }
  }
}

impl fmt::Debug for CertResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("CertResolver")
  }
}

impl ResolvesServerCert for CertResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let hello = HelloInfo::from_client_hello(&client_hello);
    match self.inner.resolve(&hello) {
      Ok(certified) => Some(certified),
      Err(err) => {
        debug!("no certificate for {:?}: {err}", hello.server_name.as_deref().unwrap_or(""));
        None
      }
    }
  }
}

/// Hands out one fixed certificate; used once a certificate has already been
/// selected for a connection.
pub struct SingleCertResolver {
  certified: Arc<CertifiedKey>,
}

impl SingleCertResolver {
  pub fn new(certified: Arc<CertifiedKey>) -> Self {
    Self { certified }
  }
}

impl fmt::Debug for SingleCertResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("SingleCertResolver")
  }
}

impl ResolvesServerCert for SingleCertResolver {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.certified.clone())
  }
}

/* ------------------------------------------------ */
