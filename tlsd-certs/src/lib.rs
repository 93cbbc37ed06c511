mod bundle;
mod cache;
mod dir;
mod error;
mod file;
mod key_type;
mod provider;
mod resolve;

#[cfg(feature = "acme")]
mod acme;

#[allow(unused_imports)]
mod log {
  pub(super) use tracing::{debug, error, info, warn};
}

pub use crate::{
  bundle::{Bundle, KeyUsage},
  cache::{global_file_cache, FileCache},
  dir::CertDirectory,
  error::{CertError, CertResult},
  file::CertFile,
  provider::CertProvider,
  resolve::{CertResolver, HelloInfo, ResolveCert, SingleCertResolver, WithDefaultServerName},
};

#[cfg(feature = "acme")]
pub use crate::acme::AutoCert;

/// ALPN protocol identifier of the ACME tls-alpn-01 challenge (RFC 8737).
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
