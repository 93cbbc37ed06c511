use crate::{error::*, log::*};
use futures::StreamExt;
use rustls::server::ResolvesServerCert;
use rustls_acme::{caches::DirCache, AcmeConfig, ResolvesServerCertAcme};
use std::{env, path::PathBuf, sync::Arc};

/// Automatic certificate acquisition via the ACME tls-alpn-01 flow.
///
/// Construction spawns the background task that orders and renews
/// certificates; the resolver hands out both regular and challenge
/// certificates during handshakes.
///
/// Consumes `AUTOCERT_ACME_SERVER` (directory URL, Let's Encrypt when unset),
/// `AUTOCERT_EMAIL` (account contact) and `AUTOCERT_CACHE_DIR`.
pub struct AutoCert {
  resolver: Arc<ResolvesServerCertAcme>,
}

impl AutoCert {
  /// Start managing certificates for `domains`. Must be called within a tokio
  /// runtime.
  pub fn spawn(domains: Vec<String>) -> CertResult<Self> {
    if domains.is_empty() {
      return Err(CertError::NoAcmeDomains);
    }

    let mut config = AcmeConfig::new(&domains).cache(DirCache::new(autocert_cache_dir()));
    match env::var("AUTOCERT_ACME_SERVER") {
      Ok(url) if !url.is_empty() => config = config.directory(url),
      _ => config = config.directory_lets_encrypt(true),
    }
    if let Ok(email) = env::var("AUTOCERT_EMAIL") {
      if !email.is_empty() {
        config = config.contact_push(format!("mailto:{email}"));
      }
    }

    let mut state = config.state();
    let resolver = state.resolver();
    tokio::spawn(async move {
      info!("autocert manager started");
      loop {
        match state.next().await {
          Some(Ok(event)) => info!("autocert event: {event:?}"),
          Some(Err(err)) => error!("autocert error: {err:?}"),
          None => {
            error!("autocert manager exited");
            break;
          }
        }
      }
    });

    Ok(Self { resolver })
  }

  pub fn rustls_resolver(&self) -> Arc<dyn ResolvesServerCert> {
    self.resolver.clone()
  }
}

/// Where account and certificate state is cached, mirroring the autocert
/// conventions: `AUTOCERT_CACHE_DIR`, the system directory when running as
/// root, then `XDG_DATA_HOME` or `~/.local/share`.
fn autocert_cache_dir() -> PathBuf {
  if let Ok(dir) = env::var("AUTOCERT_CACHE_DIR") {
    if !dir.is_empty() {
      return PathBuf::from(dir);
    }
  }
  if unsafe { libc::getuid() } == 0 {
    return PathBuf::from("/var/lib/autocert-cache");
  }
  if let Ok(data_dir) = env::var("XDG_DATA_HOME") {
    if !data_dir.is_empty() {
      return PathBuf::from(data_dir).join("autocert-cache");
    }
  }
  if let Ok(home) = env::var("HOME") {
    if !home.is_empty() {
      return PathBuf::from(home).join(".local/share/autocert-cache");
    }
  }
  env::temp_dir().join("autocert-cache")
}
