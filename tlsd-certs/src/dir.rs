use crate::{
  cache::{global_file_cache, FileCache},
  error::*,
  key_type::supported_key_types,
  log::*,
  resolve::{HelloInfo, ResolveCert},
};
use rustls::sign::CertifiedKey;
use std::{
  io,
  path::{Path, PathBuf},
  sync::Arc,
};

/// Resolves certificates from a directory of bundle files named
/// `SERVER_NAME.pem`, with optional per-key-type variants
/// `SERVER_NAME.pem.ecdsa` / `SERVER_NAME.pem.rsa` and `_`-wildcard forms.
/// Files are reloaded automatically when they change.
pub struct CertDirectory {
  path: PathBuf,
  cache: Arc<FileCache>,
}

impl CertDirectory {
  /// Resolver over `path` backed by the global file cache.
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self::with_cache(path, global_file_cache())
  }

  pub fn with_cache(path: impl AsRef<Path>, cache: Arc<FileCache>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      cache,
    }
  }

  fn load(&self, filename: &str) -> CertResult<Arc<CertifiedKey>> {
    self.cache.load(&self.path.join(filename))?.certified_key()
  }
}

impl ResolveCert for CertDirectory {
  fn resolve(&self, hello: &HelloInfo) -> CertResult<Arc<CertifiedKey>> {
    let server_name = hello.server_name.as_deref().filter(|name| !name.is_empty());
    let Some(server_name) = server_name else {
      return Err(CertError::NoServerName);
    };
    if server_name.starts_with('.') || server_name.contains('/') {
      return Err(CertError::InvalidServerName);
    }

    let key_types = supported_key_types(hello);
    let wildcard_name = replace_first_label(server_name, "_");

    let mut candidates: Vec<String> = Vec::with_capacity(6);
    if key_types.ecdsa {
      candidates.push(format!("{server_name}.pem.ecdsa"));
      candidates.push(format!("{wildcard_name}.pem.ecdsa"));
    }
    if key_types.rsa {
      candidates.push(format!("{server_name}.pem.rsa"));
      candidates.push(format!("{wildcard_name}.pem.rsa"));
    }
    candidates.push(format!("{server_name}.pem"));
    candidates.push(format!("{wildcard_name}.pem"));

    for filename in &candidates {
      match self.load(filename) {
        Ok(certified) => return Ok(certified),
        Err(CertError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("ignoring certificate candidate {filename}: {err}"),
      }
    }
    Err(CertError::NoCertificate(server_name.to_string()))
  }
}

pub(crate) fn replace_first_label(hostname: &str, replacement: &str) -> String {
  match hostname.find('.') {
    Some(dot) => format!("{replacement}{}", &hostname[dot..]),
    None => replacement.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rustls::SignatureScheme;
  use std::io::Write as _;

  fn write_bundle(path: &Path, name: &str) -> Vec<u8> {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let mut file = std::fs::File::create(path).unwrap();
    write!(file, "{}{}", cert.cert.pem(), cert.key_pair.serialize_pem()).unwrap();
    cert.cert.der().as_ref().to_vec()
  }

  fn hello(name: &str, schemes: Vec<SignatureScheme>) -> HelloInfo {
    HelloInfo {
      server_name: Some(name.to_string()),
      signature_schemes: schemes,
      ..Default::default()
    }
  }

  fn both_types() -> Vec<SignatureScheme> {
    vec![SignatureScheme::ECDSA_NISTP256_SHA256, SignatureScheme::RSA_PSS_SHA256]
  }

  #[test]
  fn prefers_ecdsa_variant_over_plain() {
    let dir = tempfile::tempdir().unwrap();
    let plain_der = write_bundle(&dir.path().join("www.example.com.pem"), "www.example.com");
    let ecdsa_der = write_bundle(&dir.path().join("www.example.com.pem.ecdsa"), "www.example.com");
    assert_ne!(plain_der, ecdsa_der);

    let resolver = CertDirectory::with_cache(dir.path(), Arc::new(FileCache::new()));
    let certified = resolver.resolve(&hello("www.example.com", both_types())).unwrap();
    assert_eq!(certified.cert[0].as_ref(), &ecdsa_der[..]);
  }

  #[test]
  fn skips_key_type_pairs_the_client_lacks() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(&dir.path().join("www.example.com.pem.ecdsa"), "www.example.com");
    let rsa_der = write_bundle(&dir.path().join("www.example.com.pem.rsa"), "www.example.com");

    let resolver = CertDirectory::with_cache(dir.path(), Arc::new(FileCache::new()));
    let certified = resolver
      .resolve(&hello("www.example.com", vec![SignatureScheme::RSA_PSS_SHA256]))
      .unwrap();
    assert_eq!(certified.cert[0].as_ref(), &rsa_der[..]);
  }

  #[test]
  fn falls_back_to_wildcard_file() {
    let dir = tempfile::tempdir().unwrap();
    let wild_der = write_bundle(&dir.path().join("_.example.com.pem"), "wild.example.com");

    let resolver = CertDirectory::with_cache(dir.path(), Arc::new(FileCache::new()));
    let certified = resolver.resolve(&hello("api.example.com", both_types())).unwrap();
    assert_eq!(certified.cert[0].as_ref(), &wild_der[..]);
  }

  #[test]
  fn rejects_missing_or_invalid_server_names() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = CertDirectory::with_cache(dir.path(), Arc::new(FileCache::new()));

    let err = resolver.resolve(&HelloInfo::default()).unwrap_err();
    assert!(matches!(err, CertError::NoServerName));

    let err = resolver.resolve(&hello(".example.com", both_types())).unwrap_err();
    assert!(matches!(err, CertError::InvalidServerName));

    let err = resolver.resolve(&hello("foo/../bar", both_types())).unwrap_err();
    assert!(matches!(err, CertError::InvalidServerName));

    let err = resolver.resolve(&hello("absent.example.com", both_types())).unwrap_err();
    assert!(matches!(err, CertError::NoCertificate(name) if name == "absent.example.com"));
  }

  #[test]
  fn replaces_first_label() {
    assert_eq!(replace_first_label("www.example.com", "_"), "_.example.com");
    assert_eq!(replace_first_label("example", "_"), "_");
  }
}
