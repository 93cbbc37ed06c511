use crate::{
  cache::{global_file_cache, FileCache},
  error::*,
  resolve::{HelloInfo, ResolveCert},
};
use rustls::sign::CertifiedKey;
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

/// Resolves every hello to the single bundle file at `path`, reloaded through
/// the cache whenever the file changes.
pub struct CertFile {
  path: PathBuf,
  cache: Arc<FileCache>,
}

impl CertFile {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self::with_cache(path, global_file_cache())
  }

  pub fn with_cache(path: impl AsRef<Path>, cache: Arc<FileCache>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      cache,
    }
  }
}

impl ResolveCert for CertFile {
  fn resolve(&self, _hello: &HelloInfo) -> CertResult<Arc<CertifiedKey>> {
    self.cache.load(&self.path)?.certified_key()
  }
}
