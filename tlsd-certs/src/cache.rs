use crate::{bundle::Bundle, error::*, log::*};
use rustc_hash::FxHashMap as HashMap;
use std::{
  path::{Path, PathBuf},
  sync::{Arc, OnceLock, RwLock},
  time::{Duration, SystemTime},
};

/// How often the global cache sweeps out expired bundles.
const CLEAN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
struct CacheEntry {
  bundle: Arc<Bundle>,
  mod_time: SystemTime,
}

impl CacheEntry {
  fn is_fresh(&self, latest_mod_time: SystemTime) -> bool {
    self.mod_time == latest_mod_time
  }
}

/// Cache of parsed certificate bundles keyed by file path. An entry is fresh
/// while its recorded mtime exactly equals the file's current mtime, so
/// certificates rotate with zero downtime simply by replacing the file.
pub struct FileCache {
  bundles: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl FileCache {
  pub fn new() -> Self {
    Self {
      bundles: RwLock::new(HashMap::default()),
    }
  }

  fn get(&self, path: &Path) -> Option<CacheEntry> {
    self.bundles.read().expect("file cache lock poisoned").get(path).cloned()
  }

  fn add(&self, path: PathBuf, entry: CacheEntry) {
    self.bundles.write().expect("file cache lock poisoned").insert(path, entry);
  }

  /// Load the bundle at `path`, reusing the cached parse while the file is
  /// unchanged. Two racing misses may both parse; the stores are idempotent.
  pub fn load(&self, path: &Path) -> CertResult<Arc<Bundle>> {
    let mod_time = std::fs::metadata(path)?.modified()?;

    if let Some(entry) = self.get(path) {
      if entry.is_fresh(mod_time) {
        return Ok(entry.bundle);
      }
    }

    let bundle = Arc::new(Bundle::from_pem_file(path)?);
    self.add(path.to_path_buf(), CacheEntry { bundle: bundle.clone(), mod_time });
    Ok(bundle)
  }

  /// Drop entries whose leaf certificate has expired.
  pub fn clean(&self) {
    let now = SystemTime::now();
    self
      .bundles
      .write()
      .expect("file cache lock poisoned")
      .retain(|_, entry| entry.bundle.not_after() >= now);
  }

  pub fn len(&self) -> usize {
    self.bundles.read().expect("file cache lock poisoned").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for FileCache {
  fn default() -> Self {
    Self::new()
  }
}

static GLOBAL_FILE_CACHE: OnceLock<Arc<FileCache>> = OnceLock::new();

/// The process-wide bundle cache, created lazily. The first call from within a
/// tokio runtime also starts the daily sweeper.
pub fn global_file_cache() -> Arc<FileCache> {
  GLOBAL_FILE_CACHE
    .get_or_init(|| {
      let cache = Arc::new(FileCache::new());
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let cache = cache.clone();
        handle.spawn(async move {
          let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
          ticker.tick().await;
          loop {
            ticker.tick().await;
            cache.clean();
            debug!("swept expired certificates from the global file cache; {} entries left", cache.len());
          }
        });
      }
      cache
    })
    .clone()
}
