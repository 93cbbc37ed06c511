use crate::{
  acceptor::{closed_error, Acceptor, ConnAddr, Connection, ListenerAddr},
  log::*,
};
use async_trait::async_trait;
use std::{
  fs,
  io,
  os::unix::fs::{MetadataExt, PermissionsExt},
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::{net::UnixListener, sync::RwLock, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval of the inode poll watching the socket file.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

struct Shared {
  inner: RwLock<Option<UnixListener>>,
  closed: CancellationToken,
  close_flag: AtomicBool,
}

impl Shared {
  async fn shutdown(&self) {
    self.closed.cancel();
    self.inner.write().await.take();
  }
}

/// Acceptor over a listening UNIX domain socket.
///
/// [`UnixAcceptor::bind_watched`] creates the socket file atomically and keeps
/// watching it: if the file is removed or replaced by another inode, the
/// acceptor self-closes within [`WATCH_INTERVAL`].
pub struct UnixAcceptor {
  shared: Arc<Shared>,
  addr: ListenerAddr,
}

impl std::fmt::Debug for UnixAcceptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UnixAcceptor").field("addr", &self.addr).finish()
  }
}

impl UnixAcceptor {
  /// Adopt an already-listening std socket (inherited fd). No file watching.
  pub fn adopt_std(listener: std::os::unix::net::UnixListener) -> io::Result<Self> {
    listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(listener)?;
    let path = listener.local_addr()?.as_pathname().map(Path::to_path_buf);
    Ok(Self {
      shared: Arc::new(Shared {
        inner: RwLock::new(Some(listener)),
        closed: CancellationToken::new(),
        close_flag: AtomicBool::new(false),
      }),
      addr: ListenerAddr::Unix(path),
    })
  }

  /// Create a listening UNIX domain socket at `path` with the given filesystem
  /// permissions. The socket is bound in a sibling temporary directory and
  /// renamed over the target, so a file already present at `path` is replaced
  /// atomically.
  pub fn bind_watched(path: &Path, mode: u32) -> io::Result<Self> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let temp_dir = tempfile::Builder::new().prefix(".tmp").tempdir_in(parent)?;
    let temp_path = temp_dir.path().join("socket");

    let listener = std::os::unix::net::UnixListener::bind(&temp_path)?;
    listener.set_nonblocking(true)?;
    fs::set_permissions(&temp_path, fs::Permissions::from_mode(mode))?;
    let info = fs::symlink_metadata(&temp_path)?;
    fs::rename(&temp_path, path)?;

    let listener = UnixListener::from_std(listener)?;
    let shared = Arc::new(Shared {
      inner: RwLock::new(Some(listener)),
      closed: CancellationToken::new(),
      close_flag: AtomicBool::new(false),
    });
    spawn_watcher(shared.clone(), path.to_path_buf(), info.dev(), info.ino());

    Ok(Self {
      shared,
      addr: ListenerAddr::Unix(Some(path.to_path_buf())),
    })
  }
}

fn spawn_watcher(shared: Arc<Shared>, path: PathBuf, dev: u64, ino: u64) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = shared.closed.cancelled() => return,
        _ = ticker.tick() => {
          let same = fs::symlink_metadata(&path)
            .map(|info| info.dev() == dev && info.ino() == ino)
            .unwrap_or(false);
          if !same {
            info!("UNIX socket {} was removed or replaced; closing listener", path.display());
            shared.shutdown().await;
            return;
          }
        }
      }
    }
  });
}

#[async_trait]
impl Acceptor for UnixAcceptor {
  async fn accept(&self) -> io::Result<Connection> {
    let guard = self.shared.inner.read().await;
    let Some(listener) = guard.as_ref() else {
      return Err(closed_error());
    };
    tokio::select! {
      _ = self.shared.closed.cancelled() => Err(closed_error()),
      res = listener.accept() => {
        let (stream, peer) = res?;
        let local_addr = match &self.addr {
          ListenerAddr::Unix(path) => ConnAddr::Unix(path.clone()),
          _ => ConnAddr::Unspecified,
        };
        let remote_addr = ConnAddr::Unix(peer.as_pathname().map(Path::to_path_buf));
        Ok(Connection::new(stream, local_addr, remote_addr))
      }
    }
  }

  fn addr(&self) -> ListenerAddr {
    self.addr.clone()
  }

  async fn close(&self) -> io::Result<()> {
    if self.shared.close_flag.swap(true, Ordering::SeqCst) {
      return Err(closed_error());
    }
    self.shared.shutdown().await;
    Ok(())
  }
}
