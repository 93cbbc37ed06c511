use crate::{error::*, log::*};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::{
  io,
  os::unix::fs::FileTypeExt,
  path::{Path, PathBuf},
};
use tokio::net::UnixStream;

/// Characters escaped in the on-disk service path segment, so a service like
/// `http/1.1` maps to the single directory `http%2F1.1`.
const SERVICE_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'/').add(b'?').add(b'#');

/// How a backend expects its bytes: whether it terminates TLS itself and
/// whether it wants a PROXY v2 header first. The socket filename spells both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendKind {
  socket_filename: &'static str,
  pub tls: bool,
  pub proxy_protocol: bool,
}

impl BackendKind {
  pub fn socket_filename(&self) -> &'static str {
    self.socket_filename
  }
}

/// Probe order within one service. Client ALPN order outranks this order.
pub const BACKEND_KINDS: [BackendKind; 4] = [
  BackendKind {
    socket_filename: "cleartext",
    tls: false,
    proxy_protocol: false,
  },
  BackendKind {
    socket_filename: "cleartext+proxy",
    tls: false,
    proxy_protocol: true,
  },
  BackendKind {
    socket_filename: "tls",
    tls: true,
    proxy_protocol: false,
  },
  BackendKind {
    socket_filename: "tls+proxy",
    tls: true,
    proxy_protocol: true,
  },
];

/// A selected backend socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
  pub hostname: String,
  pub service: String,
  pub kind: BackendKind,
}

/// A filesystem-organized map from (hostname, service) to backend sockets:
/// `root/HOSTNAME/SERVICE/KIND`, with hostnames matched case-insensitively
/// and a `_`-wildcard fallback for the first label.
#[derive(Clone, Debug)]
pub struct SocketDirectory {
  path: PathBuf,
}

impl SocketDirectory {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
    }
  }

  fn hostname_path(&self, hostname: &str) -> PathBuf {
    self.path.join(hostname)
  }

  fn socket_path(&self, hostname: &str, service: &str, kind: BackendKind) -> PathBuf {
    self
      .hostname_path(hostname)
      .join(utf8_percent_encode(service, SERVICE_ESCAPE).to_string())
      .join(kind.socket_filename)
  }

  fn hostname_dir_exists(&self, hostname: &str) -> bool {
    let path = self.hostname_path(hostname);
    match std::fs::metadata(&path) {
      Ok(info) if info.is_dir() => true,
      Ok(_) => {
        debug!("ignoring {} because it is not a directory", path.display());
        false
      }
      Err(err) if err.kind() == io::ErrorKind::NotFound => false,
      Err(err) => {
        debug!("ignoring {} due to stat error: {err}", path.display());
        false
      }
    }
  }

  /// Normalize `hostname` and return the directory name serving it: the exact
  /// (lowercased) name when that directory exists, else the wildcard form.
  /// The returned name always names an existing directory under the root.
  pub fn canonicalize_hostname(&self, hostname: &str) -> Option<String> {
    let hostname = normalize_hostname(hostname)?;
    if self.hostname_dir_exists(&hostname) {
      return Some(hostname);
    }
    let wildcard = replace_first_label(&hostname, "_");
    if self.hostname_dir_exists(&wildcard) {
      return Some(wildcard);
    }
    None
  }

  pub fn serves_hostname(&self, hostname: &str) -> bool {
    self.canonicalize_hostname(hostname).is_some()
  }

  /// Pick the backend for a hostname and the client's ALPN list: services are
  /// tried in the client's preference order, kinds in [`BACKEND_KINDS`] order,
  /// and the first existing socket wins.
  pub fn get_backend(&self, hostname: &str, protocols: &[Vec<u8>]) -> Option<Backend> {
    let hostname = self.canonicalize_hostname(hostname)?;
    for protocol in protocols {
      let Ok(service) = std::str::from_utf8(protocol) else {
        continue;
      };
      for kind in BACKEND_KINDS {
        let path = self.socket_path(&hostname, service, kind);
        match std::fs::metadata(&path) {
          Ok(info) if info.file_type().is_socket() => {
            return Some(Backend {
              hostname,
              service: service.to_string(),
              kind,
            });
          }
          Ok(_) => debug!("ignoring {} because it is not a socket file", path.display()),
          Err(err) if err.kind() == io::ErrorKind::NotFound => {}
          Err(err) => debug!("ignoring {} due to stat error: {err}", path.display()),
        }
      }
    }
    None
  }

  pub async fn dial(&self, backend: &Backend) -> TlsdResult<UnixStream> {
    let path = self.socket_path(&backend.hostname, &backend.service, backend.kind);
    UnixStream::connect(&path).await.map_err(|source| TlsdError::BackendDial {
      hostname: backend.hostname.clone(),
      service: backend.service.clone(),
      kind: backend.kind.socket_filename,
      source,
    })
  }

  /// Hostname directories currently present under the root, wildcard and
  /// hidden entries excluded. Used to seed automatic certificate acquisition.
  pub fn hostnames(&self) -> Vec<String> {
    let mut hostnames = Vec::new();
    let Ok(entries) = std::fs::read_dir(&self.path) else {
      return hostnames;
    };
    for entry in entries.flatten() {
      let Ok(name) = entry.file_name().into_string() else {
        continue;
      };
      if name.starts_with('_') || name.starts_with('.') {
        continue;
      }
      if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
        hostnames.push(name);
      }
    }
    hostnames.sort();
    hostnames
  }
}

fn normalize_hostname(hostname: &str) -> Option<String> {
  if hostname.is_empty() || hostname.starts_with('.') || hostname.contains('/') {
    return None;
  }
  Some(hostname.to_ascii_lowercase().trim_end_matches('.').to_string())
}

fn replace_first_label(hostname: &str, replacement: &str) -> String {
  match hostname.find('.') {
    Some(dot) => format!("{replacement}{}", &hostname[dot..]),
    None => replacement.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::net::UnixListener;

  fn bind_socket(dir: &SocketDirectory, hostname: &str, service: &str, kind: BackendKind) -> UnixListener {
    let path = dir.socket_path(hostname, service, kind);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    UnixListener::bind(&path).unwrap()
  }

  fn kind(filename: &str) -> BackendKind {
    BACKEND_KINDS.into_iter().find(|k| k.socket_filename == filename).unwrap()
  }

  #[test]
  fn normalizes_hostnames() {
    assert_eq!(normalize_hostname("WwW.Example.com."), Some("www.example.com".to_string()));
    assert_eq!(normalize_hostname("WwW.Example.com."), normalize_hostname("www.example.com"));
    assert_eq!(normalize_hostname("etc/passwd"), None);
    assert_eq!(normalize_hostname(".example.com"), None);
    assert_eq!(normalize_hostname(""), None);
  }

  #[test]
  fn canonicalizes_against_existing_directories() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("www.example.com")).unwrap();
    std::fs::create_dir(root.path().join("_.example.com")).unwrap();
    let dir = SocketDirectory::new(root.path());

    assert_eq!(dir.canonicalize_hostname("WwW.Example.com."), Some("www.example.com".to_string()));
    assert_eq!(dir.canonicalize_hostname("api.example.com"), Some("_.example.com".to_string()));
    assert_eq!(dir.canonicalize_hostname("other.example.net"), None);
    assert!(dir.serves_hostname("www.example.com"));
    assert!(!dir.serves_hostname("nope.example.net"));
  }

  #[test]
  fn client_alpn_order_outranks_kind_order() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("www.example.com")).unwrap();
    let dir = SocketDirectory::new(root.path());
    let _h2 = bind_socket(&dir, "www.example.com", "h2", kind("cleartext+proxy"));
    let _http11 = bind_socket(&dir, "www.example.com", "http/1.1", kind("cleartext"));

    let backend = dir
      .get_backend("www.example.com", &[b"h2".to_vec(), b"http/1.1".to_vec()])
      .unwrap();
    assert_eq!(backend.hostname, "www.example.com");
    assert_eq!(backend.service, "h2");
    assert_eq!(backend.kind, kind("cleartext+proxy"));
    assert!(!backend.kind.tls);
    assert!(backend.kind.proxy_protocol);
  }

  #[test]
  fn wildcard_directory_serves_other_labels() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("_.example.com")).unwrap();
    let dir = SocketDirectory::new(root.path());
    let _sock = bind_socket(&dir, "_.example.com", "http/1.1", kind("cleartext"));

    let backend = dir.get_backend("api.example.com", &[b"http/1.1".to_vec()]).unwrap();
    assert_eq!(backend.hostname, "_.example.com");
    assert_eq!(backend.service, "http/1.1");
    assert_eq!(backend.kind, kind("cleartext"));
  }

  #[test]
  fn ignores_non_socket_files() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("www.example.com")).unwrap();
    let dir = SocketDirectory::new(root.path());
    let plain = dir.socket_path("www.example.com", "h2", kind("cleartext"));
    std::fs::create_dir_all(plain.parent().unwrap()).unwrap();
    std::fs::write(&plain, b"not a socket").unwrap();

    assert_eq!(dir.get_backend("www.example.com", &[b"h2".to_vec()]), None);
  }

  #[tokio::test]
  async fn dials_the_selected_backend() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("www.example.com")).unwrap();
    let dir = SocketDirectory::new(root.path());
    let listener = bind_socket(&dir, "www.example.com", "h2", kind("tls"));
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::UnixListener::from_std(listener).unwrap();

    let backend = dir.get_backend("www.example.com", &[b"h2".to_vec()]).unwrap();
    let _client = dir.dial(&backend).await.unwrap();
    let (_server, _) = listener.accept().await.unwrap();
  }

  #[test]
  fn lists_hostname_directories() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("b.example.com")).unwrap();
    std::fs::create_dir(root.path().join("a.example.com")).unwrap();
    std::fs::create_dir(root.path().join("_.example.com")).unwrap();
    std::fs::write(root.path().join("stray-file"), b"x").unwrap();

    let dir = SocketDirectory::new(root.path());
    assert_eq!(dir.hostnames(), vec!["a.example.com".to_string(), "b.example.com".to_string()]);
  }
}
