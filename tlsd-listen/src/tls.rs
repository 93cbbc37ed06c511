use crate::{
  acceptor::{closed_error, is_closed, temporary_error, Acceptor, Connection, ListenerAddr},
  error::{ListenError, ListenResult},
  log::*,
  registry::{open, open_json, BuildAcceptor, Params},
};
use async_trait::async_trait;
use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};
use tlsd_certs::CertProvider;
use tokio::{
  sync::{mpsc, Mutex},
  time::timeout,
};
use tokio_util::sync::CancellationToken;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// `tls` / `https`: argument `CERT_SPEC:SOCKET_SPEC` where CERT_SPEC is a
/// certificate directory (absolute path ending in `/`), a single certificate
/// file (any other absolute path), or a comma-separated hostname list for
/// automatic acquisition. Keyed options: `cert`, `cert_directory`,
/// `autocert_hostnames`, `listener`, `default_server_name`.
pub(crate) struct TlsBuilder;

#[async_trait]
impl BuildAcceptor for TlsBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let mut next_protos: Vec<Vec<u8>> = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let provider;
    let inner;

    if !arg.is_empty() {
      let Some((cert_spec, inner_spec)) = arg.split_once(':') else {
        return Err(ListenError::InvalidTlsSpec);
      };
      provider = provider_for_cert_spec(cert_spec, &mut next_protos)?;
      inner = open(inner_spec).await?;
    } else {
      let params = params.ok_or(ListenError::MissingCertificate)?;
      provider = if let Some(path) = params.get("cert").and_then(|v| v.as_str()) {
        CertProvider::file(path)
      } else if let Some(path) = params.get("cert_directory").and_then(|v| v.as_str()) {
        CertProvider::directory(path)
      } else if let Some(hostnames) = params.get("autocert_hostnames").and_then(|v| v.as_array()) {
        let hostnames = hostnames
          .iter()
          .filter_map(|v| v.as_str().map(str::to_string))
          .collect::<Vec<_>>();
        autocert_provider(hostnames, &mut next_protos)?
      } else {
        return Err(ListenError::MissingCertificate);
      };
      let Some(inner_spec) = params.get("listener").and_then(|v| v.as_object()) else {
        return Err(ListenError::MissingInner);
      };
      inner = open_json(inner_spec).await?;
    }

    let provider = match params.and_then(|p| p.get("default_server_name")).and_then(|v| v.as_str()) {
      Some(name) if !name.is_empty() => provider.with_default_server_name(name),
      _ => provider,
    };

    let mut config = rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_cert_resolver(provider.rustls_resolver());
    config.alpn_protocols = next_protos;

    Ok(Box::new(TlsTerminator::new(inner, Arc::new(config))))
  }
}

fn provider_for_cert_spec(cert_spec: &str, next_protos: &mut Vec<Vec<u8>>) -> ListenResult<CertProvider> {
  if cert_spec.starts_with('/') && cert_spec.ends_with('/') {
    Ok(CertProvider::directory(cert_spec))
  } else if cert_spec.starts_with('/') {
    Ok(CertProvider::file(cert_spec))
  } else {
    let hostnames = cert_spec.split(',').map(str::to_string).collect::<Vec<_>>();
    autocert_provider(hostnames, next_protos)
  }
}

#[cfg(feature = "acme")]
fn autocert_provider(hostnames: Vec<String>, next_protos: &mut Vec<Vec<u8>>) -> ListenResult<CertProvider> {
  next_protos.push(tlsd_certs::ACME_TLS_ALPN_NAME.to_vec());
  Ok(CertProvider::autocert(hostnames)?)
}

#[cfg(not(feature = "acme"))]
fn autocert_provider(_hostnames: Vec<String>, _next_protos: &mut Vec<Vec<u8>>) -> ListenResult<CertProvider> {
  Err(ListenError::AcmeUnavailable)
}

/// Accepts connections from an inner acceptor and completes a TLS server
/// handshake before delivering them, so consumers see plaintext streams.
///
/// Handshakes run in per-connection tasks with a deadline; a failed or late
/// handshake closes that connection and surfaces as a temporary accept error.
pub struct TlsTerminator {
  inner: Arc<dyn Acceptor>,
  conns: Mutex<mpsc::Receiver<Connection>>,
  errors: Mutex<mpsc::Receiver<io::Error>>,
  closed: CancellationToken,
  close_flag: AtomicBool,
}

impl std::fmt::Debug for TlsTerminator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsTerminator").finish()
  }
}

impl TlsTerminator {
  /// Take ownership of `inner` and start its accept loop. Must be called
  /// within a tokio runtime.
  pub fn new(inner: Box<dyn Acceptor>, config: Arc<rustls::ServerConfig>) -> Self {
    let inner: Arc<dyn Acceptor> = Arc::from(inner);
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let closed = CancellationToken::new();
    tokio::spawn(handle_accepts(
      inner.clone(),
      tokio_rustls::TlsAcceptor::from(config),
      conn_tx,
      err_tx,
      closed.clone(),
    ));
    Self {
      inner,
      conns: Mutex::new(conn_rx),
      errors: Mutex::new(err_rx),
      closed,
      close_flag: AtomicBool::new(false),
    }
  }
}

async fn handle_accepts(
  inner: Arc<dyn Acceptor>,
  tls_acceptor: tokio_rustls::TlsAcceptor,
  conn_tx: mpsc::Sender<Connection>,
  err_tx: mpsc::Sender<io::Error>,
  closed: CancellationToken,
) {
  loop {
    let res = tokio::select! {
      _ = closed.cancelled() => break,
      res = inner.accept() => res,
    };
    match res {
      Err(err) if is_closed(&err) => break,
      Err(err) => {
        if !send(&err_tx, err, &closed).await {
          break;
        }
      }
      Ok(conn) => {
        tokio::spawn(handle_connection(
          conn,
          tls_acceptor.clone(),
          conn_tx.clone(),
          err_tx.clone(),
          closed.clone(),
        ));
      }
    }
  }
}

async fn handle_connection(
  conn: Connection,
  tls_acceptor: tokio_rustls::TlsAcceptor,
  conn_tx: mpsc::Sender<Connection>,
  err_tx: mpsc::Sender<io::Error>,
  closed: CancellationToken,
) {
  let (stream, local_addr, remote_addr) = conn.into_parts();
  match timeout(TLS_HANDSHAKE_TIMEOUT, tls_acceptor.accept(stream)).await {
    Ok(Ok(tls_stream)) => {
      send(&conn_tx, Connection::new(tls_stream, local_addr, remote_addr), &closed).await;
    }
    Ok(Err(err)) => {
      debug!("TLS handshake with {remote_addr} failed: {err}");
      send(
        &err_tx,
        temporary_error(io::Error::other(format!("TLS handshake: {err}"))),
        &closed,
      )
      .await;
    }
    Err(_) => {
      send(&err_tx, temporary_error(io::Error::other("TLS handshake timed out")), &closed).await;
    }
  }
}

async fn send<T>(tx: &mpsc::Sender<T>, value: T, closed: &CancellationToken) -> bool {
  tokio::select! {
    _ = closed.cancelled() => false,
    res = tx.send(value) => res.is_ok(),
  }
}

#[async_trait]
impl Acceptor for TlsTerminator {
  async fn accept(&self) -> io::Result<Connection> {
    let mut conns = self.conns.lock().await;
    let mut errors = self.errors.lock().await;
    tokio::select! {
      _ = self.closed.cancelled() => Err(closed_error()),
      Some(conn) = conns.recv() => Ok(conn),
      Some(err) = errors.recv() => Err(err),
      else => Err(closed_error()),
    }
  }

  fn addr(&self) -> ListenerAddr {
    self.inner.addr()
  }

  async fn close(&self) -> io::Result<()> {
    if self.close_flag.swap(true, Ordering::SeqCst) {
      return Err(closed_error());
    }
    self.closed.cancel();
    self.inner.close().await
  }
}
