use crate::{
  acceptor::{closed_error, is_closed, temporary_error, Acceptor, ConnAddr, Connection, ListenerAddr},
  proxy::header::{read_header, ProxyAddr},
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
use tokio::{
  sync::{mpsc, Mutex},
  time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Deadline for the client to finish its PROXY greeting.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts connections from an inner acceptor, reads the PROXY v2 header from
/// each client, and delivers the connection with its local and remote addresses
/// overridden by the values in the header.
///
/// Header reads run concurrently across connections, so a slow greeting does
/// not stall others; connections are delivered in the order their headers
/// finish parsing. A malformed or late greeting closes that connection and
/// surfaces as a temporary accept error.
pub struct ProxyAcceptor {
  inner: Arc<dyn Acceptor>,
  conns: Mutex<mpsc::Receiver<Connection>>,
  errors: Mutex<mpsc::Receiver<io::Error>>,
  closed: CancellationToken,
  close_flag: AtomicBool,
}

impl std::fmt::Debug for ProxyAcceptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyAcceptor").finish()
  }
}

impl ProxyAcceptor {
  /// Take ownership of `inner` and start its accept loop. Must be called
  /// within a tokio runtime.
  pub fn new(inner: Box<dyn Acceptor>) -> Self {
    let inner: Arc<dyn Acceptor> = Arc::from(inner);
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let closed = CancellationToken::new();
    tokio::spawn(handle_accepts(inner.clone(), conn_tx, err_tx, closed.clone()));
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
        tokio::spawn(handle_connection(conn, conn_tx.clone(), err_tx.clone(), closed.clone()));
      }
    }
  }
}

async fn handle_connection(
  mut conn: Connection,
  conn_tx: mpsc::Sender<Connection>,
  err_tx: mpsc::Sender<io::Error>,
  closed: CancellationToken,
) {
  let fallback_local = proxy_addr_of(conn.local_addr());
  let fallback_remote = proxy_addr_of(conn.remote_addr());

  let header = match timeout(HEADER_READ_TIMEOUT, read_header(conn.stream_mut(), fallback_local, fallback_remote)).await {
    Ok(Ok(header)) => header,
    Ok(Err(err)) => {
      drop(conn);
      send(
        &err_tx,
        temporary_error(io::Error::other(format!("reading proxy header: {err}"))),
        &closed,
      )
      .await;
      return;
    }
    Err(_) => {
      drop(conn);
      send(
        &err_tx,
        temporary_error(io::Error::other("timed out reading proxy header")),
        &closed,
      )
      .await;
      return;
    }
  };

  conn.set_addrs(conn_addr_of(header.local), conn_addr_of(header.remote));
  // a refused send drops (closes) the connection
  send(&conn_tx, conn, &closed).await;
}

async fn send<T>(tx: &mpsc::Sender<T>, value: T, closed: &CancellationToken) -> bool {
  tokio::select! {
    _ = closed.cancelled() => false,
    res = tx.send(value) => res.is_ok(),
  }
}

fn proxy_addr_of(addr: &ConnAddr) -> ProxyAddr {
  match addr {
    ConnAddr::Inet(addr) => ProxyAddr::Tcp(*addr),
    _ => ProxyAddr::Unspecified,
  }
}

fn conn_addr_of(addr: ProxyAddr) -> ConnAddr {
  match addr.socket_addr() {
    Some(addr) => ConnAddr::Inet(addr),
    None => ConnAddr::Unspecified,
  }
}

#[async_trait]
impl Acceptor for ProxyAcceptor {
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

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{acceptor::is_temporary, proxy::header::Header, tcp::TcpAcceptor};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn wrap_localhost() -> (ProxyAcceptor, std::net::SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let inner = TcpAcceptor::from_std(listener).unwrap();
    (ProxyAcceptor::new(Box::new(inner)), addr)
  }

  fn local_greeting() -> Vec<u8> {
    let mut wire = vec![0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];
    wire.push(0x20); // version 2, LOCAL
    wire.push(0x00);
    wire.extend_from_slice(&[0x00, 0x00]);
    wire
  }

  #[tokio::test]
  async fn local_greeting_keeps_real_peer_and_replays_payload() {
    let (acceptor, addr) = wrap_localhost();

    let client = tokio::spawn(async move {
      let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
      let mut wire = local_greeting();
      wire.extend_from_slice(b"XY");
      stream.write_all(&wire).await.unwrap();
      stream
    });

    let mut conn = acceptor.accept().await.unwrap();
    let mut buf = [0u8; 2];
    conn.stream_mut().read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"XY");

    let client = client.await.unwrap();
    assert_eq!(conn.remote_addr(), &ConnAddr::Inet(client.local_addr().unwrap()));
  }

  #[tokio::test]
  async fn proxy_greeting_overrides_addrs() {
    let (acceptor, addr) = wrap_localhost();
    let header = Header {
      remote: ProxyAddr::Tcp("1.2.3.4:1234".parse().unwrap()),
      local: ProxyAddr::Tcp("5.6.7.8:8080".parse().unwrap()),
    };

    let client = tokio::spawn(async move {
      let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
      stream.write_all(&header.format()).await.unwrap();
      stream
    });

    let conn = acceptor.accept().await.unwrap();
    assert_eq!(conn.remote_addr(), &ConnAddr::Inet("1.2.3.4:1234".parse().unwrap()));
    assert_eq!(conn.local_addr(), &ConnAddr::Inet("5.6.7.8:8080".parse().unwrap()));
    client.await.unwrap();
  }

  #[tokio::test]
  async fn malformed_greeting_surfaces_temporary_error() {
    let (acceptor, addr) = wrap_localhost();

    let client = tokio::spawn(async move {
      let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
      stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
      stream
    });

    let err = acceptor.accept().await.unwrap_err();
    assert!(is_temporary(&err));
    client.await.unwrap();
  }

  #[tokio::test]
  async fn close_is_idempotent() {
    let (acceptor, _) = wrap_localhost();
    acceptor.close().await.unwrap();
    assert!(is_closed(&acceptor.close().await.unwrap_err()));
    assert!(is_closed(&acceptor.accept().await.unwrap_err()));
  }
}
