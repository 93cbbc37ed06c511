use crate::acceptor::{closed_error, Acceptor, ConnAddr, Connection, ListenerAddr};
use async_trait::async_trait;
use std::{
  io,
  sync::atomic::{AtomicBool, Ordering},
};
use tokio::{net::TcpListener, sync::RwLock};
use tokio_util::sync::CancellationToken;

/// Acceptor over a bound TCP socket.
pub struct TcpAcceptor {
  inner: RwLock<Option<TcpListener>>,
  addr: ListenerAddr,
  closed: CancellationToken,
  close_flag: AtomicBool,
}

impl std::fmt::Debug for TcpAcceptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TcpAcceptor").field("addr", &self.addr).finish()
  }
}

impl TcpAcceptor {
  /// Adopt an already-bound std listener. Must be called within a tokio runtime.
  pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let addr = ListenerAddr::Inet(listener.local_addr()?);
    Ok(Self {
      inner: RwLock::new(Some(listener)),
      addr,
      closed: CancellationToken::new(),
      close_flag: AtomicBool::new(false),
    })
  }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
  async fn accept(&self) -> io::Result<Connection> {
    let guard = self.inner.read().await;
    let Some(listener) = guard.as_ref() else {
      return Err(closed_error());
    };
    tokio::select! {
      _ = self.closed.cancelled() => Err(closed_error()),
      res = listener.accept() => {
        let (stream, remote_addr) = res?;
        let local_addr = stream.local_addr()?;
        Ok(Connection::new(stream, ConnAddr::Inet(local_addr), ConnAddr::Inet(remote_addr)))
      }
    }
  }

  fn addr(&self) -> ListenerAddr {
    self.addr.clone()
  }

  async fn close(&self) -> io::Result<()> {
    if self.close_flag.swap(true, Ordering::SeqCst) {
      return Err(closed_error());
    }
    self.closed.cancel();
    self.inner.write().await.take();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::acceptor::is_closed;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn bind_localhost() -> TcpAcceptor {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    TcpAcceptor::from_std(listener).unwrap()
  }

  #[tokio::test]
  async fn accepts_and_carries_peer_addrs() {
    let acceptor = bind_localhost();
    let ListenerAddr::Inet(addr) = acceptor.addr() else {
      panic!("expected inet addr")
    };

    let client = tokio::spawn(async move {
      let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
      stream.write_all(b"ABC").await.unwrap();
      stream
    });

    let mut conn = acceptor.accept().await.unwrap();
    let mut buf = [0u8; 3];
    conn.stream_mut().read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABC");

    let client = client.await.unwrap();
    assert_eq!(conn.remote_addr(), &ConnAddr::Inet(client.local_addr().unwrap()));
    assert_eq!(conn.local_addr(), &ConnAddr::Inet(addr));
  }

  #[tokio::test]
  async fn close_is_idempotent() {
    let acceptor = bind_localhost();
    acceptor.close().await.unwrap();
    let err = acceptor.close().await.unwrap_err();
    assert!(is_closed(&err));
    let err = acceptor.accept().await.unwrap_err();
    assert!(is_closed(&err));
  }
}
