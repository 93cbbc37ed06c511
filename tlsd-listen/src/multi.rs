use crate::acceptor::{closed_error, is_closed, Acceptor, Connection, ListenerAddr};
use async_trait::async_trait;
use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Aggregates the provided acceptors into one. `accept` returns the next
/// available connection among all of them; `close` closes each child and
/// causes blocked `accept` calls to return the closed error.
pub struct MultiAcceptor {
  children: Vec<Arc<dyn Acceptor>>,
  conns: Mutex<mpsc::Receiver<Connection>>,
  errors: Mutex<mpsc::Receiver<io::Error>>,
  closed: CancellationToken,
  close_flag: AtomicBool,
}

impl std::fmt::Debug for MultiAcceptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MultiAcceptor").field("children", &self.children.len()).finish()
  }
}

impl MultiAcceptor {
  /// Take ownership of `children` and start their accept loops. Must be called
  /// within a tokio runtime.
  pub fn new(children: Vec<Box<dyn Acceptor>>) -> Self {
    let children: Vec<Arc<dyn Acceptor>> = children.into_iter().map(Arc::from).collect();
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let closed = CancellationToken::new();
    for child in &children {
      tokio::spawn(handle_accepts(child.clone(), conn_tx.clone(), err_tx.clone(), closed.clone()));
    }
    Self {
      children,
      conns: Mutex::new(conn_rx),
      errors: Mutex::new(err_rx),
      closed,
      close_flag: AtomicBool::new(false),
    }
  }
}

async fn handle_accepts(
  child: Arc<dyn Acceptor>,
  conn_tx: mpsc::Sender<Connection>,
  err_tx: mpsc::Sender<io::Error>,
  closed: CancellationToken,
) {
  loop {
    let res = tokio::select! {
      _ = closed.cancelled() => break,
      res = child.accept() => res,
    };
    match res {
      Err(err) if is_closed(&err) => break,
      Err(err) => {
        if !send(&err_tx, err, &closed).await {
          break;
        }
      }
      Ok(conn) => {
        // a refused send drops (closes) the connection
        if !send(&conn_tx, conn, &closed).await {
          break;
        }
      }
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
impl Acceptor for MultiAcceptor {
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
    ListenerAddr::Multi
  }

  async fn close(&self) -> io::Result<()> {
    if self.close_flag.swap(true, Ordering::SeqCst) {
      return Err(closed_error());
    }
    self.closed.cancel();
    for child in &self.children {
      let _ = child.close().await;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{acceptor::ConnAddr, tcp::TcpAcceptor};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn bind_localhost() -> (TcpAcceptor, std::net::SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (TcpAcceptor::from_std(listener).unwrap(), addr)
  }

  #[tokio::test]
  async fn accepts_from_all_children() {
    let (first, first_addr) = bind_localhost();
    let (second, second_addr) = bind_localhost();
    let multi = MultiAcceptor::new(vec![Box::new(first), Box::new(second)]);
    assert_eq!(multi.addr(), ListenerAddr::Multi);

    for addr in [first_addr, second_addr] {
      let client = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"x").await.unwrap();
      });
      let mut conn = multi.accept().await.unwrap();
      assert!(matches!(conn.remote_addr(), ConnAddr::Inet(_)));
      let mut buf = [0u8; 1];
      conn.stream_mut().read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"x");
      client.await.unwrap();
    }
  }

  #[tokio::test]
  async fn close_is_idempotent_and_fails_accept() {
    let (first, _) = bind_localhost();
    let multi = MultiAcceptor::new(vec![Box::new(first)]);

    multi.close().await.unwrap();
    let err = multi.accept().await.unwrap_err();
    assert!(is_closed(&err));
    let err = multi.close().await.unwrap_err();
    assert!(is_closed(&err));
  }
}
