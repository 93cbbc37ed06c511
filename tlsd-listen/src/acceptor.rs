use async_trait::async_trait;
use std::{fmt, io, net::SocketAddr, path::PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream produced by an [`Acceptor`].
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Boxed stream, the concrete transport erased.
pub type BoxedStream = Box<dyn Stream>;

/// Address attached to one side of an accepted connection. The PROXY-wrapping
/// acceptor overrides these with the values carried in the PROXY v2 header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnAddr {
  Inet(SocketAddr),
  Unix(Option<PathBuf>),
  Unspecified,
}

impl fmt::Display for ConnAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConnAddr::Inet(addr) => addr.fmt(f),
      ConnAddr::Unix(Some(path)) => path.display().fmt(f),
      ConnAddr::Unix(None) => f.write_str("unix"),
      ConnAddr::Unspecified => f.write_str("unspecified"),
    }
  }
}

/// Address an acceptor is bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerAddr {
  Inet(SocketAddr),
  Unix(Option<PathBuf>),
  /// Placeholder address of the fan-in acceptor.
  Multi,
}

impl fmt::Display for ListenerAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ListenerAddr::Inet(addr) => addr.fmt(f),
      ListenerAddr::Unix(Some(path)) => path.display().fmt(f),
      ListenerAddr::Unix(None) => f.write_str("unix"),
      ListenerAddr::Multi => f.write_str("multi"),
    }
  }
}

/// A connection as handed out by an acceptor: the stream plus the local and
/// remote addresses it is attributed to.
pub struct Connection {
  stream: BoxedStream,
  local_addr: ConnAddr,
  remote_addr: ConnAddr,
}

impl Connection {
  pub fn new<S: Stream + 'static>(stream: S, local_addr: ConnAddr, remote_addr: ConnAddr) -> Self {
    Self {
      stream: Box::new(stream),
      local_addr,
      remote_addr,
    }
  }

  pub fn local_addr(&self) -> &ConnAddr {
    &self.local_addr
  }

  pub fn remote_addr(&self) -> &ConnAddr {
    &self.remote_addr
  }

  /// Override the attributed addresses, e.g. with the ones a PROXY header carried.
  pub fn set_addrs(&mut self, local_addr: ConnAddr, remote_addr: ConnAddr) {
    self.local_addr = local_addr;
    self.remote_addr = remote_addr;
  }

  pub fn stream_mut(&mut self) -> &mut BoxedStream {
    &mut self.stream
  }

  pub fn into_stream(self) -> BoxedStream {
    self.stream
  }

  pub fn into_parts(self) -> (BoxedStream, ConnAddr, ConnAddr) {
    (self.stream, self.local_addr, self.remote_addr)
  }
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .finish_non_exhaustive()
  }
}

/// Produces successive bidirectional connections.
///
/// Wrapping acceptors (PROXY, TLS, multi) take exclusive ownership of their
/// inner acceptor at construction; the wrapper's `close` is the sole path that
/// closes children.
#[async_trait]
pub trait Acceptor: Send + Sync + fmt::Debug {
  /// Wait for and return the next connection.
  async fn accept(&self) -> io::Result<Connection>;

  /// Address the acceptor is bound to.
  fn addr(&self) -> ListenerAddr;

  /// Close the acceptor. The first call releases the underlying resources and
  /// wakes pending `accept` calls with the closed error; every later call
  /// returns the closed error itself.
  async fn close(&self) -> io::Result<()>;
}

#[derive(Debug)]
struct ClosedError;

impl fmt::Display for ClosedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("use of closed listener")
  }
}

impl std::error::Error for ClosedError {}

/// The error returned by `accept` and `close` once an acceptor is closed.
pub fn closed_error() -> io::Error {
  io::Error::other(ClosedError)
}

pub fn is_closed(err: &io::Error) -> bool {
  err.get_ref().map(|inner| inner.is::<ClosedError>()).unwrap_or(false)
}

#[derive(Debug)]
struct TemporaryError {
  inner: io::Error,
}

impl fmt::Display for TemporaryError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.inner.fmt(f)
  }
}

impl std::error::Error for TemporaryError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.inner)
  }
}

/// Mark an accept error as temporary: the serve loop logs it and keeps accepting
/// instead of shutting down.
pub fn temporary_error(inner: io::Error) -> io::Error {
  io::Error::other(TemporaryError { inner })
}

pub fn is_temporary(err: &io::Error) -> bool {
  err.get_ref().map(|inner| inner.is::<TemporaryError>()).unwrap_or(false)
}
