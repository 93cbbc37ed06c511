use crate::error::*;
use rustls::server::Acceptor as HelloCapture;
use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};
use tlsd_certs::HelloInfo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Read the TLS ClientHello from `stream` without consuming it: every byte
/// read is buffered, the buffer is fed to a rustls handshake acceptor purely
/// to capture the hello, and the buffered bytes are returned so the caller can
/// re-prepend them with [`PeekedStream`].
pub(crate) async fn peek_client_hello<S>(stream: &mut S) -> TlsdResult<(HelloInfo, Vec<u8>)>
where
  S: AsyncRead + Unpin,
{
  let mut capture = HelloCapture::default();
  let mut buffered: Vec<u8> = Vec::with_capacity(4096);
  let mut fed = 0usize;
  let mut chunk = [0u8; 4096];

  loop {
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      return Err(TlsdError::InvalidClientHello(
        "connection closed before ClientHello".to_string(),
      ));
    }
    buffered.extend_from_slice(&chunk[..n]);

    while fed < buffered.len() {
      let mut unread = &buffered[fed..];
      match capture.read_tls(&mut unread) {
        Ok(0) => break,
        Ok(consumed) => fed += consumed,
        Err(err) => return Err(TlsdError::Io(err)),
      }
      match capture.accept() {
        Ok(Some(accepted)) => {
          let hello = HelloInfo::from_client_hello(&accepted.client_hello());
          return Ok((hello, buffered));
        }
        Ok(None) => {}
        Err((err, _alert)) => return Err(TlsdError::InvalidClientHello(err.to_string())),
      }
    }
  }
}

/// A stream that replays peeked bytes before reading from the live connection,
/// so the next consumer sees the stream from byte 0. Writes pass through.
pub(crate) struct PeekedStream<S> {
  buffered: Vec<u8>,
  offset: usize,
  inner: S,
}

impl<S> PeekedStream<S> {
  pub(crate) fn new(buffered: Vec<u8>, inner: S) -> Self {
    Self {
      buffered,
      offset: 0,
      inner,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if this.offset < this.buffered.len() {
      let remaining = &this.buffered[this.offset..];
      let n = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..n]);
      this.offset += n;
      if this.offset == this.buffered.len() {
        this.buffered = Vec::new();
        this.offset = 0;
      }
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rustls::pki_types::ServerName;
  use std::{io::Cursor, sync::Arc};

  fn client_hello_bytes(server_name: &str, alpn: &[&[u8]]) -> Vec<u8> {
    let mut config = rustls::ClientConfig::builder()
      .with_root_certificates(rustls::RootCertStore::empty())
      .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let server_name = ServerName::try_from(server_name.to_string()).unwrap();
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name).unwrap();
    let mut wire = Vec::new();
    while conn.wants_write() {
      conn.write_tls(&mut wire).unwrap();
    }
    wire
  }

  #[tokio::test]
  async fn peeks_sni_and_alpn_without_consuming() {
    let wire = client_hello_bytes("peek.example", &[b"h2", b"http/1.1"]);
    let mut stream = Cursor::new(wire.clone());

    let (hello, buffered) = peek_client_hello(&mut stream).await.unwrap();
    assert_eq!(hello.server_name.as_deref(), Some("peek.example"));
    assert_eq!(hello.alpn, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    assert!(!hello.signature_schemes.is_empty());

    // the peeked stream replays the hello from byte 0
    let consumed = stream.position() as usize;
    let mut replay = PeekedStream::new(buffered, stream);
    let mut replayed = vec![0u8; consumed];
    replay.read_exact(&mut replayed).await.unwrap();
    assert_eq!(replayed, wire[..consumed]);
  }

  #[tokio::test]
  async fn rejects_non_tls_bytes() {
    let mut stream = Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    let err = peek_client_hello(&mut stream).await.unwrap_err();
    assert!(matches!(err, TlsdError::InvalidClientHello(_)));
  }

  #[tokio::test]
  async fn peeked_stream_prepends_buffer() {
    let mut stream = PeekedStream::new(b"hello ".to_vec(), Cursor::new(b"world".to_vec()));
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }
}
