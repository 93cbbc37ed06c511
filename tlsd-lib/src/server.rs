use crate::{
  constants::{CLIENT_HELLO_TIMEOUT_SEC, TLS_HANDSHAKE_TIMEOUT_SEC},
  error::*,
  globals::Globals,
  hello::{peek_client_hello, PeekedStream},
  log::*,
  socketdir::Backend,
};
use std::{sync::Arc, time::Duration};
use tlsd_certs::{CertProvider, HelloInfo, ACME_TLS_ALPN_NAME};
use tokio::{
  io::AsyncWriteExt,
  net::UnixStream,
  time::timeout,
};
use tlsd_listen::{is_temporary, Acceptor, BoxedStream, ConnAddr, Connection, Header, ProxyAddr};

/// The router: peeks the ClientHello, picks a backend from the socket
/// directory, optionally terminates TLS, and splices bytes.
pub(crate) struct Router {
  globals: Arc<Globals>,
}

impl Router {
  pub(crate) fn new(globals: Arc<Globals>) -> Self {
    Self { globals }
  }

  /// Accept loop over one acceptor. Temporary network errors are logged and
  /// the loop continues; any other accept error surfaces.
  pub(crate) async fn serve(self: Arc<Self>, acceptor: Box<dyn Acceptor>) -> TlsdResult<()> {
    info!("serving connections on {}", acceptor.addr());
    loop {
      match acceptor.accept().await {
        Ok(conn) => {
          let router = self.clone();
          self.globals.runtime_handle.spawn(async move {
            router.handle_connection(conn).await;
          });
        }
        Err(err) if is_temporary(&err) => {
          warn!("temporary network error accepting connection: {err}");
        }
        Err(err) => return Err(TlsdError::Io(err)),
      }
    }
  }

  async fn handle_connection(&self, conn: Connection) {
    let remote_addr = conn.remote_addr().clone();
    if let Err(err) = self.route_connection(conn).await {
      info!("dropping connection from {remote_addr}: {err}");
    }
  }

  async fn route_connection(&self, conn: Connection) -> TlsdResult<()> {
    let (mut stream, local_addr, remote_addr) = conn.into_parts();

    let (mut hello, buffered) = timeout(
      Duration::from_secs(CLIENT_HELLO_TIMEOUT_SEC),
      peek_client_hello(&mut stream),
    )
    .await
    .map_err(|_| TlsdError::ClientHelloTimeout)??;
    let stream: BoxedStream = Box::new(PeekedStream::new(buffered, stream));

    let server_name = match hello.server_name.as_deref().filter(|name| !name.is_empty()) {
      Some(name) => name.to_string(),
      None => self
        .globals
        .router_config
        .default_hostname
        .clone()
        .ok_or(TlsdError::NoServerName)?,
    };
    hello.server_name = Some(server_name.clone());
    if hello.alpn.is_empty() {
      let default_protocol = self
        .globals
        .router_config
        .default_protocol
        .clone()
        .ok_or(TlsdError::NoProtocol)?;
      hello.alpn = vec![default_protocol.into_bytes()];
    }

    if self.globals.router_config.handle_acme && hello.alpn.len() == 1 && hello.alpn[0] == ACME_TLS_ALPN_NAME {
      return self.handle_acme_connection(stream, &hello).await;
    }

    let Some(backend) = self.globals.socket_dir.get_backend(&server_name, &hello.alpn) else {
      return Err(TlsdError::NoBackend {
        hostname: server_name,
        protocols: hello.alpn.iter().map(|p| String::from_utf8_lossy(p).into_owned()).collect(),
      });
    };
    debug!(
      "routing {remote_addr} to backend {}/{}/{}",
      backend.hostname,
      backend.service,
      backend.kind.socket_filename()
    );

    // a backend that does not speak TLS itself gets the decrypted stream
    let client_stream = if backend.kind.tls {
      stream
    } else {
      self.terminate_tls(stream, &hello, &backend).await?
    };

    let mut backend_conn = self.globals.socket_dir.dial(&backend).await?;

    if backend.kind.proxy_protocol {
      let header = Header {
        remote: proxy_addr_of(&remote_addr),
        local: proxy_addr_of(&local_addr),
      };
      backend_conn
        .write_all(&header.format())
        .await
        .map_err(TlsdError::ProxyHeaderWrite)?;
    }

    splice(client_stream, backend_conn).await;
    Ok(())
  }

  /// Answer an ACME tls-alpn-01 challenge: handshake with the certificate
  /// source for a hostname we actually serve, then close.
  async fn handle_acme_connection(&self, stream: BoxedStream, hello: &HelloInfo) -> TlsdResult<()> {
    let server_name = hello.server_name.as_deref().unwrap_or("");
    if !self.globals.socket_dir.serves_hostname(server_name) {
      return Err(TlsdError::AcmeUnknownHostname(server_name.to_string()));
    }
    let provider = self.cert_provider()?;
    let config = provider.server_config(hello, vec![ACME_TLS_ALPN_NAME.to_vec()])?;

    let acceptor = tokio_rustls::TlsAcceptor::from(config);
    let mut tls_stream = timeout(Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SEC), acceptor.accept(stream))
      .await
      .map_err(|_| TlsdError::HandshakeTimeout)?
      .map_err(|err| TlsdError::Handshake(err.to_string()))?;
    debug!("completed ACME challenge handshake for {server_name:?}");
    let _ = tls_stream.shutdown().await;
    Ok(())
  }

  async fn terminate_tls(&self, stream: BoxedStream, hello: &HelloInfo, backend: &Backend) -> TlsdResult<BoxedStream> {
    let provider = self.cert_provider()?;
    let config = provider.server_config(hello, vec![backend.service.clone().into_bytes()])?;

    let acceptor = tokio_rustls::TlsAcceptor::from(config);
    let tls_stream = timeout(Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SEC), acceptor.accept(stream))
      .await
      .map_err(|_| TlsdError::HandshakeTimeout)?
      .map_err(|err| TlsdError::Handshake(err.to_string()))?;
    Ok(Box::new(tls_stream))
  }

  fn cert_provider(&self) -> TlsdResult<&CertProvider> {
    self.globals.cert_provider.as_ref().ok_or(TlsdError::NoCertificateSource)
  }
}

fn proxy_addr_of(addr: &ConnAddr) -> ProxyAddr {
  match addr {
    ConnAddr::Inet(addr) => ProxyAddr::Tcp(*addr),
    _ => ProxyAddr::Unspecified,
  }
}

/// Copy both directions. When client→backend reaches EOF the backend's write
/// side is half-closed so FIN-driven protocols complete; when backend→client
/// finishes everything is torn down.
async fn splice(client: BoxedStream, backend: UnixStream) {
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut backend_read, mut backend_write) = backend.into_split();

  let forward = tokio::spawn(async move {
    let _ = tokio::io::copy(&mut client_read, &mut backend_write).await;
    let _ = backend_write.shutdown().await;
  });

  let _ = tokio::io::copy(&mut backend_read, &mut client_write).await;
  let _ = client_write.shutdown().await;
  forward.abort();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{globals::RouterConfigBuilder, socketdir::SocketDirectory};
  use std::io::Write as _;
  use tlsd_listen::{open, read_header, ListenerAddr};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  struct Harness {
    _socket_root: tempfile::TempDir,
    _cert_root: tempfile::TempDir,
    socket_dir: SocketDirectory,
    cert_der: Vec<u8>,
  }

  fn harness(hostname: &str) -> Harness {
    let socket_root = tempfile::tempdir().unwrap();
    std::fs::create_dir(socket_root.path().join(hostname)).unwrap();
    let cert_root = tempfile::tempdir().unwrap();

    let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
    let mut bundle = std::fs::File::create(cert_root.path().join(format!("{hostname}.pem"))).unwrap();
    write!(bundle, "{}{}", cert.cert.pem(), cert.key_pair.serialize_pem()).unwrap();

    Harness {
      socket_dir: SocketDirectory::new(socket_root.path()),
      cert_der: cert.cert.der().as_ref().to_vec(),
      _socket_root: socket_root,
      _cert_root: cert_root,
    }
  }

  async fn start_router(h: &Harness, cert_dir: &std::path::Path) -> std::net::SocketAddr {
    let acceptor = open("tcp:127.0.0.1:0").await.unwrap();
    let ListenerAddr::Inet(addr) = acceptor.addr() else {
      panic!("expected inet addr")
    };
    let globals = Arc::new(Globals {
      router_config: RouterConfigBuilder::default().build().unwrap(),
      socket_dir: h.socket_dir.clone(),
      cert_provider: Some(CertProvider::directory(cert_dir)),
      runtime_handle: tokio::runtime::Handle::current(),
    });
    let router = Arc::new(Router::new(globals));
    tokio::spawn(async move { router.serve(acceptor).await });
    addr
  }

  fn tls_client_config(h: &Harness, alpn: &[u8]) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
      .add(rustls::pki_types::CertificateDer::from(h.cert_der.clone()))
      .unwrap();
    let mut config = rustls::ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    Arc::new(config)
  }

  #[tokio::test]
  async fn terminates_tls_and_splices_to_cleartext_backend() {
    let h = harness("test.example");
    let service_dir = h._socket_root.path().join("test.example/echo");
    std::fs::create_dir_all(&service_dir).unwrap();
    let listener = std::os::unix::net::UnixListener::bind(service_dir.join("cleartext")).unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::UnixListener::from_std(listener).unwrap();

    tokio::spawn(async move {
      loop {
        let Ok((mut conn, _)) = listener.accept().await else { return };
        tokio::spawn(async move {
          let mut buf = [0u8; 3];
          conn.read_exact(&mut buf).await.unwrap();
          conn.write_all(&buf).await.unwrap();
        });
      }
    });

    let addr = start_router(&h, h._cert_root.path()).await;

    let connector = tokio_rustls::TlsConnector::from(tls_client_config(&h, b"echo"));
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("test.example").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    tls.write_all(b"ABC").await.unwrap();
    let mut echoed = [0u8; 3];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ABC");
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"echo"[..]));
  }

  #[tokio::test]
  async fn writes_proxy_header_to_proxy_backends() {
    let h = harness("test.example");
    let service_dir = h._socket_root.path().join("test.example/echo");
    std::fs::create_dir_all(&service_dir).unwrap();
    let listener = std::os::unix::net::UnixListener::bind(service_dir.join("cleartext+proxy")).unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::UnixListener::from_std(listener).unwrap();

    let header_check = tokio::spawn(async move {
      let (mut conn, _) = listener.accept().await.unwrap();
      let header = read_header(&mut conn, ProxyAddr::Unspecified, ProxyAddr::Unspecified)
        .await
        .unwrap();
      let mut buf = [0u8; 3];
      conn.read_exact(&mut buf).await.unwrap();
      conn.write_all(&buf).await.unwrap();
      header
    });

    let addr = start_router(&h, h._cert_root.path()).await;

    let connector = tokio_rustls::TlsConnector::from(tls_client_config(&h, b"echo"));
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let client_addr = tcp.local_addr().unwrap();
    let name = rustls::pki_types::ServerName::try_from("test.example").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    tls.write_all(b"XYZ").await.unwrap();
    let mut echoed = [0u8; 3];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"XYZ");

    let header = header_check.await.unwrap();
    assert_eq!(header.remote, ProxyAddr::Tcp(client_addr));
    assert_eq!(header.local, ProxyAddr::Tcp(addr));
  }

  #[tokio::test]
  async fn passes_tls_through_to_tls_backends() {
    let h = harness("test.example");
    let service_dir = h._socket_root.path().join("test.example/echo");
    std::fs::create_dir_all(&service_dir).unwrap();
    let listener = std::os::unix::net::UnixListener::bind(service_dir.join("tls")).unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::UnixListener::from_std(listener).unwrap();

    // the passthrough backend terminates TLS itself
    let cert_path = h._cert_root.path().join("test.example.pem");
    let backend = tokio::spawn(async move {
      let bundle = tlsd_certs::Bundle::from_pem_file(&cert_path).unwrap();
      let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(tlsd_certs::SingleCertResolver::new(
          bundle.certified_key().unwrap(),
        )));
      config.alpn_protocols = vec![b"echo".to_vec()];
      let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
      let (conn, _) = listener.accept().await.unwrap();
      let mut tls = acceptor.accept(conn).await.unwrap();
      let mut buf = [0u8; 3];
      tls.read_exact(&mut buf).await.unwrap();
      tls.write_all(&buf).await.unwrap();
      tls.shutdown().await.unwrap();
    });

    let addr = start_router(&h, h._cert_root.path()).await;

    let connector = tokio_rustls::TlsConnector::from(tls_client_config(&h, b"echo"));
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("test.example").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();

    tls.write_all(b"P-T").await.unwrap();
    let mut echoed = [0u8; 3];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"P-T");
    backend.await.unwrap();
  }

  #[tokio::test]
  async fn drops_connections_without_a_backend() {
    let h = harness("test.example");
    let addr = start_router(&h, h._cert_root.path()).await;

    let connector = tokio_rustls::TlsConnector::from(tls_client_config(&h, b"echo"));
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("unserved.example").unwrap();
    // the router drops the connection instead of completing the handshake
    assert!(connector.connect(name, tcp).await.is_err());
  }
}
