use thiserror::Error;

pub type TlsdResult<T> = std::result::Result<T, TlsdError>;

/// Describes things that can go wrong in the router.
#[derive(Debug, Error)]
pub enum TlsdError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  // per-connection protocol errors
  #[error("timed out reading ClientHello")]
  ClientHelloTimeout,
  #[error("invalid ClientHello: {0}")]
  InvalidClientHello(String),
  #[error("no SNI provided and no default hostname configured")]
  NoServerName,
  #[error("no ALPN provided and no default protocol configured")]
  NoProtocol,
  #[error("TLS handshake failed: {0}")]
  Handshake(String),
  #[error("TLS handshake timed out")]
  HandshakeTimeout,

  // per-connection resource errors
  #[error("no backend serving {hostname:?} for protocols {protocols:?}")]
  NoBackend { hostname: String, protocols: Vec<String> },
  #[error("certificate source not configured")]
  NoCertificateSource,
  #[error("certificate error: {0}")]
  Cert(#[from] tlsd_certs::CertError),
  #[error("dialing backend for host {hostname:?}, service {service:?}, type {kind:?} failed: {source}")]
  BackendDial {
    hostname: String,
    service: String,
    kind: &'static str,
    #[source]
    source: std::io::Error,
  },
  #[error("error writing PROXY header to backend: {0}")]
  ProxyHeaderWrite(std::io::Error),

  // ACME gate
  #[error("ignoring ACME connection for unserved hostname {0:?}")]
  AcmeUnknownHostname(String),

  // startup errors
  #[error("no listeners configured")]
  NoListeners,
}
