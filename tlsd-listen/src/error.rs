use thiserror::Error;

pub type ListenResult<T> = std::result::Result<T, ListenError>;

/// Describes things that can go wrong while building an acceptor from a spec.
#[derive(Debug, Error)]
pub enum ListenError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  // spec resolution errors
  #[error("unknown listener type: {0}")]
  UnknownType(String),
  #[error("listener object does not contain a string type field")]
  MissingType,
  #[error("{spec}: {source}")]
  Spec {
    spec: String,
    #[source]
    source: Box<ListenError>,
  },

  // tcp builder errors
  #[error("TCP listener has invalid argument: {0}")]
  InvalidTcpArg(String),
  #[error("TCP listener has invalid IP address")]
  InvalidIpAddress,
  #[error("TCP listener has invalid port: {0:?}")]
  InvalidPort(String),

  // fd builder errors
  #[error("file descriptor not specified for FD listener")]
  MissingFd,
  #[error("'{0}' is a malformed file descriptor")]
  MalformedFd(String),
  #[error("inherited file descriptor {0} has an unsupported address family")]
  UnsupportedFdFamily(i32),
  #[error("name not specified for fdname listener")]
  MissingFdName,
  #[error("cannot create fdname listener because {0}")]
  FdNameEnv(String),
  #[error("fdname: {0:?} not found in $LISTEN_FDNAMES")]
  FdNameNotFound(String),

  // unix builder errors
  #[error("path not specified for UNIX listener")]
  MissingPath,

  // proxy builder errors
  #[error("inner socket not specified for proxy listener")]
  MissingInner,

  // tls builder errors
  #[error("TLS listener spec invalid; must be CERT_SPEC:SOCKET_SPEC")]
  InvalidTlsSpec,
  #[error("certificate not specified for TLS listener")]
  MissingCertificate,
  #[error("certificate error: {0}")]
  Cert(#[from] tlsd_certs::CertError),
  #[cfg(not(feature = "acme"))]
  #[error("automatic certificates require the acme feature")]
  AcmeUnavailable,
}
