use thiserror::Error;

pub type CertResult<T> = std::result::Result<T, CertError>;

/// Describes things that can go wrong while loading or resolving certificates.
#[derive(Debug, Error)]
pub enum CertError {
  #[error("failed to read certificate bundle: {0}")]
  Io(#[from] std::io::Error),
  #[error("invalid PEM: {0}")]
  Pem(#[from] pem::PemError),

  // bundle format errors
  #[error("contains more than one private key")]
  MultiplePrivateKeys,
  #[error("contains more than one OCSP response")]
  MultipleOcspResponses,
  #[error("contains unrecognized PEM block `{0}'")]
  UnrecognizedBlock(String),
  #[error("doesn't contain any private key")]
  NoPrivateKey,
  #[error("doesn't contain any certificates")]
  NoCertificates,
  #[error("contains invalid leaf certificate: {0}")]
  InvalidLeaf(String),
  #[error("contains invalid private key")]
  InvalidPrivateKey,
  #[error("unrecognized usage `{0}'")]
  UnrecognizedUsage(String),
  #[error("this key is restricted to decryption and cannot sign")]
  KeyNotForSigning,

  // resolution errors
  #[error("client does not support SNI")]
  NoServerName,
  #[error("server name is invalid")]
  InvalidServerName,
  #[error("no certificate found for {0:?}")]
  NoCertificate(String),

  #[cfg(feature = "acme")]
  #[error("no domains specified for automatic certificates")]
  NoAcmeDomains,
}
