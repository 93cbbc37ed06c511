use crate::error::*;
use rustls::{crypto::aws_lc_rs::sign::any_supported_type, sign::CertifiedKey};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::{
  path::Path,
  sync::{Arc, OnceLock},
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use x509_parser::prelude::*;

/* ------------------------------------------------ */
/// Capability a private key's PEM `Usage:` header grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUsage {
  Unrestricted,
  /// `Usage: sign` restricts the key to signing.
  Sign,
  /// `Usage: decrypt` restricts the key to decryption; no signer is reachable from the bundle.
  Decrypt,
}

/* ------------------------------------------------ */
/// A parsed certificate bundle: one private key, a certificate chain (leaf
/// first, root omitted), up to one stapled OCSP response, and any number of
/// signed certificate timestamps.
///
/// The file must consist of the following PEM blocks:
///   - Exactly one `PRIVATE KEY` (PKCS#8), `RSA PRIVATE KEY` (PKCS#1) or `EC PRIVATE KEY` (SEC1).
///   - At least one `CERTIFICATE`, leaf certificate first.
///   - Up to one `OCSP RESPONSE`.
///   - Any number of `SIGNED CERTIFICATE TIMESTAMP`.
pub struct Bundle {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  usage: KeyUsage,
  ocsp: Option<Vec<u8>>,
  scts: Vec<Vec<u8>>,
  not_after: SystemTime,
  certified: OnceLock<Arc<CertifiedKey>>,
}

impl Bundle {
  pub fn from_pem_file(path: &Path) -> CertResult<Self> {
    let data = std::fs::read(path)?;
    Self::from_pem_bytes(&data)
  }

  pub fn from_pem_bytes(data: &[u8]) -> CertResult<Self> {
    let mut key: Option<(PrivateKeyDer<'static>, KeyUsage)> = None;
    let mut chain = Vec::new();
    let mut ocsp: Option<Vec<u8>> = None;
    let mut scts = Vec::new();

    for block in ::pem::parse_many(data)? {
      match block.tag() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY" => {
          if key.is_some() {
            return Err(CertError::MultiplePrivateKeys);
          }
          key = Some(parse_private_key(&block)?);
        }
        "CERTIFICATE" => chain.push(CertificateDer::from(block.contents().to_vec())),
        "OCSP RESPONSE" => {
          if ocsp.is_some() {
            return Err(CertError::MultipleOcspResponses);
          }
          ocsp = Some(block.contents().to_vec());
        }
        "SIGNED CERTIFICATE TIMESTAMP" => scts.push(block.contents().to_vec()),
        other => return Err(CertError::UnrecognizedBlock(other.to_string())),
      }
    }

    let Some((key, usage)) = key else {
      return Err(CertError::NoPrivateKey);
    };
    if chain.is_empty() {
      return Err(CertError::NoCertificates);
    }
    let (_, leaf) = parse_x509_certificate(&chain[0]).map_err(|e| CertError::InvalidLeaf(e.to_string()))?;
    let not_after = asn1_time(leaf.validity().not_after);

    Ok(Self {
      chain,
      key,
      usage,
      ocsp,
      scts,
      not_after,
      certified: OnceLock::new(),
    })
  }

  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  pub fn usage(&self) -> KeyUsage {
    self.usage
  }

  pub fn ocsp(&self) -> Option<&[u8]> {
    self.ocsp.as_deref()
  }

  pub fn scts(&self) -> &[Vec<u8>] {
    &self.scts
  }

  /// Expiry of the leaf certificate.
  pub fn not_after(&self) -> SystemTime {
    self.not_after
  }

  /// The bundle as a rustls `CertifiedKey`, with the OCSP response attached.
  /// Fails for a decryption-only key: signing must not be reachable through it.
  pub fn certified_key(&self) -> CertResult<Arc<CertifiedKey>> {
    if self.usage == KeyUsage::Decrypt {
      return Err(CertError::KeyNotForSigning);
    }
    if let Some(certified) = self.certified.get() {
      return Ok(certified.clone());
    }
    let signing_key = any_supported_type(&self.key).map_err(|_| CertError::InvalidPrivateKey)?;
    let mut certified = CertifiedKey::new(self.chain.clone(), signing_key);
    certified.ocsp = self.ocsp.clone();
    let certified = Arc::new(certified);
    let _ = self.certified.set(certified.clone());
    Ok(certified)
  }
}

fn parse_private_key(block: &::pem::Pem) -> CertResult<(PrivateKeyDer<'static>, KeyUsage)> {
  let der = block.contents().to_vec();
  let key = match block.tag() {
    "PRIVATE KEY" => PrivateKeyDer::Pkcs8(der.into()),
    "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(der.into()),
    "EC PRIVATE KEY" => PrivateKeyDer::Sec1(der.into()),
    other => return Err(CertError::UnrecognizedBlock(other.to_string())),
  };
  // validate up front so a cached bundle never carries an unusable key
  any_supported_type(&key).map_err(|_| CertError::InvalidPrivateKey)?;

  let usage = match block.headers().get("Usage") {
    None => KeyUsage::Unrestricted,
    Some("sign") => KeyUsage::Sign,
    Some("decrypt") => KeyUsage::Decrypt,
    Some(other) => return Err(CertError::UnrecognizedUsage(other.to_string())),
  };
  Ok((key, usage))
}

fn asn1_time(time: ASN1Time) -> SystemTime {
  let ts = time.timestamp();
  if ts >= 0 {
    UNIX_EPOCH + Duration::from_secs(ts as u64)
  } else {
    UNIX_EPOCH
  }
}

/* ------------------------------------------------ */
