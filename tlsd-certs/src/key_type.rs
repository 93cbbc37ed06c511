use crate::resolve::HelloInfo;
use rustls::SignatureScheme;

/// Key types a client can verify, derived from its ClientHello.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct KeyTypes {
  pub(crate) rsa: bool,
  pub(crate) ecdsa: bool,
}

/// Classify the hello's signature schemes into RSA/ECDSA support; the scheme
/// list takes precedence, the cipher suites are only consulted when it is
/// absent (older clients).
pub(crate) fn supported_key_types(hello: &HelloInfo) -> KeyTypes {
  if !hello.signature_schemes.is_empty() {
    key_types_for_signature_schemes(&hello.signature_schemes)
  } else {
    key_types_for_cipher_suites(&hello.cipher_suites)
  }
}

fn key_types_for_signature_schemes(schemes: &[SignatureScheme]) -> KeyTypes {
  let mut types = KeyTypes::default();
  for scheme in schemes {
    match *scheme {
      SignatureScheme::ECDSA_SHA1_Legacy
      | SignatureScheme::ECDSA_NISTP256_SHA256
      | SignatureScheme::ECDSA_NISTP384_SHA384
      | SignatureScheme::ECDSA_NISTP521_SHA512 => types.ecdsa = true,
      SignatureScheme::RSA_PKCS1_SHA1
      | SignatureScheme::RSA_PKCS1_SHA256
      | SignatureScheme::RSA_PKCS1_SHA384
      | SignatureScheme::RSA_PKCS1_SHA512
      | SignatureScheme::RSA_PSS_SHA256
      | SignatureScheme::RSA_PSS_SHA384
      | SignatureScheme::RSA_PSS_SHA512 => types.rsa = true,
      _ => {}
    }
  }
  types
}

fn key_types_for_cipher_suites(suites: &[rustls::CipherSuite]) -> KeyTypes {
  let mut types = KeyTypes::default();
  for suite in suites {
    // matched on the IANA codepoint so the table covers suites rustls itself
    // no longer ships
    match u16::from(*suite) {
      0xc007 // TLS_ECDHE_ECDSA_WITH_RC4_128_SHA
      | 0xc009 // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
      | 0xc00a // TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
      | 0xc023 // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256
      | 0xc02b // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
      | 0xc02c // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
      | 0xcca9 // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
      => types.ecdsa = true,
      0x0005 // TLS_RSA_WITH_RC4_128_SHA
      | 0x000a // TLS_RSA_WITH_3DES_EDE_CBC_SHA
      | 0x002f // TLS_RSA_WITH_AES_128_CBC_SHA
      | 0x0035 // TLS_RSA_WITH_AES_256_CBC_SHA
      | 0x003c // TLS_RSA_WITH_AES_128_CBC_SHA256
      | 0x009c // TLS_RSA_WITH_AES_128_GCM_SHA256
      | 0x009d // TLS_RSA_WITH_AES_256_GCM_SHA384
      | 0xc011 // TLS_ECDHE_RSA_WITH_RC4_128_SHA
      | 0xc012 // TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA
      | 0xc013 // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
      | 0xc014 // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
      | 0xc027 // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256
      | 0xc02f // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
      | 0xc030 // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
      | 0xcca8 // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
      => types.rsa = true,
      _ => {}
    }
  }
  types
}
