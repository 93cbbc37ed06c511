use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const PROTOCOL_SIGNATURE: [u8; 12] = [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

const PROTOCOL_VERSION: u8 = 2;

const COMMAND_LOCAL: u8 = 0x00;
const COMMAND_PROXY: u8 = 0x01;

const FAMILY_UNSPECIFIED: u8 = 0x00;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_UDP4: u8 = 0x12;
const FAMILY_TCP6: u8 = 0x21;
const FAMILY_UDP6: u8 = 0x22;

/// One endpoint as carried in a PROXY v2 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyAddr {
  Tcp(SocketAddr),
  Udp(SocketAddr),
  Unspecified,
}

impl ProxyAddr {
  pub fn socket_addr(&self) -> Option<SocketAddr> {
    match self {
      ProxyAddr::Tcp(addr) | ProxyAddr::Udp(addr) => Some(*addr),
      ProxyAddr::Unspecified => None,
    }
  }
}

/// A parsed PROXY protocol header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
  pub remote: ProxyAddr,
  pub local: ProxyAddr,
}

#[derive(Debug, Error)]
pub enum HeaderError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("not a proxied connection")]
  BadSignature,
  #[error("unsupported proxy protocol version {0}")]
  BadVersion(u8),
  #[error("unsupported proxy command {0:#x}")]
  BadCommand(u8),
  #[error("unsupported address family {0:#x}")]
  BadFamily(u8),
  #[error("header too short for {0}")]
  Truncated(&'static str),
}

/// Read a PROXY v2 header from `stream`. A LOCAL command carries no addresses;
/// the returned header then holds the fallback addresses, i.e. the socket's
/// real peers. Payload bytes beyond the fixed address tuple (TLVs) are read
/// and discarded.
pub async fn read_header<S>(stream: &mut S, fallback_local: ProxyAddr, fallback_remote: ProxyAddr) -> Result<Header, HeaderError>
where
  S: AsyncRead + Unpin,
{
  let mut preamble = [0u8; 16];
  stream.read_exact(&mut preamble).await?;

  let signature = &preamble[0..12];
  let version = preamble[12] >> 4;
  let command = preamble[12] & 0x0F;
  let family = preamble[13];
  let length = u16::from_be_bytes([preamble[14], preamble[15]]) as usize;

  if signature != &PROTOCOL_SIGNATURE[..] {
    return Err(HeaderError::BadSignature);
  }
  if version != PROTOCOL_VERSION {
    return Err(HeaderError::BadVersion(version));
  }

  let mut payload = vec![0u8; length];
  stream.read_exact(&mut payload).await?;

  match command {
    COMMAND_LOCAL => Ok(Header {
      remote: fallback_remote,
      local: fallback_local,
    }),
    COMMAND_PROXY => parse_proxy_payload(family, &payload),
    other => Err(HeaderError::BadCommand(other)),
  }
}

fn parse_proxy_payload(family: u8, payload: &[u8]) -> Result<Header, HeaderError> {
  match family {
    FAMILY_TCP4 | FAMILY_UDP4 => {
      if payload.len() < 12 {
        return Err(HeaderError::Truncated("IPv4"));
      }
      let remote_ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
      let local_ip = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
      let remote_port = u16::from_be_bytes([payload[8], payload[9]]);
      let local_port = u16::from_be_bytes([payload[10], payload[11]]);
      let remote = SocketAddr::new(IpAddr::V4(remote_ip), remote_port);
      let local = SocketAddr::new(IpAddr::V4(local_ip), local_port);
      Ok(wrap(family == FAMILY_UDP4, remote, local))
    }
    FAMILY_TCP6 | FAMILY_UDP6 => {
      if payload.len() < 36 {
        return Err(HeaderError::Truncated("IPv6"));
      }
      let remote_octets: [u8; 16] = payload[0..16].try_into().expect("slice length checked");
      let local_octets: [u8; 16] = payload[16..32].try_into().expect("slice length checked");
      let remote_port = u16::from_be_bytes([payload[32], payload[33]]);
      let local_port = u16::from_be_bytes([payload[34], payload[35]]);
      let remote = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(remote_octets)), remote_port);
      let local = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(local_octets)), local_port);
      Ok(wrap(family == FAMILY_UDP6, remote, local))
    }
    other => Err(HeaderError::BadFamily(other)),
  }
}

fn wrap(udp: bool, remote: SocketAddr, local: SocketAddr) -> Header {
  if udp {
    Header {
      remote: ProxyAddr::Udp(remote),
      local: ProxyAddr::Udp(local),
    }
  } else {
    Header {
      remote: ProxyAddr::Tcp(remote),
      local: ProxyAddr::Tcp(local),
    }
  }
}

impl Header {
  /// The wire representation of the header. An address pair that is neither
  /// TCP nor UDP formats as a 16-byte header with the unspecified family.
  pub fn format(&self) -> Vec<u8> {
    match (self.remote, self.local) {
      (ProxyAddr::Tcp(remote), ProxyAddr::Tcp(local)) => format_inet(false, remote, local),
      (ProxyAddr::Udp(remote), ProxyAddr::Udp(local)) => format_inet(true, remote, local),
      _ => format_unspecified(),
    }
  }
}

fn format_inet(udp: bool, remote: SocketAddr, local: SocketAddr) -> Vec<u8> {
  // The remote address picks the family; a v4-mapped v6 remote formats as v4.
  match effective_v4(remote.ip()) {
    Some(remote_ip) => {
      let family = if udp { FAMILY_UDP4 } else { FAMILY_TCP4 };
      let local_ip = effective_v4(local.ip()).unwrap_or(Ipv4Addr::UNSPECIFIED);
      let mut header = Vec::with_capacity(28);
      header.extend_from_slice(&PROTOCOL_SIGNATURE);
      header.push((PROTOCOL_VERSION << 4) | COMMAND_PROXY);
      header.push(family);
      header.extend_from_slice(&12u16.to_be_bytes());
      header.extend_from_slice(&remote_ip.octets());
      header.extend_from_slice(&local_ip.octets());
      header.extend_from_slice(&remote.port().to_be_bytes());
      header.extend_from_slice(&local.port().to_be_bytes());
      header
    }
    None => {
      let family = if udp { FAMILY_UDP6 } else { FAMILY_TCP6 };
      let mut header = Vec::with_capacity(52);
      header.extend_from_slice(&PROTOCOL_SIGNATURE);
      header.push((PROTOCOL_VERSION << 4) | COMMAND_PROXY);
      header.push(family);
      header.extend_from_slice(&36u16.to_be_bytes());
      header.extend_from_slice(&effective_v6(remote.ip()).octets());
      header.extend_from_slice(&effective_v6(local.ip()).octets());
      header.extend_from_slice(&remote.port().to_be_bytes());
      header.extend_from_slice(&local.port().to_be_bytes());
      header
    }
  }
}

fn format_unspecified() -> Vec<u8> {
  let mut header = vec![0u8; 16];
  header[0..12].copy_from_slice(&PROTOCOL_SIGNATURE);
  header[12] = (PROTOCOL_VERSION << 4) | COMMAND_PROXY;
  header[13] = FAMILY_UNSPECIFIED;
  header
}

fn effective_v4(ip: IpAddr) -> Option<Ipv4Addr> {
  match ip {
    IpAddr::V4(v4) => Some(v4),
    IpAddr::V6(v6) => v6.to_ipv4_mapped(),
  }
}

fn effective_v6(ip: IpAddr) -> Ipv6Addr {
  match ip {
    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
    IpAddr::V6(v6) => v6,
  }
}
