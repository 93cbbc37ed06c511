use crate::{
  acceptor::Acceptor,
  error::{ListenError, ListenResult},
  proxy::acceptor::ProxyAcceptor,
  registry::{open, open_json, BuildAcceptor, Params},
  tcp::TcpAcceptor,
  unix::UnixAcceptor,
};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
  net::{IpAddr, Ipv6Addr, SocketAddr},
  os::fd::{FromRawFd, IntoRawFd, RawFd},
  path::Path,
};

const TCP_LISTEN_BACKLOG: i32 = 1024;

/// `tcp`: argument `HOST:PORT`, `:PORT`, or bare `PORT`; keyed options
/// `address` and `port`. A host must be an IP literal; an IPv4 literal binds a
/// v4-only socket and any other literal (including `::`) binds a v6-only one,
/// so `0.0.0.0` and `::` bind disjointly.
pub(crate) struct TcpBuilder;

#[async_trait]
impl BuildAcceptor for TcpBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let (ip, port) = tcp_target(params, arg)?;
    let listener = bind_tcp(ip, port)?;
    Ok(Box::new(TcpAcceptor::from_std(listener)?))
  }
}

fn tcp_target(params: Option<&Params>, arg: &str) -> ListenResult<(Option<IpAddr>, u16)> {
  let mut ip_string = String::new();
  let mut port_string = String::new();

  if !arg.is_empty() {
    if arg.contains(':') {
      let (host, port) = split_host_port(arg).ok_or_else(|| ListenError::InvalidTcpArg(arg.to_string()))?;
      ip_string = host;
      port_string = port;
    } else {
      port_string = arg.to_string();
    }
  } else if let Some(params) = params {
    if let Some(address) = params.get("address").and_then(|v| v.as_str()) {
      ip_string = address.to_string();
    }
    match params.get("port") {
      Some(serde_json::Value::Number(n)) => port_string = n.to_string(),
      Some(serde_json::Value::String(s)) => port_string = s.clone(),
      _ => {}
    }
  }

  let ip = if ip_string.is_empty() {
    None
  } else {
    Some(ip_string.parse::<IpAddr>().map_err(|_| ListenError::InvalidIpAddress)?)
  };
  let port = port_string.parse::<u16>().map_err(|_| ListenError::InvalidPort(port_string.clone()))?;
  Ok((ip, port))
}

fn split_host_port(arg: &str) -> Option<(String, String)> {
  let (host, port) = arg.rsplit_once(':')?;
  let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
    Some(bracketed) => bracketed.to_string(),
    // an unbracketed host must not itself contain a colon
    None if host.contains(':') => return None,
    None => host.to_string(),
  };
  Some((host, port.to_string()))
}

fn bind_tcp(ip: Option<IpAddr>, port: u16) -> std::io::Result<std::net::TcpListener> {
  let (domain, addr, v6_only) = match ip {
    Some(IpAddr::V4(v4)) => (Domain::IPV4, SocketAddr::new(IpAddr::V4(v4), port), false),
    Some(IpAddr::V6(v6)) => (Domain::IPV6, SocketAddr::new(IpAddr::V6(v6), port), true),
    None => (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), false),
  };
  let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
  if domain == Domain::IPV6 {
    socket.set_only_v6(v6_only)?;
  }
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(TCP_LISTEN_BACKLOG)?;
  Ok(socket.into())
}

/// `unix`: argument is a filesystem path (keyed option `path`); binds a
/// watched UNIX socket per [`UnixAcceptor::bind_watched`].
pub(crate) struct UnixBuilder;

#[async_trait]
impl BuildAcceptor for UnixBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let path = if !arg.is_empty() {
      arg.to_string()
    } else if let Some(path) = params.and_then(|p| p.get("path")).and_then(|v| v.as_str()) {
      path.to_string()
    } else {
      return Err(ListenError::MissingPath);
    };
    Ok(Box::new(UnixAcceptor::bind_watched(Path::new(&path), 0o666)?))
  }
}

/// `fd`: argument is a base-10 number of an inherited file descriptor.
pub(crate) struct FdBuilder;

#[async_trait]
impl BuildAcceptor for FdBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let fd_string = if !arg.is_empty() {
      arg.to_string()
    } else if let Some(params) = params {
      match params.get("fd") {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => return Err(ListenError::MissingFd),
      }
    } else {
      return Err(ListenError::MissingFd);
    };
    let fd = fd_string
      .parse::<u64>()
      .map_err(|_| ListenError::MalformedFd(fd_string.clone()))?;
    adopt_fd(fd as RawFd)
  }
}

/// Wrap an inherited, already-listening socket. The descriptor is fully
/// transferred into the returned acceptor, whatever the outcome.
fn adopt_fd(fd: RawFd) -> ListenResult<Box<dyn Acceptor>> {
  let socket = unsafe { Socket::from_raw_fd(fd) };
  socket.set_nonblocking(true)?;
  let addr = socket.local_addr()?;
  if addr.is_ipv4() || addr.is_ipv6() {
    let listener: std::net::TcpListener = socket.into();
    Ok(Box::new(TcpAcceptor::from_std(listener)?))
  } else if addr.domain() == Domain::UNIX {
    let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(socket.into_raw_fd()) };
    Ok(Box::new(UnixAcceptor::adopt_std(listener)?))
  } else {
    Err(ListenError::UnsupportedFdFamily(fd))
  }
}

/// `fdname`: argument is a logical name resolved through the systemd socket
/// activation convention: `$LISTEN_PID` must equal our PID, and position *i*
/// in the colon-separated `$LISTEN_FDNAMES` maps to fd 3+*i*.
pub(crate) struct FdNameBuilder;

#[async_trait]
impl BuildAcceptor for FdNameBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let name = if !arg.is_empty() {
      arg.to_string()
    } else if let Some(name) = params.and_then(|p| p.get("name")).and_then(|v| v.as_str()) {
      name.to_string()
    } else {
      return Err(ListenError::MissingFdName);
    };

    let listen_pid =
      std::env::var("LISTEN_PID").map_err(|_| ListenError::FdNameEnv("$LISTEN_PID is not set".to_string()))?;
    let listen_pid = listen_pid
      .parse::<u32>()
      .map_err(|_| ListenError::FdNameEnv("$LISTEN_PID does not contain an integer".to_string()))?;
    let our_pid = std::process::id();
    if listen_pid != our_pid {
      return Err(ListenError::FdNameEnv(format!(
        "$LISTEN_PID ({listen_pid}) does not match our PID ({our_pid})"
      )));
    }

    let names = std::env::var("LISTEN_FDNAMES").unwrap_or_default();
    for (i, ith_name) in names.split(':').enumerate() {
      if ith_name == name {
        return adopt_fd(3 + i as RawFd);
      }
    }
    Err(ListenError::FdNameNotFound(name))
  }
}

/// `proxy`: argument is a nested spec (keyed option `listener`); wraps the
/// inner acceptor so the PROXY v2 greeting is consumed on every accept.
pub(crate) struct ProxyBuilder;

#[async_trait]
impl BuildAcceptor for ProxyBuilder {
  async fn build(&self, params: Option<&Params>, arg: &str) -> ListenResult<Box<dyn Acceptor>> {
    let inner = if !arg.is_empty() {
      open(arg).await?
    } else if let Some(spec) = params.and_then(|p| p.get("listener")).and_then(|v| v.as_object()) {
      open_json(spec).await?
    } else {
      return Err(ListenError::MissingInner);
    };
    Ok(Box::new(ProxyAcceptor::new(inner)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tcp_target_parses_string_forms() {
    assert_eq!(tcp_target(None, "127.0.0.1:8443").unwrap(), (Some("127.0.0.1".parse().unwrap()), 8443));
    assert_eq!(tcp_target(None, "[::1]:8443").unwrap(), (Some("::1".parse().unwrap()), 8443));
    assert_eq!(tcp_target(None, ":8443").unwrap(), (None, 8443));
    assert_eq!(tcp_target(None, "8443").unwrap(), (None, 8443));
  }

  #[test]
  fn tcp_target_rejects_hostnames_and_bad_ports() {
    assert!(matches!(tcp_target(None, "localhost:443"), Err(ListenError::InvalidIpAddress)));
    assert!(matches!(tcp_target(None, "127.0.0.1:http"), Err(ListenError::InvalidPort(_))));
    assert!(matches!(tcp_target(None, "::1:443"), Err(ListenError::InvalidTcpArg(_))));
    assert!(matches!(tcp_target(None, ""), Err(ListenError::InvalidPort(_))));
  }

  #[test]
  fn tcp_target_parses_keyed_forms() {
    let mut params = Params::new();
    params.insert("type".to_string(), serde_json::Value::String("tcp".to_string()));
    params.insert("address".to_string(), serde_json::Value::String("::".to_string()));
    params.insert("port".to_string(), serde_json::json!(8443));
    assert_eq!(tcp_target(Some(&params), "").unwrap(), (Some("::".parse().unwrap()), 8443));

    params.insert("port".to_string(), serde_json::Value::String("9000".to_string()));
    assert_eq!(tcp_target(Some(&params), "").unwrap(), (Some("::".parse().unwrap()), 9000));
  }

  #[tokio::test]
  async fn fdname_requires_matching_listen_pid() {
    // LISTEN_PID unset in the test environment
    std::env::remove_var("LISTEN_PID");
    let err = FdNameBuilder.build(None, "https").await.unwrap_err();
    assert!(matches!(err, ListenError::FdNameEnv(_)));
  }
}
