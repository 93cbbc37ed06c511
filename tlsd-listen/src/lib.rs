mod acceptor;
mod builtin;
mod error;
mod multi;
mod proxy;
mod registry;
mod tcp;
mod tls;
mod unix;

#[allow(unused_imports)]
mod log {
  pub(super) use tracing::{debug, error, info, warn};
}

pub use crate::{
  acceptor::{
    closed_error, is_closed, is_temporary, temporary_error, Acceptor, BoxedStream, ConnAddr, Connection, ListenerAddr,
    Stream,
  },
  error::{ListenError, ListenResult},
  multi::MultiAcceptor,
  proxy::{
    acceptor::ProxyAcceptor,
    header::{read_header, Header, HeaderError, ProxyAddr},
  },
  registry::{close_all, open, open_all, open_json, register_acceptor_type, BuildAcceptor, Params},
  tcp::TcpAcceptor,
  tls::TlsTerminator,
  unix::UnixAcceptor,
};
