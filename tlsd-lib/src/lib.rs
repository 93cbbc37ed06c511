mod constants;
mod error;
mod globals;
mod hello;
mod server;
mod socketdir;

#[allow(unused_imports)]
mod log {
  pub(super) use tracing::{debug, error, info, warn};
}

use crate::{log::*, server::Router};
use futures::future::select_all;
use std::sync::Arc;
use tlsd_listen::Acceptor;

pub use crate::{
  constants::{CLIENT_HELLO_TIMEOUT_SEC, TLS_HANDSHAKE_TIMEOUT_SEC},
  error::{TlsdError, TlsdResult},
  globals::{Globals, RouterConfig, RouterConfigBuilder, RouterConfigBuilderError},
  socketdir::{Backend, BackendKind, SocketDirectory, BACKEND_KINDS},
};

/// Entrypoint that spawns a router service per acceptor and waits. Returns
/// when any service fails with a non-temporary error.
pub async fn entrypoint(
  router_config: RouterConfig,
  socket_dir: SocketDirectory,
  cert_provider: Option<tlsd_certs::CertProvider>,
  acceptors: Vec<Box<dyn Acceptor>>,
  runtime_handle: &tokio::runtime::Handle,
) -> TlsdResult<()> {
  if acceptors.is_empty() {
    return Err(TlsdError::NoListeners);
  }

  let globals = Arc::new(Globals {
    router_config,
    socket_dir,
    cert_provider,
    runtime_handle: runtime_handle.clone(),
  });
  let router = Arc::new(Router::new(globals.clone()));

  let services = select_all(acceptors.into_iter().map(|acceptor| {
    let router = router.clone();
    globals.runtime_handle.spawn(async move { router.serve(acceptor).await })
  }));

  match services.await {
    (Ok(Err(err)), _, _) => {
      error!("router service exited: {err}");
      Err(err)
    }
    (Err(join_err), _, _) => {
      error!("router service panicked: {join_err}");
      Err(TlsdError::Io(std::io::Error::other(join_err.to_string())))
    }
    (Ok(Ok(())), _, _) => Ok(()),
  }
}
