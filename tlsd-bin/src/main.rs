#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod constants;
mod log;

use crate::{
  config::{parse_opts, Opts},
  log::*,
};
use tlsd_certs::CertProvider;
use tlsd_lib::{entrypoint, RouterConfigBuilder, SocketDirectory};

fn main() {
  init_logger();

  // Install aws_lc_rs as the process-wide crypto provider for rustls
  let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("tlsd");
  let runtime = runtime_builder.build().unwrap();

  runtime.block_on(async {
    let opts = match parse_opts() {
      Ok(opts) => opts,
      Err(e) => {
        error!("Invalid options: {e}");
        std::process::exit(1);
      }
    };

    let socket_dir = SocketDirectory::new(&opts.socket_directory);
    let (cert_provider, handle_acme) = match build_cert_provider(&opts, &socket_dir) {
      Ok(v) => v,
      Err(e) => {
        error!("{e}");
        std::process::exit(1);
      }
    };

    let acceptors = match tlsd_listen::open_all(&opts.listeners).await {
      Ok(acceptors) => acceptors,
      Err(e) => {
        error!("Failed to open listeners: {e}");
        std::process::exit(1);
      }
    };

    let router_config = RouterConfigBuilder::default()
      .default_hostname(opts.default_hostname.clone())
      .default_protocol(opts.default_protocol.clone())
      .handle_acme(handle_acme)
      .build()
      .unwrap();

    info!("watching socket directory {}", opts.socket_directory);
    if let Err(e) = entrypoint(router_config, socket_dir, cert_provider, acceptors, &runtime.handle().clone()).await {
      error!("tlsd exited with error: {e}");
      std::process::exit(1);
    }
  });
  warn!("tlsd exited!");
}

fn build_cert_provider(opts: &Opts, socket_dir: &SocketDirectory) -> anyhow::Result<(Option<CertProvider>, bool)> {
  if opts.autocert {
    #[cfg(feature = "acme")]
    {
      let hostnames = socket_dir.hostnames();
      anyhow::ensure!(
        !hostnames.is_empty(),
        "--autocert requires at least one hostname directory under {}",
        opts.socket_directory
      );
      info!("obtaining certificates automatically for {}", hostnames.join(", "));
      return Ok((Some(CertProvider::autocert(hostnames)?), true));
    }
    #[cfg(not(feature = "acme"))]
    anyhow::bail!("this build of tlsd does not include autocert support");
  }
  if opts.cert_directory.is_empty() {
    return Ok((None, false));
  }
  Ok((Some(CertProvider::directory(&opts.cert_directory)), false))
}
