use crate::socketdir::SocketDirectory;
use derive_builder::Builder;
use tlsd_certs::CertProvider;

/// Global context shared among the per-connection tasks. No locks live here;
/// nothing in it is mutated after startup.
pub struct Globals {
  /// Configuration parameters for routing
  pub router_config: RouterConfig,
  /// Socket directory the backends are resolved from
  pub socket_dir: SocketDirectory,
  /// Certificate source for termination and ACME handshakes
  pub cert_provider: Option<CertProvider>,
  /// Async task runtime handle
  pub runtime_handle: tokio::runtime::Handle,
}

/// Configuration parameters for the router.
#[derive(Builder, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterConfig {
  /// Substituted when a client omits SNI
  #[builder(default)]
  pub default_hostname: Option<String>,
  /// Substituted when a client omits ALPN
  #[builder(default)]
  pub default_protocol: Option<String>,
  /// Answer ACME tls-alpn-01 challenge connections instead of routing them
  #[builder(default)]
  pub handle_acme: bool,
}
