use crate::constants::{DEFAULT_CERT_DIRECTORY, DEFAULT_SOCKET_DIRECTORY};
use clap::{Arg, ArgAction};

/// Parsed options
pub struct Opts {
  pub socket_directory: String,
  pub default_hostname: Option<String>,
  pub default_protocol: Option<String>,
  pub cert_directory: String,
  pub autocert: bool,
  pub listeners: Vec<String>,
}

/// Parse arg values passed from cli
pub fn parse_opts() -> Result<Opts, anyhow::Error> {
  let _ = include_str!("../Cargo.toml");
  let options = clap::command!()
    .arg(
      Arg::new("sockets")
        .long("sockets")
        .value_name("PATH")
        .default_value(DEFAULT_SOCKET_DIRECTORY)
        .help("Directory for backend sockets"),
    )
    .arg(
      Arg::new("default_hostname")
        .long("default-hostname")
        .value_name("NAME")
        .help("Default hostname if client does not provide SNI"),
    )
    .arg(
      Arg::new("default_protocol")
        .long("default-protocol")
        .value_name("ALPN")
        .help("Default protocol if client does not provide ALPN"),
    )
    .arg(
      Arg::new("certs")
        .long("certs")
        .value_name("PATH")
        .default_value(DEFAULT_CERT_DIRECTORY)
        .help("Directory containing certificate bundles with the name SERVERNAME.pem"),
    )
    .arg(
      Arg::new("autocert")
        .long("autocert")
        .action(ArgAction::SetTrue)
        .help("Obtain certificates automatically"),
    )
    .arg(
      Arg::new("listener")
        .value_name("LISTENER")
        .num_args(1..)
        .required(true)
        .help("Listener specs like 'tcp:443', ':443', 'unix:/run/tlsd.sock' or 'proxy:tcp:443'"),
    );
  let matches = options.get_matches();

  ///////////////////////////////////
  let socket_directory = matches.get_one::<String>("sockets").unwrap().to_owned();
  let default_hostname = matches.get_one::<String>("default_hostname").cloned();
  let default_protocol = matches.get_one::<String>("default_protocol").cloned();
  let cert_directory = matches.get_one::<String>("certs").unwrap().to_owned();
  let autocert = matches.get_flag("autocert");
  let listeners = matches
    .get_many::<String>("listener")
    .unwrap_or_default()
    .cloned()
    .collect::<Vec<_>>();

  Ok(Opts {
    socket_directory,
    default_hostname,
    default_protocol,
    cert_directory,
    autocert,
    listeners,
  })
}
