pub const DEFAULT_SOCKET_DIRECTORY: &str = "/var/tls";
pub const DEFAULT_CERT_DIRECTORY: &str = "/var/lib/certs";
