/// Deadline for the client to get its ClientHello on the wire.
pub const CLIENT_HELLO_TIMEOUT_SEC: u64 = 5;
/// Deadline for TLS handshakes the router performs itself (termination and
/// ACME challenge handshakes). Cleared on success; the splice is unbounded.
pub const TLS_HANDSHAKE_TIMEOUT_SEC: u64 = 5;
