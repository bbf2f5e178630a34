//! The single supported cipher suite and the protocol's magic strings.

/// RFC 8731 key exchange.
pub const KEX_ALGORITHM: &[u8] = b"curve25519-sha256";
pub const HOST_KEY_ALGORITHM: &[u8] = b"ssh-ed25519";
pub const ENCRYPTION_ALGORITHM: &[u8] = b"aes128-gcm@openssh.com";
/// Implicit in GCM; the client's MAC proposal is ignored entirely.
pub const MAC_ALGORITHM: &[u8] = b"none";
pub const COMPRESSION_ALGORITHM: &[u8] = b"none";

pub const SERVICE_USERAUTH: &[u8] = b"ssh-userauth";
pub const SERVICE_CONNECTION: &[u8] = b"ssh-connection";

pub const AUTH_METHOD_NONE: &[u8] = b"none";
pub const AUTH_METHOD_PASSWORD: &[u8] = b"password";
/// Advertised in USERAUTH_FAILURE replies.
pub const AUTH_METHODS_AVAILABLE: &[u8] = b"password";

pub const CHANNEL_TYPE_SESSION: &[u8] = b"session";
pub const REQUEST_SHELL: &[u8] = b"shell";
pub const REQUEST_EXEC: &[u8] = b"exec";
pub const REQUEST_SUBSYSTEM: &[u8] = b"subsystem";
pub const REQUEST_PTY: &[u8] = b"pty-req";
pub const REQUEST_ENV: &[u8] = b"env";

/// `true` if the comma-separated name-list contains exactly `name`.
pub fn name_list_contains(list: &[u8], name: &[u8]) -> bool {
    list.split(|&b| b == b',').any(|entry| entry == name)
}
