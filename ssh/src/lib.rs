//! embernet-ssh: an SSH 2.0 server transport for the embernet stack.
//!
//! One cipher suite, one session channel, no rekeying: the transport
//! speaks curve25519-sha256 key exchange with an ssh-ed25519 host key and
//! aes128-gcm@openssh.com packet protection, authenticates by password,
//! and hands session data (shell or subsystem) to the host application.
//!
//! The server sits on top of the TCP layer as a [`TcpServer`]: wrap it in
//! an [`transport::SshEndpoint`] together with the host's application and
//! password authenticator, and pass that to `NetStack::poll`.
//!
//! Any protocol violation — unsupported algorithm, failed tag
//! verification, impossible state transition — closes the TCP connection
//! without ceremony and zeroises the per-connection secrets.
//!
//! [`TcpServer`]: embernet_net::tcp::TcpServer

#![cfg_attr(not(test), no_std)]

pub mod kex;
pub mod names;
pub mod packet;
pub mod session;
pub mod shell;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod kex_tests;
#[cfg(test)]
mod packet_tests;
#[cfg(test)]
mod wire_tests;

pub use session::{EngineEntropy, PasswordAuthenticator, SessionWriter, SshApplication};
pub use transport::{ConnectionId, SshEndpoint, SshTransportServer};

/// Maximum simultaneous SSH connections.
pub const SSH_TABLE_SIZE: usize = 2;

/// Per-connection receive reassembly buffer.
pub const SSH_RX_BUFFER_SIZE: usize = 2048;

/// Version banner sent to every client.
pub const SERVER_BANNER: &str = "SSH-2.0-embernet_0.1\r\n";
