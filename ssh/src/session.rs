//! Seams between the transport and the host application.
//!
//! The transport owns the wire; the host owns what a session *means*.
//! [`SshApplication`] receives shell/subsystem requests and session data,
//! and answers through the [`SessionWriter`] it is handed, which frames,
//! encrypts, and transmits CHANNEL_DATA on the caller's connection.
//! [`PasswordAuthenticator`] is the host's credential store.

use embernet_crypto::CryptoEngine;
use embernet_net::frame::EthernetDriver;
use embernet_net::tcp::{SocketId, TcpApi};
use embernet_net::types::{EntropySource, NetError};

use crate::transport::{ConnectionId, send_channel_data};

/// Adapts a crypto engine's RNG to the stack's entropy seam, so TCP
/// initial sequence numbers and DHCP transaction ids draw from the real
/// RNG rather than anything guessable.
pub struct EngineEntropy<C: CryptoEngine>(pub C);

impl<C: CryptoEngine> EntropySource for EngineEntropy<C> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}

/// Host-side password validation.
///
/// The core does not count attempts or throttle; rate limiting is the
/// host's business.
pub trait PasswordAuthenticator {
    fn check_password(&mut self, username: &[u8], password: &[u8]) -> bool;
}

/// Host application layered on the session channel: a shell, an SFTP
/// server, or both.
pub trait SshApplication<D: EthernetDriver, C: CryptoEngine> {
    /// CHANNEL_REQUEST "shell" (no command) or "exec" (with command).
    /// Return `false` to refuse the request.
    fn on_shell(
        &mut self,
        session: &mut SessionWriter<'_, '_, '_, D, C>,
        conn: ConnectionId,
        command: Option<&[u8]>,
    ) -> bool;

    /// CHANNEL_REQUEST "subsystem".  Return `false` for subsystems the
    /// host does not carry.
    fn on_subsystem(
        &mut self,
        session: &mut SessionWriter<'_, '_, '_, D, C>,
        conn: ConnectionId,
        name: &[u8],
    ) -> bool;

    /// CHANNEL_DATA payload for the attached session.  Returning `false`
    /// is fatal to the connection (the subsystem saw a framing violation
    /// it cannot recover from).
    fn on_session_data(
        &mut self,
        session: &mut SessionWriter<'_, '_, '_, D, C>,
        conn: ConnectionId,
        data: &[u8],
    ) -> bool;

    /// The session went away: channel close, TCP teardown, or a protocol
    /// error.  Always called at most once per attached session.
    fn on_session_closed(&mut self, conn: ConnectionId);
}

/// Outbound data path for one connection's session channel.
pub struct SessionWriter<'a, 'b, 'c, D: EthernetDriver, C: CryptoEngine> {
    pub(crate) crypto: &'a mut C,
    pub(crate) tcp: &'a mut TcpApi<'b, 'c, D>,
    pub(crate) socket: SocketId,
    pub(crate) client_channel: u32,
}

impl<'a, 'b, 'c, D: EthernetDriver, C: CryptoEngine> SessionWriter<'a, 'b, 'c, D, C> {
    /// Sends session data to the client, split into as many CHANNEL_DATA
    /// packets as needed.
    pub fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
        send_channel_data(
            self.crypto,
            self.tcp,
            self.socket,
            self.client_channel,
            data,
        )
    }
}

#[cfg(test)]
mod session_tests {
    use super::EngineEntropy;
    use embernet_crypto::soft::SoftCryptoEngine;
    use embernet_crypto::testutil::TestRng;
    use embernet_net::types::EntropySource;

    #[test]
    fn engine_entropy_draws_fresh_values() {
        let mut entropy = EngineEntropy(SoftCryptoEngine::new(TestRng::new(5)));
        let a = entropy.next_u32();
        let b = entropy.next_u32();
        assert_ne!(a, b, "successive draws differ");
    }
}
