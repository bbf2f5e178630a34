//! The SSH transport server: connection table and state machine.
//!
//! Per connection the machine walks
//!
//! ```text
//! BannerWait -> BannerSent -> KexInitSent -> KexEcdhSent
//!            -> Unauthenticated -> AuthBegin -> Authenticated
//! ```
//!
//! Cleartext framing carries the banner exchange, KEXINIT, the ECDH
//! exchange, and NEWKEYS; everything after NEWKEYS is AES-128-GCM in both
//! directions with the packet-length word as associated data.  A packet
//! whose tag fails to verify is fatal: the GCM invocation counter only
//! advances on accepted packets, so nothing after a rejected packet could
//! ever verify.
//!
//! Incoming TCP bytes are reassembled in a per-connection FIFO.  If a
//! segment does not fit, the TCP layer is told to withhold its ACK and
//! the peer retransmits once we have drained.

use log::debug;

use embernet_crypto::{CryptoEngine, GCM_TAG_SIZE, SHA256_DIGEST_SIZE};
use embernet_lib::CircularFifo;
use embernet_net::config::TCP_IPV4_PAYLOAD_MTU;
use embernet_net::frame::EthernetDriver;
use embernet_net::tcp::{SocketId, TcpApi, TcpServer};
use embernet_net::types::NetError;

use crate::kex;
use crate::names::{
    AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD, AUTH_METHODS_AVAILABLE, CHANNEL_TYPE_SESSION,
    REQUEST_ENV, REQUEST_EXEC, REQUEST_PTY, REQUEST_SHELL, REQUEST_SUBSYSTEM, SERVICE_CONNECTION,
    SERVICE_USERAUTH,
};
use crate::packet::{
    self, SSH_MSG_CHANNEL_CLOSE, SSH_MSG_CHANNEL_DATA, SSH_MSG_CHANNEL_EOF,
    SSH_MSG_CHANNEL_FAILURE, SSH_MSG_CHANNEL_OPEN, SSH_MSG_CHANNEL_OPEN_CONFIRMATION,
    SSH_MSG_CHANNEL_OPEN_FAILURE, SSH_MSG_CHANNEL_REQUEST, SSH_MSG_CHANNEL_SUCCESS,
    SSH_MSG_CHANNEL_WINDOW_ADJUST, SSH_MSG_DISCONNECT, SSH_MSG_IGNORE, SSH_MSG_KEX_ECDH_INIT,
    SSH_MSG_KEXINIT, SSH_MSG_NEWKEYS, SSH_MSG_SERVICE_ACCEPT, SSH_MSG_SERVICE_REQUEST,
    SSH_MSG_USERAUTH_FAILURE, SSH_MSG_USERAUTH_REQUEST, SSH_MSG_USERAUTH_SUCCESS,
    SSH_DISCONNECT_PROTOCOL_ERROR,
};
use crate::session::{PasswordAuthenticator, SessionWriter, SshApplication};
use crate::wire::{Reader, Writer};
use crate::{SERVER_BANNER, SSH_RX_BUFFER_SIZE, SSH_TABLE_SIZE};

pub type ConnectionId = usize;

/// Window we advertise on channel open.  Large enough that the transport
/// never needs to send WINDOW_ADJUST for realistic sessions.
const CHANNEL_WINDOW: u32 = 0x00ff_ffff;

/// Largest CHANNEL_DATA payload per packet we emit.
const SESSION_DATA_CHUNK: usize = 1024;

/// A client that cannot produce a newline in this many bytes is not
/// speaking SSH.
const BANNER_LIMIT: usize = 512;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    BannerWait,
    BannerSent,
    KexInitSent,
    KexEcdhSent,
    Unauthenticated,
    AuthBegin,
    Authenticated,
}

struct SshConnection<C: CryptoEngine> {
    valid: bool,
    socket: Option<SocketId>,
    state: ConnState,
    rx: CircularFifo<SSH_RX_BUFFER_SIZE>,
    crypto: C,
    session_id: [u8; SHA256_DIGEST_SIZE],
    /// Both directions switch to GCM after NEWKEYS completes.
    encrypted: bool,
    channel_open: bool,
    /// Client-side id of the session channel (ours is always 0).
    client_channel: u32,
    /// A shell or subsystem is attached and receives CHANNEL_DATA.
    session_active: bool,
}

impl<C: CryptoEngine> SshConnection<C> {
    fn reset(&mut self) {
        self.valid = false;
        self.socket = None;
        self.state = ConnState::BannerWait;
        self.rx.reset();
        self.crypto.clear();
        self.session_id = [0; SHA256_DIGEST_SIZE];
        self.encrypted = false;
        self.channel_open = false;
        self.client_channel = 0;
        self.session_active = false;
    }
}

enum PacketStatus {
    NotReady,
    Ready(usize),
    Fatal,
}

pub struct SshTransportServer<C: CryptoEngine> {
    conns: [SshConnection<C>; SSH_TABLE_SIZE],
}

impl<C: CryptoEngine> SshTransportServer<C> {
    /// Builds the server around one crypto engine per connection slot.
    /// The engines carry the host key; install it before serving.
    pub fn new(engines: [C; SSH_TABLE_SIZE]) -> Self {
        Self {
            conns: engines.map(|crypto| SshConnection {
                valid: false,
                socket: None,
                state: ConnState::BannerWait,
                rx: CircularFifo::new(),
                crypto,
                session_id: [0; SHA256_DIGEST_SIZE],
                encrypted: false,
                channel_open: false,
                client_channel: 0,
                session_active: false,
            }),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.conns.iter().filter(|c| c.valid).count()
    }

    /// Session identifier of a connection (all zero before key exchange).
    pub fn session_id(&self, conn: ConnectionId) -> Option<[u8; SHA256_DIGEST_SIZE]> {
        let c = self.conns.get(conn)?;
        c.valid.then_some(c.session_id)
    }

    fn find(&self, socket: SocketId) -> Option<usize> {
        self.conns
            .iter()
            .position(|c| c.valid && c.socket == Some(socket))
    }

    fn alloc(&mut self, socket: SocketId) -> Option<usize> {
        let idx = self.conns.iter().position(|c| !c.valid)?;
        let conn = &mut self.conns[idx];
        conn.reset();
        conn.valid = true;
        conn.socket = Some(socket);
        Some(idx)
    }

    // =========================================================================
    // TCP events
    // =========================================================================

    fn on_connection_accepted(&mut self, socket: SocketId) {
        match self.alloc(socket) {
            Some(idx) => debug!("ssh: connection {} accepted", idx),
            // Table full: the handshake will stall and the client gives
            // up; we never see data for an untracked socket.
            None => debug!("ssh: connection table full"),
        }
    }

    fn on_tcp_closed<A>(&mut self, app: &mut A, socket: SocketId, notify: impl FnOnce(&mut A, ConnectionId)) {
        if let Some(idx) = self.find(socket) {
            let had_session = self.conns[idx].session_active;
            self.conns[idx].reset();
            if had_session {
                notify(app, idx);
            }
        }
    }

    fn on_rx_data<D, A, P>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        auth: &mut P,
        socket: SocketId,
        data: &[u8],
    ) -> bool
    where
        D: EthernetDriver,
        A: SshApplication<D, C>,
        P: PasswordAuthenticator,
    {
        let Some(idx) = self.find(socket) else {
            // Not a tracked session; swallow the bytes.
            return true;
        };

        // Backpressure happens here, before any byte is ingested: an
        // unacknowledged segment is retransmitted by the peer intact.
        if self.conns[idx].rx.write_size() < data.len() {
            return false;
        }
        let pushed = self.conns[idx].rx.push(data);
        debug_assert!(pushed);

        if self.conns[idx].state == ConnState::BannerWait && !self.on_rx_banner(tcp, idx) {
            return true;
        }

        self.process_packets(tcp, app, auth, idx);
        true
    }

    // =========================================================================
    // Banner
    // =========================================================================

    /// Returns `true` once the banner is consumed and packet framing may
    /// begin.
    fn on_rx_banner<D: EthernetDriver>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        idx: usize,
    ) -> bool {
        enum Outcome {
            Waiting,
            Bad,
            Done(SocketId),
        }

        let outcome = {
            let conn = &mut self.conns[idx];
            let data = conn.rx.rewind();

            match data.iter().position(|&b| b == b'\n') {
                None if data.len() > BANNER_LIMIT => Outcome::Bad,
                None => Outcome::Waiting,
                Some(nl) => {
                    let banner_len = nl + 1;
                    if banner_len < 8 || &data[..7] != b"SSH-2.0" {
                        Outcome::Bad
                    } else {
                        // Line terminator (and optional CR) stay out of
                        // the transcript.
                        let hashed_len = if data[nl - 1] == b'\r' { nl - 1 } else { nl };

                        // V_C then V_S, each as a length-prefixed string
                        // that never actually travels with its length.
                        conn.crypto.sha256_init();
                        conn.crypto
                            .sha256_update(&(hashed_len as u32).to_be_bytes());
                        conn.crypto.sha256_update(&data[..hashed_len]);
                        let server_banner = &SERVER_BANNER.as_bytes()[..SERVER_BANNER.len() - 2];
                        kex::hash_string(&mut conn.crypto, server_banner);

                        conn.rx.pop(banner_len);
                        conn.state = ConnState::BannerSent;
                        Outcome::Done(conn.socket.expect("valid connection has a socket"))
                    }
                }
            }
        };

        match outcome {
            Outcome::Waiting => false,
            Outcome::Bad => {
                self.drop_connection_quiet(tcp, idx);
                false
            }
            Outcome::Done(socket) => {
                if send_raw(tcp, socket, SERVER_BANNER.as_bytes()).is_err() {
                    self.drop_connection_quiet(tcp, idx);
                    return false;
                }
                debug!("ssh: {} banner exchanged", idx);
                true
            }
        }
    }

    // =========================================================================
    // Packet pump
    // =========================================================================

    fn process_packets<D, A, P>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        auth: &mut P,
        idx: usize,
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
        P: PasswordAuthenticator,
    {
        let mut payload = [0u8; SSH_RX_BUFFER_SIZE];
        while self.conns[idx].valid {
            let len = match self.next_packet(idx, &mut payload) {
                PacketStatus::NotReady => break,
                PacketStatus::Fatal => {
                    self.drop_connection(tcp, app, idx);
                    break;
                }
                PacketStatus::Ready(len) => len,
            };
            self.handle_packet(tcp, app, auth, idx, &payload[..len]);
        }
    }

    /// Extracts (decrypting in place if keys are active) the next
    /// complete packet's payload into `out` and pops it from the FIFO.
    fn next_packet(&mut self, idx: usize, out: &mut [u8]) -> PacketStatus {
        let conn = &mut self.conns[idx];
        let encrypted = conn.encrypted;
        let tag = if encrypted { GCM_TAG_SIZE } else { 0 };

        let data = conn.rx.rewind();
        if data.len() < 4 {
            return PacketStatus::NotReady;
        }
        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        // A packet that can never fit the reassembly buffer will never
        // complete; that is a protocol violation, not a wait state.
        if packet_length < 2 || 4 + packet_length + tag > SSH_RX_BUFFER_SIZE {
            debug!("ssh: {} unframeable packet length {}", idx, packet_length);
            return PacketStatus::Fatal;
        }
        let wire = 4 + packet_length + tag;
        if data.len() < wire {
            return PacketStatus::NotReady;
        }

        if encrypted {
            let (head, body) = data.split_at_mut(4);
            let aad: [u8; 4] = head.try_into().expect("4 length bytes");
            if !conn
                .crypto
                .decrypt_and_verify(&aad, &mut body[..packet_length + GCM_TAG_SIZE])
            {
                debug!("ssh: {} packet failed verification", idx);
                return PacketStatus::Fatal;
            }
        }

        let pad = data[4] as usize;
        if pad + 2 > packet_length {
            debug!("ssh: {} bad padding length {}", idx, pad);
            return PacketStatus::Fatal;
        }
        let payload_len = packet_length - 1 - pad;
        out[..payload_len].copy_from_slice(&data[5..5 + payload_len]);

        conn.rx.pop(wire);
        PacketStatus::Ready(payload_len)
    }

    fn handle_packet<D, A, P>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        auth: &mut P,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
        P: PasswordAuthenticator,
    {
        match self.conns[idx].state {
            // Still inside the banner; no packets can be pending.
            ConnState::BannerWait => {}
            ConnState::BannerSent => self.on_kexinit(tcp, app, idx, payload),
            ConnState::KexInitSent => self.on_kex_ecdh_init(tcp, app, idx, payload),
            ConnState::KexEcdhSent => self.on_newkeys(tcp, app, idx, payload),
            _ => self.on_encrypted_packet(tcp, app, auth, idx, payload),
        }
    }

    // =========================================================================
    // Key exchange
    // =========================================================================

    fn on_kexinit<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if payload.first() != Some(&SSH_MSG_KEXINIT) || !kex::validate_kexinit(payload) {
            debug!("ssh: {} unacceptable KEXINIT", idx);
            self.drop_connection(tcp, app, idx);
            return;
        }

        let conn = &mut self.conns[idx];
        // I_C: the client's unpadded KEXINIT payload, length-prefixed.
        kex::hash_string(&mut conn.crypto, payload);

        let mut cookie = [0u8; 16];
        conn.crypto.random(&mut cookie);
        let mut reply = [0u8; 256];
        let Some(len) = kex::build_kexinit(&mut reply, &cookie) else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        // I_S goes into the transcript before the packet gets padding.
        kex::hash_string(&mut conn.crypto, &reply[..len]);

        let socket = conn.socket.expect("valid connection has a socket");
        if send_packet(&mut conn.crypto, tcp, socket, false, &reply[..len]).is_err() {
            self.drop_connection(tcp, app, idx);
            return;
        }
        self.conns[idx].state = ConnState::KexInitSent;
    }

    fn on_kex_ecdh_init<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if payload.first() != Some(&SSH_MSG_KEX_ECDH_INIT) {
            self.drop_connection(tcp, app, idx);
            return;
        }
        let Some(client_public) = kex::parse_ecdh_init(payload) else {
            debug!("ssh: {} bad ECDH_INIT", idx);
            self.drop_connection(tcp, app, idx);
            return;
        };

        let conn = &mut self.conns[idx];

        let mut host_blob = [0u8; kex::HOST_KEY_BLOB_SIZE];
        let host_public = conn.crypto.host_public_key();
        let blob_len = kex::write_host_key_blob(&mut host_blob, &host_public)
            .expect("blob buffer is exactly sized");

        let mut server_public = [0u8; 32];
        conn.crypto.generate_x25519_keypair(&mut server_public);
        let mut shared = [0u8; 32];
        conn.crypto.shared_secret(&client_public, &mut shared);

        // Transcript continues: K_S, Q_C, Q_S as strings, then K as an
        // mpint with the conditional leading zero.
        kex::hash_string(&mut conn.crypto, &host_blob[..blob_len]);
        kex::hash_string(&mut conn.crypto, &client_public);
        kex::hash_string(&mut conn.crypto, &server_public);
        conn.crypto.sha256_update_mpint32(&shared);

        // H is the session id: there is no rekey, so it is set exactly
        // once per connection.
        let mut exchange_hash = [0u8; SHA256_DIGEST_SIZE];
        conn.crypto.sha256_final(&mut exchange_hash);
        conn.session_id = exchange_hash;

        let mut signature = [0u8; 64];
        conn.crypto
            .sign_exchange_hash(&exchange_hash, &mut signature);

        conn.crypto
            .derive_session_keys(&shared, &exchange_hash, &conn.session_id);
        shared.fill(0);

        let mut reply = [0u8; 256];
        let Some(len) = kex::build_ecdh_reply(
            &mut reply,
            &host_blob[..blob_len],
            &server_public,
            &signature,
        ) else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        let socket = conn.socket.expect("valid connection has a socket");
        if send_packet(&mut conn.crypto, tcp, socket, false, &reply[..len]).is_err() {
            self.drop_connection(tcp, app, idx);
            return;
        }
        self.conns[idx].state = ConnState::KexEcdhSent;
    }

    fn on_newkeys<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if payload.len() != 1 || payload[0] != SSH_MSG_NEWKEYS {
            self.drop_connection(tcp, app, idx);
            return;
        }

        let conn = &mut self.conns[idx];
        let socket = conn.socket.expect("valid connection has a socket");
        if send_packet(&mut conn.crypto, tcp, socket, false, &[SSH_MSG_NEWKEYS]).is_err() {
            self.drop_connection(tcp, app, idx);
            return;
        }

        // Keys take effect after NEWKEYS in each direction.
        self.conns[idx].encrypted = true;
        self.conns[idx].state = ConnState::Unauthenticated;
        debug!("ssh: {} keys active", idx);
    }

    // =========================================================================
    // Encrypted traffic
    // =========================================================================

    fn on_encrypted_packet<D, A, P>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        auth: &mut P,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
        P: PasswordAuthenticator,
    {
        match payload[0] {
            // OpenSSH opens every session with one of these.
            SSH_MSG_IGNORE => {}

            // The peer is leaving; no reply is owed.
            SSH_MSG_DISCONNECT => self.drop_connection(tcp, app, idx),

            SSH_MSG_SERVICE_REQUEST => self.on_service_request(tcp, app, idx, payload),
            SSH_MSG_USERAUTH_REQUEST => self.on_userauth_request(tcp, app, auth, idx, payload),
            SSH_MSG_CHANNEL_OPEN => self.on_channel_open(tcp, app, idx, payload),
            SSH_MSG_CHANNEL_REQUEST => self.on_channel_request(tcp, app, idx, payload),
            SSH_MSG_CHANNEL_DATA => self.on_channel_data(tcp, app, idx, payload),
            SSH_MSG_CHANNEL_CLOSE => self.on_channel_close(tcp, app, idx),

            // Flow control and half-close are noted and ignored: the
            // advertised window is large enough to never close, and EOF
            // is always followed by CLOSE.
            SSH_MSG_CHANNEL_WINDOW_ADJUST | SSH_MSG_CHANNEL_EOF => {}

            other => {
                debug!("ssh: {} unexpected packet type {}", idx, other);
            }
        }
    }

    fn on_service_request<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        let service = {
            let mut r = Reader::new(payload);
            let _ = r.u8();
            r.string()
        };
        if self.conns[idx].state != ConnState::Unauthenticated || service != Some(SERVICE_USERAUTH)
        {
            self.drop_connection(tcp, app, idx);
            return;
        }

        let mut reply = [0u8; 32];
        let mut w = Writer::new(&mut reply);
        w.u8(SSH_MSG_SERVICE_ACCEPT);
        w.string(SERVICE_USERAUTH);
        let len = w.finish().expect("reply buffer is large enough");

        if self.send_on(tcp, idx, &reply[..len]).is_err() {
            self.drop_connection(tcp, app, idx);
            return;
        }
        self.conns[idx].state = ConnState::AuthBegin;
    }

    fn on_userauth_request<D, A, P>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        auth: &mut P,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
        P: PasswordAuthenticator,
    {
        if self.conns[idx].state != ConnState::AuthBegin {
            self.drop_connection(tcp, app, idx);
            return;
        }

        let mut r = Reader::new(payload);
        let _ = r.u8();
        let (Some(username), Some(service), Some(method)) = (r.string(), r.string(), r.string())
        else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        if service != SERVICE_CONNECTION {
            self.drop_connection(tcp, app, idx);
            return;
        }

        if method == AUTH_METHOD_PASSWORD {
            // boolean FALSE, then the password itself.  Password change
            // requests (TRUE) are not supported.
            let (Some(change), Some(password)) = (r.boolean(), r.string()) else {
                self.drop_connection(tcp, app, idx);
                return;
            };
            if !change && auth.check_password(username, password) {
                debug!("ssh: {} authenticated", idx);
                if self.send_on(tcp, idx, &[SSH_MSG_USERAUTH_SUCCESS]).is_err() {
                    self.drop_connection(tcp, app, idx);
                    return;
                }
                self.conns[idx].state = ConnState::Authenticated;
                return;
            }
            // Deliberate fall-through to the failure reply.
        } else if method != AUTH_METHOD_NONE {
            debug!("ssh: {} unknown auth method", idx);
        }

        // "none" is the standard probe for available methods; failures
        // and unknown methods get the same answer.
        let mut reply = [0u8; 32];
        let mut w = Writer::new(&mut reply);
        w.u8(SSH_MSG_USERAUTH_FAILURE);
        w.string(AUTH_METHODS_AVAILABLE);
        w.boolean(false); // no partial success
        let len = w.finish().expect("reply buffer is large enough");
        if self.send_on(tcp, idx, &reply[..len]).is_err() {
            self.drop_connection(tcp, app, idx);
        }
    }

    // =========================================================================
    // Channel management
    // =========================================================================

    fn on_channel_open<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if self.conns[idx].state != ConnState::Authenticated {
            self.drop_connection(tcp, app, idx);
            return;
        }

        let mut r = Reader::new(payload);
        let _ = r.u8();
        let (Some(chan_type), Some(sender), Some(_window), Some(_max_packet)) =
            (r.string(), r.u32(), r.u32(), r.u32())
        else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        let mut reply = [0u8; 64];
        if chan_type == CHANNEL_TYPE_SESSION && !self.conns[idx].channel_open {
            self.conns[idx].client_channel = sender;
            self.conns[idx].channel_open = true;

            let mut w = Writer::new(&mut reply);
            w.u8(SSH_MSG_CHANNEL_OPEN_CONFIRMATION);
            w.u32(sender);
            w.u32(0); // our single channel id
            w.u32(CHANNEL_WINDOW);
            w.u32(SESSION_DATA_CHUNK as u32);
            let len = w.finish().expect("reply buffer is large enough");
            if self.send_on(tcp, idx, &reply[..len]).is_err() {
                self.drop_connection(tcp, app, idx);
            }
        } else {
            // One session channel per connection, nothing else.
            let mut w = Writer::new(&mut reply);
            w.u8(SSH_MSG_CHANNEL_OPEN_FAILURE);
            w.u32(sender);
            w.u32(3); // SSH_OPEN_UNKNOWN_CHANNEL_TYPE
            w.string(b"");
            w.string(b"");
            let len = w.finish().expect("reply buffer is large enough");
            if self.send_on(tcp, idx, &reply[..len]).is_err() {
                self.drop_connection(tcp, app, idx);
            }
        }
    }

    fn on_channel_request<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if !self.conns[idx].channel_open {
            self.drop_connection(tcp, app, idx);
            return;
        }

        let mut r = Reader::new(payload);
        let _ = r.u8();
        let (Some(_recipient), Some(req_type), Some(want_reply)) =
            (r.u32(), r.string(), r.boolean())
        else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        let granted = if req_type == REQUEST_SHELL {
            let ok = {
                let conn = &mut self.conns[idx];
                let mut session = SessionWriter {
                    crypto: &mut conn.crypto,
                    tcp: &mut *tcp,
                    socket: conn.socket.expect("valid connection has a socket"),
                    client_channel: conn.client_channel,
                };
                app.on_shell(&mut session, idx, None)
            };
            self.conns[idx].session_active |= ok;
            ok
        } else if req_type == REQUEST_EXEC {
            let Some(command) = r.string() else {
                self.drop_connection(tcp, app, idx);
                return;
            };
            let ok = {
                let conn = &mut self.conns[idx];
                let mut session = SessionWriter {
                    crypto: &mut conn.crypto,
                    tcp: &mut *tcp,
                    socket: conn.socket.expect("valid connection has a socket"),
                    client_channel: conn.client_channel,
                };
                app.on_shell(&mut session, idx, Some(command))
            };
            self.conns[idx].session_active |= ok;
            ok
        } else if req_type == REQUEST_SUBSYSTEM {
            let Some(name) = r.string() else {
                self.drop_connection(tcp, app, idx);
                return;
            };
            let ok = {
                let conn = &mut self.conns[idx];
                let mut session = SessionWriter {
                    crypto: &mut conn.crypto,
                    tcp: &mut *tcp,
                    socket: conn.socket.expect("valid connection has a socket"),
                    client_channel: conn.client_channel,
                };
                app.on_subsystem(&mut session, idx, name)
            };
            self.conns[idx].session_active |= ok;
            ok
        } else if req_type == REQUEST_PTY || req_type == REQUEST_ENV {
            // Terminal niceties a serial-style shell does not need; agree
            // so interactive clients proceed.
            true
        } else {
            debug!("ssh: {} unhandled channel request", idx);
            false
        };

        if want_reply {
            let code = if granted {
                SSH_MSG_CHANNEL_SUCCESS
            } else {
                SSH_MSG_CHANNEL_FAILURE
            };
            let client_channel = self.conns[idx].client_channel;
            let mut reply = [0u8; 16];
            let mut w = Writer::new(&mut reply);
            w.u8(code);
            w.u32(client_channel);
            let len = w.finish().expect("reply buffer is large enough");
            if self.send_on(tcp, idx, &reply[..len]).is_err() {
                self.drop_connection(tcp, app, idx);
            }
        }
    }

    fn on_channel_data<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        idx: usize,
        payload: &[u8],
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        let mut r = Reader::new(payload);
        let _ = r.u8();
        let (Some(_recipient), Some(data)) = (r.u32(), r.string()) else {
            self.drop_connection(tcp, app, idx);
            return;
        };

        if !self.conns[idx].session_active {
            debug!("ssh: {} data with no attached session", idx);
            self.drop_connection(tcp, app, idx);
            return;
        }

        let ok = {
            let conn = &mut self.conns[idx];
            let mut session = SessionWriter {
                crypto: &mut conn.crypto,
                tcp: &mut *tcp,
                socket: conn.socket.expect("valid connection has a socket"),
                client_channel: conn.client_channel,
            };
            app.on_session_data(&mut session, idx, data)
        };
        if !ok {
            self.drop_connection(tcp, app, idx);
        }
    }

    fn on_channel_close<D, A>(&mut self, tcp: &mut TcpApi<'_, '_, D>, app: &mut A, idx: usize)
    where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        let client_channel = self.conns[idx].client_channel;
        let mut reply = [0u8; 16];
        let mut w = Writer::new(&mut reply);
        w.u8(SSH_MSG_CHANNEL_CLOSE);
        w.u32(client_channel);
        let len = w.finish().expect("reply buffer is large enough");
        let _ = self.send_on(tcp, idx, &reply[..len]);

        self.drop_connection(tcp, app, idx);
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Sends a packet on connection `idx` using its current framing mode.
    fn send_on<D: EthernetDriver>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        idx: usize,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let conn = &mut self.conns[idx];
        let socket = conn.socket.ok_or(NetError::NotConnected)?;
        send_packet(&mut conn.crypto, tcp, socket, conn.encrypted, payload)
    }

    /// Host-initiated session data (shell output, subsystem replies).
    pub fn send_session_data<D: EthernetDriver>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        conn: ConnectionId,
        data: &[u8],
    ) -> Result<(), NetError> {
        let c = self.conns.get_mut(conn).ok_or(NetError::NotConnected)?;
        if !c.valid || !c.channel_open {
            return Err(NetError::NotConnected);
        }
        let socket = c.socket.ok_or(NetError::NotConnected)?;
        send_channel_data(&mut c.crypto, tcp, socket, c.client_channel, data)
    }

    /// Announces a protocol-error disconnect, then tears the connection
    /// down.  Nothing in the core requires this — errors normally drop
    /// the TCP connection silently — but hosts may prefer the courtesy.
    pub fn disconnect<D, A>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        app: &mut A,
        conn: ConnectionId,
    ) where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        if self.conns.get(conn).map_or(true, |c| !c.valid) {
            return;
        }
        let mut msg = [0u8; 32];
        let mut w = Writer::new(&mut msg);
        w.u8(SSH_MSG_DISCONNECT);
        w.u32(SSH_DISCONNECT_PROTOCOL_ERROR);
        w.string(b"protocol error");
        w.string(b"");
        let len = w.finish().expect("reply buffer is large enough");
        let _ = self.send_on(tcp, conn, &msg[..len]);
        self.drop_connection(tcp, app, conn);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Closes the TCP connection and zeroises all per-connection state.
    /// No DISCONNECT message is sent.
    fn drop_connection<D, A>(&mut self, tcp: &mut TcpApi<'_, '_, D>, app: &mut A, idx: usize)
    where
        D: EthernetDriver,
        A: SshApplication<D, C>,
    {
        let had_session = self.conns[idx].session_active;
        self.drop_connection_quiet(tcp, idx);
        if had_session {
            app.on_session_closed(idx);
        }
    }

    fn drop_connection_quiet<D: EthernetDriver>(
        &mut self,
        tcp: &mut TcpApi<'_, '_, D>,
        idx: usize,
    ) {
        let conn = &mut self.conns[idx];
        if !conn.valid {
            return;
        }
        debug!("ssh: {} dropped", idx);
        let socket = conn.socket;
        conn.reset();
        if let Some(socket) = socket {
            tcp.close_socket(socket);
        }
    }
}

// =============================================================================
// Packet TX helpers
// =============================================================================

/// Builds, (optionally) encrypts, and transmits one packet.
pub(crate) fn send_packet<D: EthernetDriver, C: CryptoEngine>(
    crypto: &mut C,
    tcp: &mut TcpApi<'_, '_, D>,
    socket: SocketId,
    encrypted: bool,
    payload: &[u8],
) -> Result<(), NetError> {
    let total = packet::wire_size(payload.len(), encrypted);
    if total > TCP_IPV4_PAYLOAD_MTU {
        return Err(NetError::InvalidArgument);
    }

    let mut buf = [0u8; TCP_IPV4_PAYLOAD_MTU];
    let wire = packet::frame_packet(&mut buf, payload, encrypted, &mut |pad| crypto.random(pad))
        .ok_or(NetError::InvalidArgument)?;

    if encrypted {
        let aad: [u8; 4] = buf[0..4].try_into().expect("4 length bytes");
        crypto.encrypt_and_mac(&aad, &mut buf[4..total]);
    }

    let id = tcp.get_tx_segment(socket)?;
    tcp.segment_payload_mut(id)[..total].copy_from_slice(&buf[..total]);
    tcp.send_tx_segment(socket, id, total);
    Ok(())
}

/// Sends unframed bytes (the version banner) on a socket.
fn send_raw<D: EthernetDriver>(
    tcp: &mut TcpApi<'_, '_, D>,
    socket: SocketId,
    data: &[u8],
) -> Result<(), NetError> {
    if data.len() > TCP_IPV4_PAYLOAD_MTU {
        return Err(NetError::InvalidArgument);
    }
    let id = tcp.get_tx_segment(socket)?;
    tcp.segment_payload_mut(id)[..data.len()].copy_from_slice(data);
    tcp.send_tx_segment(socket, id, data.len());
    Ok(())
}

/// Frames `data` into CHANNEL_DATA packets of at most
/// [`SESSION_DATA_CHUNK`] bytes each.
pub(crate) fn send_channel_data<D: EthernetDriver, C: CryptoEngine>(
    crypto: &mut C,
    tcp: &mut TcpApi<'_, '_, D>,
    socket: SocketId,
    client_channel: u32,
    data: &[u8],
) -> Result<(), NetError> {
    for chunk in data.chunks(SESSION_DATA_CHUNK) {
        let mut payload = [0u8; 9 + SESSION_DATA_CHUNK];
        let mut w = Writer::new(&mut payload);
        w.u8(SSH_MSG_CHANNEL_DATA);
        w.u32(client_channel);
        w.string(chunk);
        let len = w.finish().ok_or(NetError::InvalidArgument)?;
        send_packet(crypto, tcp, socket, true, &payload[..len])?;
    }
    Ok(())
}

// =============================================================================
// TCP server adapter
// =============================================================================

/// Bundles the transport with the host's application and authenticator
/// into a [`TcpServer`] for `NetStack::poll`.
pub struct SshEndpoint<'a, C: CryptoEngine, A, P> {
    pub ssh: &'a mut SshTransportServer<C>,
    pub app: &'a mut A,
    pub auth: &'a mut P,
}

impl<'a, D, C, A, P> TcpServer<D> for SshEndpoint<'a, C, A, P>
where
    D: EthernetDriver,
    C: CryptoEngine,
    A: SshApplication<D, C>,
    P: PasswordAuthenticator,
{
    fn on_connection_accepted(&mut self, _tcp: &mut TcpApi<'_, '_, D>, sock: SocketId) {
        self.ssh.on_connection_accepted(sock);
    }

    fn on_rx_data(&mut self, tcp: &mut TcpApi<'_, '_, D>, sock: SocketId, data: &[u8]) -> bool {
        self.ssh.on_rx_data(tcp, self.app, self.auth, sock, data)
    }

    fn on_connection_closed(&mut self, sock: SocketId) {
        self.ssh
            .on_tcp_closed(self.app, sock, |app, conn| app.on_session_closed(conn));
    }
}
