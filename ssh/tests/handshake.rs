//! Full-stack SSH server scenarios.
//!
//! A scripted client speaks through the sim driver: real TCP segments in,
//! real frames out.  The client runs its own curve25519/ed25519/aes-gcm
//! side with the same RustCrypto primitives, so key agreement, transcript
//! hashing, signature verification, and packet protection are all checked
//! against an independent implementation.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce, Tag};
use ed25519_dalek::{Signature, SigningKey, Verifier};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use embernet_crypto::soft::SoftCryptoEngine;
use embernet_crypto::testutil::TestRng;
use embernet_net::checksum::{checksum, pseudo_header_sum};
use embernet_net::stack::NetStack;
use embernet_net::testutil::{FixedEntropy, NullUdpHandler, SimDriver};
use embernet_net::types::{Ipv4Addr, Ipv4Config, MacAddr, Port};
use embernet_ssh::packet::{
    SSH_MSG_CHANNEL_CLOSE, SSH_MSG_CHANNEL_DATA, SSH_MSG_CHANNEL_OPEN_CONFIRMATION,
    SSH_MSG_CHANNEL_REQUEST, SSH_MSG_CHANNEL_SUCCESS, SSH_MSG_KEX_ECDH_INIT,
    SSH_MSG_KEX_ECDH_REPLY, SSH_MSG_KEXINIT, SSH_MSG_NEWKEYS, SSH_MSG_SERVICE_ACCEPT,
    SSH_MSG_SERVICE_REQUEST, SSH_MSG_USERAUTH_FAILURE, SSH_MSG_USERAUTH_REQUEST,
    SSH_MSG_USERAUTH_SUCCESS, frame_packet,
};
use embernet_ssh::session::{PasswordAuthenticator, SessionWriter, SshApplication};
use embernet_ssh::transport::{ConnectionId, SshEndpoint, SshTransportServer};
use embernet_ssh::wire::{Reader, Writer};

const OUR_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const OUR_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);
const PEER_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 2]);
const SSH_PORT: u16 = 22;
const CLIENT_PORT: u16 = 50123;
const S0: u32 = 0x7777_0000;

const CLIENT_BANNER: &str = "SSH-2.0-scripted_client\r\n";
const SERVER_BANNER: &str = "SSH-2.0-embernet_0.1\r\n";

const HOST_SECRET: [u8; 32] = [0x11; 32];

type Engine = SoftCryptoEngine<TestRng>;

// =============================================================================
// Host application and authenticator doubles
// =============================================================================

#[derive(Default)]
struct TestApp {
    subsystem: Option<Vec<u8>>,
    shell_started: bool,
    received: Vec<u8>,
    closed: usize,
}

impl SshApplication<SimDriver, Engine> for TestApp {
    fn on_shell(
        &mut self,
        _session: &mut SessionWriter<'_, '_, '_, SimDriver, Engine>,
        _conn: ConnectionId,
        _command: Option<&[u8]>,
    ) -> bool {
        self.shell_started = true;
        true
    }

    fn on_subsystem(
        &mut self,
        _session: &mut SessionWriter<'_, '_, '_, SimDriver, Engine>,
        _conn: ConnectionId,
        name: &[u8],
    ) -> bool {
        if name == b"sftp" {
            self.subsystem = Some(name.to_vec());
            true
        } else {
            false
        }
    }

    fn on_session_data(
        &mut self,
        session: &mut SessionWriter<'_, '_, '_, SimDriver, Engine>,
        _conn: ConnectionId,
        data: &[u8],
    ) -> bool {
        self.received.extend_from_slice(data);
        // Echo straight back through the session channel.
        session.send(data).is_ok()
    }

    fn on_session_closed(&mut self, _conn: ConnectionId) {
        self.closed += 1;
    }
}

struct TestAuth;

impl PasswordAuthenticator for TestAuth {
    fn check_password(&mut self, username: &[u8], password: &[u8]) -> bool {
        username == b"admin" && password == b"hunter2"
    }
}

// =============================================================================
// Scripted client
// =============================================================================

/// Client-side GCM state for one direction.
struct DirectionKeys {
    key: [u8; 16],
    iv: [u8; 12],
}

impl DirectionKeys {
    fn bump(&mut self) {
        let mut counter = u64::from_be_bytes(self.iv[4..12].try_into().unwrap());
        counter = counter.wrapping_add(1);
        self.iv[4..12].copy_from_slice(&counter.to_be_bytes());
    }
}

struct Rig {
    stack: NetStack<SimDriver>,
    ssh: SshTransportServer<Engine>,
    app: TestApp,
    auth: TestAuth,
    client_seq: u32,
    /// Reassembled server->client TCP byte stream.
    stream: Vec<u8>,
    fin_seen: bool,
    /// Set once NEWKEYS completes; packets are then GCM in both directions.
    send_keys: Option<DirectionKeys>,
    recv_keys: Option<DirectionKeys>,
}

impl Rig {
    fn new() -> Self {
        let mut cfg = Ipv4Config::default();
        cfg.set_address(OUR_IP, Ipv4Addr([255, 255, 255, 0]));
        let mut stack = NetStack::new(SimDriver::new(), OUR_MAC, cfg);
        stack.arp_cache.insert(PEER_IP, PEER_MAC);
        stack.tcp.open_port(Port(SSH_PORT)).unwrap();

        let host_public = SigningKey::from_bytes(&HOST_SECRET).verifying_key().to_bytes();
        let engines = [1u64, 2u64].map(|seed| {
            let mut e = SoftCryptoEngine::new(TestRng::new(seed));
            e.set_host_key(&host_public, &HOST_SECRET);
            e
        });

        Self {
            stack,
            ssh: SshTransportServer::new(engines),
            app: TestApp::default(),
            auth: TestAuth,
            client_seq: 1000,
            stream: Vec::new(),
            fin_seen: false,
            send_keys: None,
            recv_keys: None,
        }
    }

    fn poll(&mut self) {
        let mut endpoint = SshEndpoint {
            ssh: &mut self.ssh,
            app: &mut self.app,
            auth: &mut self.auth,
        };
        let mut entropy = FixedEntropy(S0);
        while self
            .stack
            .poll(&mut endpoint, &mut NullUdpHandler, &mut entropy)
        {}
        drop(endpoint);
        self.collect_output();
    }

    fn inject_tcp(&mut self, flags: u16, payload: &[u8]) {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&CLIENT_PORT.to_be_bytes());
        tcp[2..4].copy_from_slice(&SSH_PORT.to_be_bytes());
        tcp[4..8].copy_from_slice(&self.client_seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&0u32.to_be_bytes());
        tcp[12..14].copy_from_slice(&((5u16 << 12) | flags).to_be_bytes());
        tcp[14..16].copy_from_slice(&16384u16.to_be_bytes());
        tcp.extend_from_slice(payload);
        let pseudo = pseudo_header_sum(PEER_IP, OUR_IP, 6, tcp.len());
        let csum = checksum(pseudo, &tcp);
        tcp[16..18].copy_from_slice(&csum.to_be_bytes());

        let total = 20 + tcp.len();
        let mut frame = Vec::new();
        frame.extend_from_slice(OUR_MAC.as_bytes());
        frame.extend_from_slice(PEER_MAC.as_bytes());
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = 6;
        ip[12..16].copy_from_slice(PEER_IP.as_bytes());
        ip[16..20].copy_from_slice(OUR_IP.as_bytes());
        let c = checksum(0, &ip);
        ip[10..12].copy_from_slice(&c.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&tcp);
        while frame.len() < 60 {
            frame.push(0);
        }
        assert!(self.stack.driver.inject_rx(&frame));
        self.poll();
    }

    fn connect(&mut self) {
        self.inject_tcp(0x02, &[]); // SYN
        self.client_seq = self.client_seq.wrapping_add(1);
        // SYN+ACK captured by collect_output; no client ACK needed beyond
        // the implicit one on the first data segment.
        self.inject_tcp(0x10, &[]); // ACK completes the handshake
    }

    fn send_stream(&mut self, data: &[u8]) {
        self.inject_tcp(0x18, data); // PSH|ACK
        self.client_seq = self.client_seq.wrapping_add(data.len() as u32);
    }

    /// Pulls transmitted frames, appending TCP payload bytes to `stream`.
    fn collect_output(&mut self) {
        let mut buf = [0u8; 1600];
        while let Some(len) = self.stack.driver.take_sent_into(&mut buf) {
            let frame = &buf[..len];
            if u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
                continue;
            }
            let ip = &frame[14..];
            if ip[9] != 6 {
                continue;
            }
            let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
            let tcp = &ip[20..total];
            let flags = u16::from_be_bytes([tcp[12], tcp[13]]) & 0x3f;
            if flags & 0x01 != 0 {
                self.fin_seen = true;
            }
            let off = ((u16::from_be_bytes([tcp[12], tcp[13]]) >> 12) & 0xf) as usize * 4;
            self.stream.extend_from_slice(&tcp[off..]);
        }
    }

    // --- SSH packet plumbing ------------------------------------------------

    /// Sends an SSH packet, encrypting when keys are active.
    fn send_ssh(&mut self, payload: &[u8]) {
        let encrypted = self.send_keys.is_some();
        let mut buf = vec![0u8; 4096];
        let mut fill = |pad: &mut [u8]| pad.fill(0);
        let wire = frame_packet(&mut buf, payload, encrypted, &mut fill).expect("fits");
        buf.truncate(wire);

        if let Some(keys) = &mut self.send_keys {
            let aad: [u8; 4] = buf[0..4].try_into().unwrap();
            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&keys.iv), &aad, &mut buf[4..])
                .expect("encrypt");
            keys.bump();
            buf.extend_from_slice(&tag);
        }

        self.send_stream(&buf.clone());
    }

    /// Pops the next complete SSH packet payload out of the server stream.
    fn next_ssh(&mut self) -> Option<Vec<u8>> {
        if self.stream.len() < 4 {
            return None;
        }
        let packet_length =
            u32::from_be_bytes([self.stream[0], self.stream[1], self.stream[2], self.stream[3]])
                as usize;
        let tag_len = if self.recv_keys.is_some() { 16 } else { 0 };
        let wire = 4 + packet_length + tag_len;
        if self.stream.len() < wire {
            return None;
        }

        let mut body = self.stream[4..4 + packet_length].to_vec();
        if let Some(keys) = &mut self.recv_keys {
            let aad: [u8; 4] = self.stream[0..4].try_into().unwrap();
            let tag = &self.stream[4 + packet_length..wire];
            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&keys.iv),
                    &aad,
                    &mut body,
                    Tag::from_slice(tag),
                )
                .expect("server packet must verify");
            keys.bump();
        }

        let pad = body[0] as usize;
        let payload = body[1..packet_length - pad].to_vec();
        self.stream.drain(..wire);
        Some(payload)
    }

    fn expect_ssh(&mut self, what: &str) -> Vec<u8> {
        self.next_ssh()
            .unwrap_or_else(|| panic!("expected {what} packet"))
    }
}

// =============================================================================
// Client-side key schedule
// =============================================================================

fn mpint32(value: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::new();
    if value[0] & 0x80 != 0 {
        out.extend_from_slice(&[0, 0, 0, 33, 0]);
    } else {
        out.extend_from_slice(&[0, 0, 0, 32]);
    }
    out.extend_from_slice(value);
    out
}

fn sha256_string(hash: &mut Sha256, data: &[u8]) {
    hash.update((data.len() as u32).to_be_bytes());
    hash.update(data);
}

fn derive_key(shared: &[u8; 32], h: &[u8; 32], label: u8) -> [u8; 32] {
    let mut hash = Sha256::new();
    hash.update(mpint32(shared));
    hash.update(h);
    hash.update([label]);
    hash.update(h); // session id == H before any rekey
    hash.finalize().into()
}

fn build_client_kexinit() -> Vec<u8> {
    let mut buf = [0u8; 512];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_KEXINIT);
    w.raw(&[0x55; 16]);
    w.string(b"curve25519-sha256,ecdh-sha2-nistp256");
    w.string(b"ssh-ed25519,rsa-sha2-512");
    w.string(b"aes128-gcm@openssh.com,aes128-ctr");
    w.string(b"aes128-gcm@openssh.com,aes128-ctr");
    w.string(b"hmac-sha2-256");
    w.string(b"hmac-sha2-256");
    w.string(b"none");
    w.string(b"none");
    w.string(b"");
    w.string(b"");
    w.boolean(false);
    w.u32(0);
    let len = w.finish().expect("fits");
    buf[..len].to_vec()
}

/// Runs banner + KEX + NEWKEYS; returns the exchange hash.
fn run_key_exchange(rig: &mut Rig) -> [u8; 32] {
    rig.connect();

    // Banners.
    rig.send_stream(CLIENT_BANNER.as_bytes());
    rig.collect_output();
    let banner: Vec<u8> = rig.stream.drain(..SERVER_BANNER.len()).collect();
    assert_eq!(banner, SERVER_BANNER.as_bytes());

    // KEXINIT exchange.
    let client_kexinit = build_client_kexinit();
    rig.send_ssh(&client_kexinit);
    let server_kexinit = rig.expect_ssh("KEXINIT");
    assert_eq!(server_kexinit[0], SSH_MSG_KEXINIT);

    // ECDH.
    let client_secret = StaticSecret::random_from_rng(&mut TestRng::new(99));
    let client_public = PublicKey::from(&client_secret).to_bytes();

    let mut ecdh = [0u8; 64];
    let mut w = Writer::new(&mut ecdh);
    w.u8(SSH_MSG_KEX_ECDH_INIT);
    w.string(&client_public);
    let len = w.finish().expect("fits");
    let ecdh = ecdh[..len].to_vec();
    rig.send_ssh(&ecdh);

    let reply = rig.expect_ssh("KEX_ECDH_REPLY");
    let mut r = Reader::new(&reply);
    assert_eq!(r.u8(), Some(SSH_MSG_KEX_ECDH_REPLY));
    let host_blob = r.string().expect("host key blob").to_vec();
    let server_public: [u8; 32] = r.string().expect("server key").try_into().unwrap();
    let signature_blob = r.string().expect("signature blob").to_vec();

    // Host key blob: string "ssh-ed25519" + string key.
    let mut br = Reader::new(&host_blob);
    assert_eq!(br.string(), Some(&b"ssh-ed25519"[..]));
    let host_public: [u8; 32] = br.string().expect("host key").try_into().unwrap();
    let expected_public = SigningKey::from_bytes(&HOST_SECRET).verifying_key().to_bytes();
    assert_eq!(host_public, expected_public);

    // Shared secret and the exchange hash, computed independently.
    let shared = client_secret
        .diffie_hellman(&PublicKey::from(server_public))
        .to_bytes();

    let mut hash = Sha256::new();
    sha256_string(&mut hash, &CLIENT_BANNER.as_bytes()[..CLIENT_BANNER.len() - 2]);
    sha256_string(&mut hash, &SERVER_BANNER.as_bytes()[..SERVER_BANNER.len() - 2]);
    sha256_string(&mut hash, &client_kexinit);
    sha256_string(&mut hash, &server_kexinit);
    sha256_string(&mut hash, &host_blob);
    sha256_string(&mut hash, &client_public);
    sha256_string(&mut hash, &server_public);
    hash.update(mpint32(&shared));
    let h: [u8; 32] = hash.finalize().into();

    // The signature covers H with the host key.
    let mut sr = Reader::new(&signature_blob);
    assert_eq!(sr.string(), Some(&b"ssh-ed25519"[..]));
    let raw_sig: [u8; 64] = sr.string().expect("signature").try_into().unwrap();
    SigningKey::from_bytes(&HOST_SECRET)
        .verifying_key()
        .verify(&h, &Signature::from_bytes(&raw_sig))
        .expect("exchange hash signature");

    // The server's notion of the session id must be our H.
    assert_eq!(rig.ssh.session_id(0), Some(h));

    // NEWKEYS both ways, then keys take effect.
    rig.send_ssh(&[SSH_MSG_NEWKEYS]);
    let newkeys = rig.expect_ssh("NEWKEYS");
    assert_eq!(newkeys, [SSH_MSG_NEWKEYS]);

    let iv_c2s = derive_key(&shared, &h, b'A');
    let iv_s2c = derive_key(&shared, &h, b'B');
    let key_c2s = derive_key(&shared, &h, b'C');
    let key_s2c = derive_key(&shared, &h, b'D');
    rig.send_keys = Some(DirectionKeys {
        key: key_c2s[..16].try_into().unwrap(),
        iv: iv_c2s[..12].try_into().unwrap(),
    });
    rig.recv_keys = Some(DirectionKeys {
        key: key_s2c[..16].try_into().unwrap(),
        iv: iv_s2c[..12].try_into().unwrap(),
    });

    h
}

/// Runs service request + password auth.
fn authenticate(rig: &mut Rig) {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_SERVICE_REQUEST);
    w.string(b"ssh-userauth");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let accept = rig.expect_ssh("SERVICE_ACCEPT");
    let mut r = Reader::new(&accept);
    assert_eq!(r.u8(), Some(SSH_MSG_SERVICE_ACCEPT));
    assert_eq!(r.string(), Some(&b"ssh-userauth"[..]));

    // Method query with "none" advertises password.
    let mut buf = [0u8; 128];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_USERAUTH_REQUEST);
    w.string(b"admin");
    w.string(b"ssh-connection");
    w.string(b"none");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let failure = rig.expect_ssh("USERAUTH_FAILURE");
    let mut r = Reader::new(&failure);
    assert_eq!(r.u8(), Some(SSH_MSG_USERAUTH_FAILURE));
    assert_eq!(r.string(), Some(&b"password"[..]));
    assert_eq!(r.boolean(), Some(false));

    // Real password attempt.
    let mut buf = [0u8; 128];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_USERAUTH_REQUEST);
    w.string(b"admin");
    w.string(b"ssh-connection");
    w.string(b"password");
    w.boolean(false);
    w.string(b"hunter2");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let success = rig.expect_ssh("USERAUTH_SUCCESS");
    assert_eq!(success, [SSH_MSG_USERAUTH_SUCCESS]);
}

/// Opens the session channel; returns nothing (server channel is 0).
fn open_session(rig: &mut Rig) {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(90); // CHANNEL_OPEN
    w.string(b"session");
    w.u32(7); // client channel id
    w.u32(0x20000);
    w.u32(0x8000);
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let confirm = rig.expect_ssh("CHANNEL_OPEN_CONFIRMATION");
    let mut r = Reader::new(&confirm);
    assert_eq!(r.u8(), Some(SSH_MSG_CHANNEL_OPEN_CONFIRMATION));
    assert_eq!(r.u32(), Some(7), "recipient is the client id");
    assert_eq!(r.u32(), Some(0), "server channel id");
}

fn channel_request(rig: &mut Rig, req: &[u8], extra: Option<&[u8]>) -> Vec<u8> {
    let mut buf = [0u8; 128];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_CHANNEL_REQUEST);
    w.u32(0);
    w.string(req);
    w.boolean(true);
    if let Some(arg) = extra {
        w.string(arg);
    }
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
    rig.expect_ssh("channel request reply")
}

fn send_channel_data(rig: &mut Rig, data: &[u8]) {
    let mut buf = vec![0u8; 16 + data.len()];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_CHANNEL_DATA);
    w.u32(0);
    w.string(data);
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn key_exchange_and_session_id() {
    let mut rig = Rig::new();
    let h = run_key_exchange(&mut rig);
    assert_ne!(h, [0u8; 32]);
    assert_eq!(rig.ssh.active_connections(), 1);
}

#[test]
fn full_session_with_sftp_subsystem_echo() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);
    authenticate(&mut rig);
    open_session(&mut rig);

    let reply = channel_request(&mut rig, b"subsystem", Some(b"sftp"));
    let mut r = Reader::new(&reply);
    assert_eq!(r.u8(), Some(SSH_MSG_CHANNEL_SUCCESS));
    assert_eq!(r.u32(), Some(7));
    assert_eq!(rig.app.subsystem.as_deref(), Some(&b"sftp"[..]));

    // Data flows to the app and echoes back encrypted.
    send_channel_data(&mut rig, b"ping over ssh");
    assert_eq!(rig.app.received, b"ping over ssh");

    let echoed = rig.expect_ssh("echoed CHANNEL_DATA");
    let mut r = Reader::new(&echoed);
    assert_eq!(r.u8(), Some(SSH_MSG_CHANNEL_DATA));
    assert_eq!(r.u32(), Some(7), "sent to the client channel");
    assert_eq!(r.string(), Some(&b"ping over ssh"[..]));

    // Close tears everything down: CHANNEL_CLOSE reply, then TCP FIN.
    let mut buf = [0u8; 16];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_CHANNEL_CLOSE);
    w.u32(0);
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let close = rig.expect_ssh("CHANNEL_CLOSE");
    assert_eq!(close[0], SSH_MSG_CHANNEL_CLOSE);
    assert!(rig.fin_seen, "server closes the TCP connection");
    assert_eq!(rig.ssh.active_connections(), 0);
    assert_eq!(rig.app.closed, 1);
}

#[test]
fn shell_request_starts_shell() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);
    authenticate(&mut rig);
    open_session(&mut rig);

    let reply = channel_request(&mut rig, b"shell", None);
    assert_eq!(reply[0], SSH_MSG_CHANNEL_SUCCESS);
    assert!(rig.app.shell_started);
}

#[test]
fn wrong_password_fails_then_right_succeeds() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);

    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_SERVICE_REQUEST);
    w.string(b"ssh-userauth");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
    rig.expect_ssh("SERVICE_ACCEPT");

    let mut buf = [0u8; 128];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_USERAUTH_REQUEST);
    w.string(b"admin");
    w.string(b"ssh-connection");
    w.string(b"password");
    w.boolean(false);
    w.string(b"wrong");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    let failure = rig.expect_ssh("USERAUTH_FAILURE");
    assert_eq!(failure[0], SSH_MSG_USERAUTH_FAILURE);
    assert_eq!(rig.ssh.active_connections(), 1, "failure is not fatal");

    let mut buf = [0u8; 128];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_USERAUTH_REQUEST);
    w.string(b"admin");
    w.string(b"ssh-connection");
    w.string(b"password");
    w.boolean(false);
    w.string(b"hunter2");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
    let success = rig.expect_ssh("USERAUTH_SUCCESS");
    assert_eq!(success, [SSH_MSG_USERAUTH_SUCCESS]);
}

#[test]
fn ignore_packets_are_discarded() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);

    // OpenSSH sends an IGNORE right after NEWKEYS; it must not disturb
    // the state machine or the packet counters.
    let mut buf = [0u8; 32];
    let mut w = Writer::new(&mut buf);
    w.u8(2); // SSH_MSG_IGNORE
    w.string(b"markus");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
    assert_eq!(rig.ssh.active_connections(), 1);

    // The very next packet still decrypts: counters stayed in step.
    authenticate(&mut rig);
}

#[test]
fn corrupted_tag_drops_connection() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);

    // Hand-roll a SERVICE_REQUEST and flip a ciphertext bit.
    let mut buf = vec![0u8; 256];
    let payload = {
        let mut w = Writer::new(&mut buf);
        w.u8(SSH_MSG_SERVICE_REQUEST);
        w.string(b"ssh-userauth");
        let len = w.finish().expect("fits");
        buf[..len].to_vec()
    };
    let mut packet = vec![0u8; 512];
    let mut fill = |pad: &mut [u8]| pad.fill(0);
    let wire = frame_packet(&mut packet, &payload, true, &mut fill).expect("fits");
    packet.truncate(wire);
    let keys = rig.send_keys.as_mut().unwrap();
    let aad: [u8; 4] = packet[0..4].try_into().unwrap();
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&keys.iv), &aad, &mut packet[4..])
        .expect("encrypt");
    packet.extend_from_slice(&tag);
    packet[7 + 3] ^= 0x40; // corrupt ciphertext

    rig.send_stream(&packet.clone());

    assert!(rig.fin_seen, "verification failure closes the connection");
    assert_eq!(rig.ssh.active_connections(), 0);
}

#[test]
fn non_ssh_banner_is_rejected() {
    let mut rig = Rig::new();
    rig.connect();
    rig.send_stream(b"HELLO WORLD\r\n");
    assert!(rig.fin_seen);
    assert_eq!(rig.ssh.active_connections(), 0);
}

#[test]
fn endless_banner_is_rejected() {
    let mut rig = Rig::new();
    rig.connect();

    // Over 512 bytes with no newline in sight.
    let noise = vec![b'x'; 600];
    rig.send_stream(&noise);
    assert!(rig.fin_seen, "newline-free flood is dropped");
    assert_eq!(rig.ssh.active_connections(), 0);
}

#[test]
fn repeated_service_request_is_a_protocol_violation() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);

    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_SERVICE_REQUEST);
    w.string(b"ssh-userauth");
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);
    rig.expect_ssh("SERVICE_ACCEPT");

    // A second request is an impossible transition: fatal.
    rig.send_ssh(&msg);
    assert!(rig.fin_seen);
    assert_eq!(rig.ssh.active_connections(), 0);
}

#[test]
fn host_initiated_disconnect_announces_and_closes() {
    let mut rig = Rig::new();
    run_key_exchange(&mut rig);

    {
        // Host-side sends borrow the stack's layers piecewise, the same
        // way the poll path does internally.
        let mut net = embernet_net::stack::NetTx {
            driver: &mut rig.stack.driver,
            eth: &rig.stack.eth,
            arp_cache: &mut rig.stack.arp_cache,
            ipv4: &mut rig.stack.ipv4,
        };
        let mut tcp = embernet_net::tcp::TcpApi {
            tcp: &mut rig.stack.tcp,
            net: &mut net,
        };
        rig.ssh.disconnect(&mut tcp, &mut rig.app, 0);
    }
    rig.collect_output();

    let disconnect = rig.expect_ssh("DISCONNECT");
    let mut r = Reader::new(&disconnect);
    assert_eq!(r.u8(), Some(1)); // SSH_MSG_DISCONNECT
    assert_eq!(r.u32(), Some(2), "protocol error reason");
    assert!(rig.fin_seen);
    assert_eq!(rig.ssh.active_connections(), 0);
}

#[test]
fn unsupported_cipher_suite_is_rejected() {
    let mut rig = Rig::new();
    rig.connect();
    rig.send_stream(CLIENT_BANNER.as_bytes());
    rig.collect_output();
    rig.stream.drain(..SERVER_BANNER.len());

    let mut buf = [0u8; 512];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_KEXINIT);
    w.raw(&[0x55; 16]);
    w.string(b"ecdh-sha2-nistp256"); // no curve25519
    w.string(b"ssh-ed25519");
    w.string(b"aes128-gcm@openssh.com");
    w.string(b"aes128-gcm@openssh.com");
    w.string(b"hmac-sha2-256");
    w.string(b"hmac-sha2-256");
    w.string(b"none");
    w.string(b"none");
    w.string(b"");
    w.string(b"");
    w.boolean(false);
    w.u32(0);
    let len = w.finish().expect("fits");
    let msg = buf[..len].to_vec();
    rig.send_ssh(&msg);

    assert!(rig.fin_seen);
    assert_eq!(rig.ssh.active_connections(), 0);
}
