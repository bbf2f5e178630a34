//! SFTP packet reassembly and request handling.
//!
//! Packets arrive inside the SSH CHANNEL_DATA stream as
//! `{u32 length, u8 type, payload}` where `length` counts the type byte
//! and payload.  Bytes accumulate in a per-connection FIFO; complete
//! packets are processed in place.  A packet whose declared length
//! cannot ever fit the FIFO flips the connection into huge mode: the
//! header and request id are captured, then the remaining payload is
//! handed to the WRITE streamer in chunks of at least 64 bytes (or
//! whatever completes the packet).

use log::debug;

use embernet_crypto::CryptoEngine;
use embernet_lib::CircularFifo;
use embernet_net::frame::EthernetDriver;
use embernet_ssh::session::SessionWriter;
use embernet_ssh::wire::{Reader, Writer};

use crate::SFTP_RX_BUFFER_SIZE;
use crate::fs::{SftpAccess, SftpFilesystem, SftpOpenFlags};

/// Connections tracked; matches the SSH transport's table size.
pub const SFTP_TABLE_SIZE: usize = 2;

/// Protocol version we negotiate down to.
pub const SFTP_MAX_VERSION: u32 = 6;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;

pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;

/// Streaming chunks smaller than this are left to accumulate, except for
/// the final piece of a packet.
const MIN_STREAM_CHUNK: usize = 64;

/// Outbound byte sink for SFTP replies.
///
/// The canonical implementation is the SSH [`SessionWriter`]; tests
/// substitute a capture buffer.
pub trait SessionOutput {
    fn send(&mut self, data: &[u8]) -> bool;
}

impl<'a, 'b, 'c, D: EthernetDriver, C: CryptoEngine> SessionOutput
    for SessionWriter<'a, 'b, 'c, D, C>
{
    fn send(&mut self, data: &[u8]) -> bool {
        SessionWriter::send(self, data).is_ok()
    }
}

// =============================================================================
// Per-connection state
// =============================================================================

#[derive(Clone, Copy, Default)]
struct HugePacket {
    in_progress: bool,
    ptype: u8,
    total_length: u32,
    bytes_so_far: u32,
    request_id: u32,
    write_handle: u32,
    write_offset: u64,
    write_bytes_so_far: u32,
    write_length: u32,
    /// Latched when the stream cannot be parsed; remaining bytes of the
    /// packet are discarded.
    failed: bool,
}

struct SftpConnectionState {
    active: bool,
    rx: CircularFifo<SFTP_RX_BUFFER_SIZE>,
    version: u32,
    huge: HugePacket,
}

impl SftpConnectionState {
    const fn new() -> Self {
        Self {
            active: false,
            rx: CircularFifo::new(),
            version: 0,
            huge: HugePacket {
                in_progress: false,
                ptype: 0,
                total_length: 0,
                bytes_so_far: 0,
                request_id: 0,
                write_handle: 0,
                write_offset: 0,
                write_bytes_so_far: 0,
                write_length: 0,
                failed: false,
            },
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.rx.reset();
        self.version = 0;
        self.huge = HugePacket::default();
    }
}

// =============================================================================
// Server
// =============================================================================

pub struct SftpServer<F: SftpFilesystem> {
    conns: [SftpConnectionState; SFTP_TABLE_SIZE],
    fs: F,
}

impl<F: SftpFilesystem> SftpServer<F> {
    pub fn new(fs: F) -> Self {
        Self {
            conns: [SftpConnectionState::new(), SftpConnectionState::new()],
            fs,
        }
    }

    pub fn filesystem(&mut self) -> &mut F {
        &mut self.fs
    }

    /// Attaches the subsystem to connection `conn`.
    pub fn on_connection_accepted(&mut self, conn: usize) {
        if let Some(state) = self.conns.get_mut(conn) {
            state.reset();
            state.active = true;
        }
    }

    pub fn on_connection_closed(&mut self, conn: usize) {
        if let Some(state) = self.conns.get_mut(conn) {
            state.reset();
        }
    }

    /// Handles session-channel bytes for connection `conn`.
    ///
    /// Returns `false` on an unrecoverable framing problem; the caller
    /// should tear the connection down.
    pub fn on_session_data(
        &mut self,
        out: &mut dyn SessionOutput,
        conn: usize,
        data: &[u8],
    ) -> bool {
        let Some(state) = self.conns.get(conn) else {
            return false;
        };
        if !state.active {
            return false;
        }

        if !self.conns[conn].rx.push(data) {
            // The FIFO is sized so that only a protocol violation can
            // overfill it (anything bigger goes through huge mode).
            debug!("sftp: {} reassembly overflow", conn);
            return false;
        }

        loop {
            if self.conns[conn].huge.in_progress {
                if !self.pump_huge_packet(out, conn) {
                    return false;
                }
                if self.conns[conn].huge.in_progress {
                    // Waiting for more of the huge payload.
                    return true;
                }
                continue;
            }

            match self.classify_next(conn) {
                NextPacket::None => return true,
                NextPacket::Whole => {
                    if !self.handle_whole_packet(out, conn) {
                        return false;
                    }
                }
                NextPacket::Huge => {
                    if !self.start_huge_packet(out, conn) {
                        return false;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Framing
    // =========================================================================

    fn classify_next(&mut self, conn: usize) -> NextPacket {
        let state = &mut self.conns[conn];
        let data = state.rx.rewind();
        if data.len() < 4 {
            return NextPacket::None;
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if length + 4 >= SFTP_RX_BUFFER_SIZE {
            // Will never fit whole; stream it once the header and request
            // id are both here.
            if data.len() >= 9 {
                return NextPacket::Huge;
            }
            return NextPacket::None;
        }
        if data.len() >= 4 + length {
            return NextPacket::Whole;
        }
        NextPacket::None
    }

    fn handle_whole_packet(&mut self, out: &mut dyn SessionOutput, conn: usize) -> bool {
        // Copy out so replies can be built while the FIFO is free.
        let mut packet = [0u8; SFTP_RX_BUFFER_SIZE];
        let (ptype, len) = {
            let state = &mut self.conns[conn];
            let data = state.rx.rewind();
            let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if length == 0 {
                return false;
            }
            let ptype = data[4];
            let payload_len = length - 1;
            packet[..payload_len].copy_from_slice(&data[5..5 + payload_len]);
            state.rx.pop(4 + length);
            (ptype, payload_len)
        };
        self.handle_packet(out, conn, ptype, &packet[..len])
    }

    fn handle_packet(
        &mut self,
        out: &mut dyn SessionOutput,
        conn: usize,
        ptype: u8,
        payload: &[u8],
    ) -> bool {
        match ptype {
            SSH_FXP_INIT => self.on_init(out, conn, payload),

            SSH_FXP_STAT | SSH_FXP_LSTAT => self.on_stat(out, conn, payload),

            SSH_FXP_OPEN => self.on_open(out, conn, payload),

            SSH_FXP_CLOSE => self.on_close(out, conn, payload),

            // Attribute changes are accepted and discarded: the adapter
            // has no notion of permissions or times.
            SSH_FXP_FSETSTAT => {
                let mut r = Reader::new(payload);
                let Some(request_id) = r.u32() else {
                    return false;
                };
                send_status(out, request_id, SSH_FX_OK)
            }

            other => {
                debug!("sftp: {} unsupported request type {}", conn, other);
                let mut r = Reader::new(payload);
                let Some(request_id) = r.u32() else {
                    return false;
                };
                send_status(out, request_id, SSH_FX_OP_UNSUPPORTED)
            }
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn on_init(&mut self, out: &mut dyn SessionOutput, conn: usize, payload: &[u8]) -> bool {
        let mut r = Reader::new(payload);
        let Some(client_version) = r.u32() else {
            return false;
        };
        let version = client_version.min(SFTP_MAX_VERSION);
        self.conns[conn].version = version;
        debug!("sftp: {} negotiated version {}", conn, version);

        let mut reply = [0u8; 16];
        let mut w = Writer::new(&mut reply);
        w.u32(version);
        let len = w.finish().expect("reply buffer is large enough");
        send_packet(out, SSH_FXP_VERSION, &reply[..len])
    }

    /// STAT and LSTAT answer alike: no symlinks in the adapter model.
    fn on_stat(&mut self, out: &mut dyn SessionOutput, conn: usize, payload: &[u8]) -> bool {
        let _ = conn;
        let mut r = Reader::new(payload);
        let (Some(request_id), Some(path)) = (r.u32(), r.string()) else {
            return false;
        };

        let code = if self.fs.file_exists(path) {
            SSH_FX_OK
        } else {
            SSH_FX_NO_SUCH_FILE
        };
        send_status(out, request_id, code)
    }

    fn on_open(&mut self, out: &mut dyn SessionOutput, conn: usize, payload: &[u8]) -> bool {
        let _ = conn;
        let mut r = Reader::new(payload);
        let (Some(request_id), Some(path)) = (r.u32(), r.string()) else {
            return false;
        };
        // Version 6 carries desired-access + flags; older clients send a
        // single pflags word, which lands in `desired_access` and is
        // passed through to the adapter either way.  Unknown bits are
        // retained, not masked.
        let desired_access = SftpAccess::from_bits_retain(r.u32().unwrap_or(0));
        let flags = SftpOpenFlags::from_bits_retain(r.u32().unwrap_or(0));

        if !self.fs.can_open(path, desired_access, flags) {
            return send_status(out, request_id, SSH_FX_PERMISSION_DENIED);
        }
        match self.fs.open(path, desired_access, flags) {
            Some(handle) => {
                let mut reply = [0u8; 16];
                let mut w = Writer::new(&mut reply);
                w.u32(request_id);
                w.string(&handle.to_be_bytes());
                let len = w.finish().expect("reply buffer is large enough");
                send_packet(out, SSH_FXP_HANDLE, &reply[..len])
            }
            None => send_status(out, request_id, SSH_FX_FAILURE),
        }
    }

    fn on_close(&mut self, out: &mut dyn SessionOutput, conn: usize, payload: &[u8]) -> bool {
        let _ = conn;
        let mut r = Reader::new(payload);
        let (Some(request_id), Some(handle)) = (r.u32(), r.string()) else {
            return false;
        };
        if handle.len() != 4 {
            return send_status(out, request_id, SSH_FX_BAD_MESSAGE);
        }
        let handle = u32::from_be_bytes([handle[0], handle[1], handle[2], handle[3]]);

        let code = if self.fs.close(handle) {
            SSH_FX_OK
        } else {
            SSH_FX_FAILURE
        };
        send_status(out, request_id, code)
    }

    // =========================================================================
    // Huge packets
    // =========================================================================

    fn start_huge_packet(&mut self, out: &mut dyn SessionOutput, conn: usize) -> bool {
        let (ptype, length, request_id) = {
            let state = &mut self.conns[conn];
            let data = state.rx.rewind();
            let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let ptype = data[4];
            let request_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
            // Type and request id are consumed here and count toward the
            // packet length.
            state.rx.pop(9);
            (ptype, length, request_id)
        };

        let state = &mut self.conns[conn];
        state.huge.in_progress = true;
        state.huge.failed = false;
        state.huge.ptype = ptype;
        state.huge.total_length = length;
        state.huge.bytes_so_far = 5;
        state.huge.request_id = request_id;
        state.huge.write_bytes_so_far = 0;
        state.huge.write_length = 0;

        if ptype != SSH_FXP_WRITE {
            // Streaming is only implemented for WRITE; everything else is
            // answered now and its payload discarded as it arrives.
            debug!("sftp: {} huge packet of type {} unsupported", conn, ptype);
            state.huge.failed = true;
            if !send_status(out, request_id, SSH_FX_OP_UNSUPPORTED) {
                return false;
            }
        }

        self.pump_huge_packet(out, conn)
    }

    fn pump_huge_packet(&mut self, out: &mut dyn SessionOutput, conn: usize) -> bool {
        loop {
            let (available, bytes_left) = {
                let state = &mut self.conns[conn];
                let available = state.rx.read_size();
                let bytes_left = (state.huge.total_length - state.huge.bytes_so_far) as usize;
                (available, bytes_left)
            };

            let take = if available >= bytes_left {
                bytes_left
            } else if available > MIN_STREAM_CHUNK {
                // Tiny trickles are left to accumulate; processing them
                // per-byte would burn CPU for nothing.
                available
            } else {
                return true;
            };

            let ok = self.consume_huge_chunk(out, conn, take);

            let state = &mut self.conns[conn];
            state.rx.pop(take);
            state.huge.bytes_so_far += take as u32;
            if state.huge.bytes_so_far >= state.huge.total_length {
                state.huge.in_progress = false;
                return ok;
            }
            if !ok {
                return false;
            }
        }
    }

    /// Feeds `take` bytes of huge-packet payload to the WRITE streamer.
    fn consume_huge_chunk(&mut self, out: &mut dyn SessionOutput, conn: usize, take: usize) -> bool {
        if self.conns[conn].huge.failed {
            // Discarding the remainder of an unsupported or broken packet.
            return true;
        }

        let mut header = [0u8; 20];
        let (first, request_id) = {
            let state = &mut self.conns[conn];
            let data = state.rx.rewind();
            let first = state.huge.bytes_so_far == 5;
            if first {
                if take < 20 {
                    state.huge.failed = true;
                    return send_status(out, state.huge.request_id, SSH_FX_BAD_MESSAGE);
                }
                header.copy_from_slice(&data[..20]);
            }
            (first, state.huge.request_id)
        };

        if first {
            // string handle (always 4 bytes), u64 offset, u32 data length.
            let handle_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            if handle_len != 4 {
                self.conns[conn].huge.failed = true;
                return send_status(out, request_id, SSH_FX_BAD_MESSAGE);
            }
            let state = &mut self.conns[conn];
            state.huge.write_handle =
                u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            state.huge.write_offset = u64::from_be_bytes([
                header[8], header[9], header[10], header[11], header[12], header[13], header[14],
                header[15],
            ]);
            state.huge.write_length =
                u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
            state.huge.write_bytes_so_far = 0;
        }

        let skip = if first { 20 } else { 0 };
        let (handle, offset) = {
            let state = &self.conns[conn];
            (state.huge.write_handle, state.huge.write_offset)
        };

        if take > skip {
            let wrote = {
                // The chunk is still sitting at the front of the FIFO.
                let state = &mut self.conns[conn];
                let data = state.rx.rewind();
                let chunk = &data[skip..take];
                // Borrow dance: copy the chunk reference through to the
                // adapter without dislodging the FIFO.
                self_write(&mut self.fs, handle, offset, chunk)
            };
            if !wrote {
                self.conns[conn].huge.failed = true;
                return send_status(out, request_id, SSH_FX_FAILURE);
            }
            let written = (take - skip) as u32;
            let state = &mut self.conns[conn];
            state.huge.write_offset += written as u64;
            state.huge.write_bytes_so_far += written;
        }

        let state = &self.conns[conn];
        if state.huge.write_bytes_so_far >= state.huge.write_length {
            return send_status(out, request_id, SSH_FX_OK);
        }
        true
    }
}

/// Free-function shim so the filesystem borrow is visibly disjoint from
/// the connection-table borrow above.
fn self_write<F: SftpFilesystem>(fs: &mut F, handle: u32, offset: u64, data: &[u8]) -> bool {
    fs.write(handle, offset, data)
}

enum NextPacket {
    None,
    Whole,
    Huge,
}

// =============================================================================
// Reply construction
// =============================================================================

fn send_packet(out: &mut dyn SessionOutput, ptype: u8, payload: &[u8]) -> bool {
    let mut buf = [0u8; 64];
    if 5 + payload.len() > buf.len() {
        return false;
    }
    buf[0..4].copy_from_slice(&((1 + payload.len()) as u32).to_be_bytes());
    buf[4] = ptype;
    buf[5..5 + payload.len()].copy_from_slice(payload);
    out.send(&buf[..5 + payload.len()])
}

fn send_status(out: &mut dyn SessionOutput, request_id: u32, code: u32) -> bool {
    let mut payload = [0u8; 24];
    let mut w = Writer::new(&mut payload);
    w.u32(request_id);
    w.u32(code);
    w.string(b""); // error message
    w.string(b""); // language tag
    let len = w.finish().expect("reply buffer is large enough");
    send_packet(out, SSH_FXP_STATUS, &payload[..len])
}
