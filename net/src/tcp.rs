//! TCP server: hashed connection table and segment state machine.
//!
//! This is a deliberately small TCP: a passive-open server with exact
//! in-order delivery and no retransmission machinery of its own.  A
//! segment is accepted only when its sequence number equals the next
//! expected value; anything else (duplicate, out-of-order) is dropped and
//! the peer's retransmission recovers.  Likewise, when the upper layer
//! cannot take delivered bytes we simply do not ACK them.
//!
//! The connection table is 2-way set-associative over 16 lines, hashed by
//! FNV-1 of (remote IP, local port, remote port).  A SYN that finds no
//! free way in its bucket is silently dropped — live sockets are never
//! evicted.  FIN tears the entry down immediately (no TIME-WAIT) so the
//! slot can be reused.

use bitflags::bitflags;
use log::debug;

use crate::checksum;
use crate::config::{
    ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE, TCP_HEADER_SIZE, TCP_IPV4_PAYLOAD_MTU,
    TCP_MAX_OPEN_PORTS, TCP_TABLE_LINES, TCP_TABLE_WAYS,
};
use crate::frame::{EthernetDriver, FrameId};
use crate::stack::NetTx;
use crate::types::{EntropySource, Ipv4Addr, IpProtocol, NetError, Port};
use embernet_lib::fnv1_32;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TcpFlags: u16 {
        const FIN = 0x0001;
        const SYN = 0x0002;
        const RST = 0x0004;
        const PSH = 0x0008;
        const ACK = 0x0010;
        const URG = 0x0020;
    }
}

/// Byte offset of the TCP payload within a TX frame (L2 + L3 + L4 headers).
pub const TCP_PAYLOAD_OFFSET: usize = ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + TCP_HEADER_SIZE;

// =============================================================================
// Connection table
// =============================================================================

/// One socket table row.
#[derive(Clone, Copy, Default)]
pub struct TcpTableEntry {
    valid: bool,
    pub remote_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_port: Port,
    /// Next expected incoming sequence number (the last ACK we sent).
    pub remote_seq: u32,
    /// Most recent sequence number we sent.
    pub local_seq: u32,
}

impl TcpTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Index handle for a socket table row.  Upper layers hold these instead
/// of references; the entry behind an id may be torn down at any event
/// boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SocketId(u16);

impl SocketId {
    fn new(way: usize, line: usize) -> Self {
        Self((way * TCP_TABLE_LINES + line) as u16)
    }

    #[inline]
    fn way(self) -> usize {
        self.0 as usize / TCP_TABLE_LINES
    }

    #[inline]
    fn line(self) -> usize {
        self.0 as usize % TCP_TABLE_LINES
    }
}

/// Server events surfaced to the layer above TCP (e.g. the SSH transport).
///
/// Handlers receive a [`TcpApi`] for sending on (or closing) sockets while
/// the event is being processed.  `on_rx_data` returning `false` signals
/// backpressure: the segment is not acknowledged and the peer retransmits.
pub trait TcpServer<D: EthernetDriver> {
    fn on_connection_accepted(&mut self, _tcp: &mut TcpApi<'_, '_, D>, _sock: SocketId) {}

    fn on_rx_data(&mut self, tcp: &mut TcpApi<'_, '_, D>, sock: SocketId, data: &[u8]) -> bool;

    fn on_connection_closed(&mut self, _sock: SocketId) {}
}

pub struct TcpProtocol {
    table: [[TcpTableEntry; TCP_TABLE_LINES]; TCP_TABLE_WAYS],
    open_ports: [Option<Port>; TCP_MAX_OPEN_PORTS],
}

impl TcpProtocol {
    pub const fn new() -> Self {
        Self {
            table: [[TcpTableEntry {
                valid: false,
                remote_ip: Ipv4Addr([0; 4]),
                local_port: Port(0),
                remote_port: Port(0),
                remote_seq: 0,
                local_seq: 0,
            }; TCP_TABLE_LINES]; TCP_TABLE_WAYS],
            open_ports: [None; TCP_MAX_OPEN_PORTS],
        }
    }

    // =========================================================================
    // Port table
    // =========================================================================

    pub fn open_port(&mut self, port: Port) -> Result<(), NetError> {
        if self.is_port_open(port) {
            return Err(NetError::AddressInUse);
        }
        for slot in &mut self.open_ports {
            if slot.is_none() {
                *slot = Some(port);
                return Ok(());
            }
        }
        Err(NetError::NoBufferSpace)
    }

    pub fn close_port(&mut self, port: Port) {
        for slot in &mut self.open_ports {
            if *slot == Some(port) {
                *slot = None;
            }
        }
    }

    pub fn is_port_open(&self, port: Port) -> bool {
        self.open_ports.contains(&Some(port))
    }

    // =========================================================================
    // Socket table
    // =========================================================================

    fn hash(ip: Ipv4Addr, local_port: Port, remote_port: Port) -> usize {
        let mut key = [0u8; 8];
        key[0..4].copy_from_slice(ip.as_bytes());
        key[4..6].copy_from_slice(&local_port.to_network_bytes());
        key[6..8].copy_from_slice(&remote_port.to_network_bytes());
        fnv1_32(&key) as usize % TCP_TABLE_LINES
    }

    /// Looks up the socket for a connection tuple.
    pub fn get_socket(
        &self,
        ip: Ipv4Addr,
        local_port: Port,
        remote_port: Port,
    ) -> Option<SocketId> {
        let line = Self::hash(ip, local_port, remote_port);
        for way in 0..TCP_TABLE_WAYS {
            let row = &self.table[way][line];
            if row.valid
                && row.remote_ip == ip
                && row.local_port == local_port
                && row.remote_port == remote_port
            {
                return Some(SocketId::new(way, line));
            }
        }
        None
    }

    fn allocate(&mut self, line: usize) -> Option<SocketId> {
        for way in 0..TCP_TABLE_WAYS {
            if !self.table[way][line].valid {
                self.table[way][line].valid = true;
                return Some(SocketId::new(way, line));
            }
        }
        None
    }

    fn release(&mut self, sock: SocketId) {
        self.table[sock.way()][sock.line()] = TcpTableEntry::default();
    }

    pub fn entry(&self, sock: SocketId) -> &TcpTableEntry {
        &self.table[sock.way()][sock.line()]
    }

    fn entry_mut(&mut self, sock: SocketId) -> &mut TcpTableEntry {
        &mut self.table[sock.way()][sock.line()]
    }

    pub fn active_count(&self) -> usize {
        self.table
            .iter()
            .flat_map(|w| w.iter())
            .filter(|e| e.valid)
            .count()
    }

    // =========================================================================
    // RX
    // =========================================================================

    /// Handles an incoming TCP segment (`segment` starts at the TCP header
    /// and spans `upper_len` bytes per the IP header).
    pub fn on_rx_packet<D: EthernetDriver, S: TcpServer<D>>(
        &mut self,
        net: &mut NetTx<'_, D>,
        srv: &mut S,
        entropy: &mut dyn EntropySource,
        src_ip: Ipv4Addr,
        segment: &[u8],
        upper_len: usize,
        pseudo_sum: u32,
    ) {
        if upper_len < TCP_HEADER_SIZE || segment.len() < upper_len {
            return;
        }
        if checksum::checksum(pseudo_sum, &segment[..upper_len]) != 0 {
            debug!("tcp: bad checksum from {}", src_ip);
            return;
        }

        let src_port = Port::from_network_bytes([segment[0], segment[1]]);
        let dst_port = Port::from_network_bytes([segment[2], segment[3]]);
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        let offset_flags = u16::from_be_bytes([segment[12], segment[13]]);
        let flags = TcpFlags::from_bits_truncate(offset_flags & 0x0fff);
        let data_offset = ((offset_flags >> 12) & 0x0f) as usize * 4;

        if data_offset < TCP_HEADER_SIZE || data_offset > upper_len {
            return;
        }
        let payload = &segment[data_offset..upper_len];

        if flags.contains(TcpFlags::SYN) {
            // Server-only: any SYN is a connection request (SYN+ACK would
            // mean we initiated, which we never do).
            self.on_rx_syn(net, srv, entropy, src_ip, src_port, dst_port, seq);
        } else if flags.contains(TcpFlags::RST) {
            self.on_rx_rst(srv, src_ip, src_port, dst_port);
        } else if flags.contains(TcpFlags::ACK) {
            self.on_rx_ack(net, srv, src_ip, src_port, dst_port, seq, flags, payload);
        }
    }

    fn on_rx_syn<D: EthernetDriver, S: TcpServer<D>>(
        &mut self,
        net: &mut NetTx<'_, D>,
        srv: &mut S,
        entropy: &mut dyn EntropySource,
        src_ip: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
        seq: u32,
    ) {
        if !self.is_port_open(dst_port) {
            // Closed port: refuse with RST+ACK of the SYN.
            send_control(
                net,
                src_ip,
                dst_port,
                src_port,
                0,
                seq.wrapping_add(1),
                TcpFlags::RST | TcpFlags::ACK,
                1,
            );
            return;
        }

        // Repeated SYN for a live socket: our SYN+ACK was lost, re-send it.
        if let Some(sock) = self.get_socket(src_ip, dst_port, src_port) {
            let e = *self.entry(sock);
            debug!("tcp: repeated SYN on {:?}, re-sending SYN+ACK", sock);
            send_control(
                net,
                e.remote_ip,
                e.local_port,
                e.remote_port,
                e.local_seq.wrapping_sub(1),
                e.remote_seq,
                TcpFlags::SYN | TcpFlags::ACK,
                TCP_IPV4_PAYLOAD_MTU as u16,
            );
            return;
        }

        let line = Self::hash(src_ip, dst_port, src_port);
        let Some(sock) = self.allocate(line) else {
            // Bucket full: silently drop, never evict live sockets.
            debug!("tcp: socket table bucket full, dropping SYN");
            return;
        };

        let isn = entropy.next_u32();
        {
            let e = self.entry_mut(sock);
            e.remote_ip = src_ip;
            e.local_port = dst_port;
            e.remote_port = src_port;
            e.remote_seq = seq.wrapping_add(1);
            e.local_seq = isn;
        }

        send_control(
            net,
            src_ip,
            dst_port,
            src_port,
            isn,
            seq.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
            TCP_IPV4_PAYLOAD_MTU as u16,
        );

        // Our SYN occupies one sequence number.
        self.entry_mut(sock).local_seq = isn.wrapping_add(1);

        let mut api = TcpApi {
            tcp: &mut *self,
            net: &mut *net,
        };
        srv.on_connection_accepted(&mut api, sock);
    }

    fn on_rx_rst<D: EthernetDriver, S: TcpServer<D>>(
        &mut self,
        srv: &mut S,
        src_ip: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
    ) {
        if let Some(sock) = self.get_socket(src_ip, dst_port, src_port) {
            debug!("tcp: RST on {:?}", sock);
            self.release(sock);
            srv.on_connection_closed(sock);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_rx_ack<D: EthernetDriver, S: TcpServer<D>>(
        &mut self,
        net: &mut NetTx<'_, D>,
        srv: &mut S,
        src_ip: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
        seq: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) {
        let Some(sock) = self.get_socket(src_ip, dst_port, src_port) else {
            return;
        };

        // Too big: we missed a segment and this is a later one.  Too
        // small: duplicate.  Either way, drop and let the peer retransmit
        // whatever we have not acknowledged.
        if self.entry(sock).remote_seq != seq {
            return;
        }

        if !payload.is_empty() {
            let mut api = TcpApi {
                tcp: &mut *self,
                net: &mut *net,
            };
            if !srv.on_rx_data(&mut api, sock, payload) {
                // Backpressure: no ACK, the peer will retransmit.
                return;
            }
        } else if !flags.contains(TcpFlags::FIN) {
            // Bare ACK, nothing to do.
            return;
        }

        let reply;
        {
            let e = self.entry_mut(sock);
            e.remote_seq = e.remote_seq.wrapping_add(payload.len() as u32);
            let mut ack = e.remote_seq;
            let mut reply_flags = TcpFlags::ACK;
            if flags.contains(TcpFlags::FIN) {
                // FIN occupies one sequence number; answer FIN+ACK and tear
                // down immediately (no TIME-WAIT, the slot is reusable).
                reply_flags |= TcpFlags::FIN;
                ack = ack.wrapping_add(1);
            }
            reply = (*e, ack, reply_flags);
        }

        let (entry, ack, reply_flags) = reply;
        if reply_flags.contains(TcpFlags::FIN) {
            self.release(sock);
            srv.on_connection_closed(sock);
        }
        send_control(
            net,
            entry.remote_ip,
            entry.local_port,
            entry.remote_port,
            entry.local_seq,
            ack,
            reply_flags,
            TCP_IPV4_PAYLOAD_MTU as u16,
        );
    }
}

impl Default for TcpProtocol {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Segment TX
// =============================================================================

/// Fills the TCP header of a prepared frame, checksums, and transmits.
#[allow(clippy::too_many_arguments)]
fn transmit_segment<D: EthernetDriver>(
    net: &mut NetTx<'_, D>,
    id: FrameId,
    dst_ip: Ipv4Addr,
    src_port: Port,
    dst_port: Port,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload_len: usize,
) {
    let upper_len = TCP_HEADER_SIZE + payload_len;
    {
        let pseudo = net.pseudo_sum(dst_ip, IpProtocol::Tcp, upper_len);
        let tcp =
            &mut net.frame_mut(id).bytes_mut()[ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE..];
        tcp[0..2].copy_from_slice(&src_port.to_network_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_network_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        let offset_flags = (5u16 << 12) | flags.bits();
        tcp[12..14].copy_from_slice(&offset_flags.to_be_bytes());
        tcp[14..16].copy_from_slice(&window.to_be_bytes());
        tcp[16..18].copy_from_slice(&0u16.to_be_bytes());
        tcp[18..20].copy_from_slice(&0u16.to_be_bytes());

        let csum = checksum::checksum(pseudo, &tcp[..upper_len]);
        tcp[16..18].copy_from_slice(&csum.to_be_bytes());
    }
    net.send_ipv4_tx_packet(id, upper_len);
}

/// Builds and sends a header-only segment (SYN+ACK, ACK, RST, FIN).
#[allow(clippy::too_many_arguments)]
fn send_control<D: EthernetDriver>(
    net: &mut NetTx<'_, D>,
    dst_ip: Ipv4Addr,
    src_port: Port,
    dst_port: Port,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
) {
    let id = match net.get_ipv4_tx_packet(dst_ip, IpProtocol::Tcp) {
        Ok(id) => id,
        // No buffer or no ARP entry: give up, peer will retransmit.
        Err(_) => return,
    };
    transmit_segment(
        net, id, dst_ip, src_port, dst_port, seq, ack, flags, window, 0,
    );
}

// =============================================================================
// Upper-layer send surface
// =============================================================================

/// Borrowed send/close surface handed to [`TcpServer`] callbacks.
pub struct TcpApi<'a, 'b, D: EthernetDriver> {
    pub tcp: &'a mut TcpProtocol,
    pub net: &'a mut NetTx<'b, D>,
}

impl<'a, 'b, D: EthernetDriver> TcpApi<'a, 'b, D> {
    /// Acquires a TX frame for a data segment on `sock`.
    ///
    /// Fill the payload via [`segment_payload_mut`](Self::segment_payload_mut),
    /// then [`send_tx_segment`](Self::send_tx_segment).
    pub fn get_tx_segment(&mut self, sock: SocketId) -> Result<FrameId, NetError> {
        let e = self.tcp.entry(sock);
        if !e.valid {
            return Err(NetError::NotConnected);
        }
        let remote_ip = e.remote_ip;
        self.net.get_ipv4_tx_packet(remote_ip, IpProtocol::Tcp)
    }

    /// The payload area of a segment frame (after L2/L3/L4 headers).
    pub fn segment_payload_mut(&mut self, id: FrameId) -> &mut [u8] {
        &mut self.net.frame_mut(id).bytes_mut()[TCP_PAYLOAD_OFFSET..]
    }

    /// Sends `payload_len` bytes already written into the segment frame.
    pub fn send_tx_segment(&mut self, sock: SocketId, id: FrameId, payload_len: usize) {
        let e = *self.tcp.entry(sock);
        if !e.valid {
            self.cancel_tx_segment(id);
            return;
        }
        let flags = if payload_len > 0 {
            TcpFlags::ACK | TcpFlags::PSH
        } else {
            TcpFlags::ACK
        };
        transmit_segment(
            self.net,
            id,
            e.remote_ip,
            e.local_port,
            e.remote_port,
            e.local_seq,
            e.remote_seq,
            flags,
            TCP_IPV4_PAYLOAD_MTU as u16,
            payload_len,
        );
        self.tcp.entry_mut(sock).local_seq = e.local_seq.wrapping_add(payload_len as u32);
    }

    /// Abandons a segment frame without sending.
    pub fn cancel_tx_segment(&mut self, id: FrameId) {
        self.net.cancel_tx(id);
    }

    /// Starts an orderly close: sends FIN+ACK and burns one sequence
    /// number.  The table entry stays live until the peer's FIN arrives.
    pub fn close_socket(&mut self, sock: SocketId) {
        let e = *self.tcp.entry(sock);
        if !e.valid {
            return;
        }
        send_control(
            self.net,
            e.remote_ip,
            e.local_port,
            e.remote_port,
            e.local_seq,
            e.remote_seq,
            TcpFlags::FIN | TcpFlags::ACK,
            TCP_IPV4_PAYLOAD_MTU as u16,
        );
        self.tcp.entry_mut(sock).local_seq = e.local_seq.wrapping_add(1);
    }

    /// Remote endpoint of a socket (diagnostics, auth logging).
    pub fn remote_endpoint(&self, sock: SocketId) -> Option<(Ipv4Addr, Port)> {
        let e = self.tcp.entry(sock);
        e.valid.then_some((e.remote_ip, e.remote_port))
    }
}
