//! UDP layer: datagram validation, port bindings, and TX construction.
//!
//! Received datagrams are checksum-verified against the IPv4 pseudo-header
//! (a zero checksum is tolerated on RX per RFC 768) and demuxed by
//! destination port through a small binding table.  On TX the checksum is
//! always computed; a result of zero is transmitted as `0xffff`.

use log::debug;

use crate::arp_cache::ArpCache;
use crate::checksum;
use crate::config::{
    ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE, UDP_HEADER_SIZE, UDP_MAX_BINDINGS,
};
use crate::ethernet::EthernetProtocol;
use crate::frame::{EthernetDriver, FrameId};
use crate::ipv4::Ipv4Protocol;
use crate::stack::NetTx;
use crate::types::{Ipv4Addr, IpProtocol, NetError, Port};

/// Host-side consumer of datagrams bound with [`UdpOwner::Host`].
///
/// `tag` is the value the host chose at bind time, so one handler can
/// serve several ports.
pub trait UdpHandler<D: EthernetDriver> {
    fn on_rx_data(
        &mut self,
        net: &mut NetTx<'_, D>,
        tag: u8,
        src: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
        payload: &[u8],
    );
}

/// Who receives datagrams for a bound port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpOwner {
    /// The in-stack DHCP client.
    Dhcp,
    /// A host-registered handler, identified by the host's own tag.
    Host(u8),
}

/// Parsed fields of an accepted UDP datagram.
pub struct UdpRx {
    pub src_port: Port,
    pub dst_port: Port,
    /// Payload bounds relative to the start of the UDP header.
    pub payload_off: usize,
    pub payload_len: usize,
}

pub struct UdpProtocol {
    bindings: [Option<(Port, UdpOwner)>; UDP_MAX_BINDINGS],
}

impl UdpProtocol {
    pub const fn new() -> Self {
        Self {
            bindings: [None; UDP_MAX_BINDINGS],
        }
    }

    /// Registers `owner` for datagrams addressed to `port`.
    pub fn bind(&mut self, port: Port, owner: UdpOwner) -> Result<(), NetError> {
        if self.bindings.iter().flatten().any(|(p, _)| *p == port) {
            return Err(NetError::AddressInUse);
        }
        for slot in &mut self.bindings {
            if slot.is_none() {
                *slot = Some((port, owner));
                return Ok(());
            }
        }
        Err(NetError::NoBufferSpace)
    }

    pub fn unbind(&mut self, port: Port) {
        for slot in &mut self.bindings {
            if matches!(slot, Some((p, _)) if *p == port) {
                *slot = None;
            }
        }
    }

    pub fn lookup(&self, port: Port) -> Option<UdpOwner> {
        self.bindings
            .iter()
            .flatten()
            .find(|(p, _)| *p == port)
            .map(|(_, o)| *o)
    }

    // =========================================================================
    // RX
    // =========================================================================

    /// Validates a UDP datagram (`packet` starts at the UDP header and
    /// spans `upper_len` bytes per the IP header).
    pub fn parse_rx(packet: &[u8], upper_len: usize, pseudo_sum: u32) -> Option<UdpRx> {
        if upper_len < UDP_HEADER_SIZE || packet.len() < upper_len {
            return None;
        }

        let udp_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        if udp_len < UDP_HEADER_SIZE || udp_len > upper_len {
            debug!("udp: bad length field {} (ip says {})", udp_len, upper_len);
            return None;
        }

        // RFC 768: an all-zero checksum means "not computed".
        let wire_csum = u16::from_be_bytes([packet[6], packet[7]]);
        if wire_csum != 0 && checksum::checksum(pseudo_sum, &packet[..upper_len]) != 0 {
            debug!("udp: bad checksum");
            return None;
        }

        Some(UdpRx {
            src_port: Port::from_network_bytes([packet[0], packet[1]]),
            dst_port: Port::from_network_bytes([packet[2], packet[3]]),
            payload_off: UDP_HEADER_SIZE,
            payload_len: udp_len - UDP_HEADER_SIZE,
        })
    }

    // =========================================================================
    // TX
    // =========================================================================

    /// Acquires a TX frame addressed to `dest` with headers down to UDP
    /// reserved.  The datagram payload goes at byte
    /// `ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE`.
    pub fn get_tx_packet<D: EthernetDriver>(
        driver: &mut D,
        eth: &EthernetProtocol,
        cache: &mut ArpCache,
        ipv4: &Ipv4Protocol,
        dest: Ipv4Addr,
    ) -> Result<FrameId, NetError> {
        ipv4.get_tx_packet(driver, eth, cache, dest, IpProtocol::Udp)
    }

    /// Fills the UDP header, computes the mandatory checksum, and sends.
    pub fn send_tx_packet<D: EthernetDriver>(
        driver: &mut D,
        eth: &EthernetProtocol,
        ipv4: &Ipv4Protocol,
        id: FrameId,
        src_port: Port,
        dst_port: Port,
        payload_len: usize,
    ) {
        let udp_len = UDP_HEADER_SIZE + payload_len;
        let dest;
        {
            let frame = driver.frame_mut(id);
            let bytes = frame.bytes_mut();
            dest = Ipv4Addr([
                bytes[ETHERNET_HEADER_SIZE + 16],
                bytes[ETHERNET_HEADER_SIZE + 17],
                bytes[ETHERNET_HEADER_SIZE + 18],
                bytes[ETHERNET_HEADER_SIZE + 19],
            ]);
            let udp = &mut bytes[ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE..];
            udp[0..2].copy_from_slice(&src_port.to_network_bytes());
            udp[2..4].copy_from_slice(&dst_port.to_network_bytes());
            udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            udp[6..8].copy_from_slice(&0u16.to_be_bytes());

            let pseudo = ipv4.pseudo_header_sum(dest, IpProtocol::Udp, udp_len);
            let mut csum = checksum::checksum(pseudo, &udp[..udp_len]);
            if csum == 0 {
                csum = 0xffff;
            }
            udp[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        ipv4.send_tx_packet(driver, eth, id, udp_len);
    }
}

impl Default for UdpProtocol {
    fn default() -> Self {
        Self::new()
    }
}
