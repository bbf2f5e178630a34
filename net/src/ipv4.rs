//! IPv4 layer: header validation, routing decisions, and TX construction.
//!
//! Inbound packets are validated (version, 20-byte header, total length,
//! checksum) and classified by destination before protocol dispatch.
//! Outbound packets resolve their L2 next hop through the ARP cache —
//! the destination itself on the local subnet, the configured gateway
//! otherwise.  A cache miss fires an ARP query and fails the send; the
//! caller retries on a later tick once the reply has landed.

use log::debug;

use crate::arp;
use crate::arp_cache::ArpCache;
use crate::checksum;
use crate::config::{ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE};
use crate::ethernet::EthernetProtocol;
use crate::frame::{EthernetDriver, FrameId};
use crate::types::{EtherType, Ipv4Addr, Ipv4Config, IpProtocol, MacAddr, NetError};

/// Destination classification for a received packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressType {
    Broadcast,
    Multicast,
    UnicastUs,
    UnicastOther,
}

/// Parsed fields of an accepted IPv4 packet.
pub struct Ipv4Rx {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    /// Bytes of L4 payload following the 20-byte header.
    pub upper_len: usize,
    /// Pseudo-header accumulator for verifying the L4 checksum.
    pub pseudo_sum: u32,
}

pub struct Ipv4Protocol {
    pub config: Ipv4Config,
    promiscuous: bool,
    /// Accept unicasts that are not (yet) our address — open while a DHCP
    /// exchange is in flight, since the OFFER targets the offered address.
    allow_unknown_unicasts: bool,
}

impl Ipv4Protocol {
    pub const fn new(config: Ipv4Config) -> Self {
        Self {
            config,
            promiscuous: false,
            allow_unknown_unicasts: false,
        }
    }

    pub fn set_promiscuous(&mut self, on: bool) {
        self.promiscuous = on;
    }

    pub fn set_allow_unknown_unicasts(&mut self, on: bool) {
        self.allow_unknown_unicasts = on;
    }

    /// Classifies a destination address against our configuration.
    pub fn address_type(&self, addr: Ipv4Addr) -> AddressType {
        if addr.is_limited_broadcast() || (addr == self.config.broadcast && !addr.is_unspecified())
        {
            AddressType::Broadcast
        } else if addr.is_multicast() {
            AddressType::Multicast
        } else if addr == self.config.address && !addr.is_unspecified() {
            AddressType::UnicastUs
        } else {
            AddressType::UnicastOther
        }
    }

    // =========================================================================
    // RX
    // =========================================================================

    /// Validates an IPv4 packet (`packet` starts at the IP header).
    ///
    /// 1. Version must be 4, header length exactly 20 (no options).
    /// 2. Total length must fit the received bytes.
    /// 3. Header checksum must verify.
    /// 4. Destination must be for us, broadcast, or multicast — unicasts to
    ///    other addresses pass only in promiscuous mode or while unknown
    ///    unicasts are explicitly allowed.
    pub fn parse_rx(&self, packet: &[u8]) -> Option<Ipv4Rx> {
        if packet.len() < IPV4_HEADER_SIZE {
            debug!("ipv4: short packet ({} bytes)", packet.len());
            return None;
        }

        if packet[0] != 0x45 {
            // High nibble: version. Low nibble: IHL — options unsupported.
            debug!("ipv4: unsupported version/IHL 0x{:02x}", packet[0]);
            return None;
        }

        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if total_len < IPV4_HEADER_SIZE || total_len > packet.len() {
            debug!("ipv4: bad total length {} (have {})", total_len, packet.len());
            return None;
        }

        if checksum::checksum(0, &packet[..IPV4_HEADER_SIZE]) != 0 {
            debug!("ipv4: bad header checksum");
            return None;
        }

        let src = Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]);
        let dst = Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]);

        if self.address_type(dst) == AddressType::UnicastOther
            && !self.promiscuous
            && !self.allow_unknown_unicasts
        {
            return None;
        }

        let proto = packet[9];
        let upper_len = total_len - IPV4_HEADER_SIZE;

        Some(Ipv4Rx {
            src,
            dst,
            proto,
            upper_len,
            pseudo_sum: checksum::pseudo_header_sum(src, dst, proto, upper_len),
        })
    }

    // =========================================================================
    // TX
    // =========================================================================

    /// Acquires a TX frame with Ethernet and IPv4 headers filled in.
    ///
    /// The L4 payload goes at byte
    /// `ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE` of the frame; the caller
    /// finishes with [`send_tx_packet`](Self::send_tx_packet) or abandons
    /// with [`cancel_tx_packet`](Self::cancel_tx_packet).
    ///
    /// Fails with `HostUnreachable` when the next hop is not in the ARP
    /// cache (an ARP query is issued so a retry can succeed), and with
    /// `NetworkUnreachable` for an off-subnet destination when no
    /// gateway is configured.
    pub fn get_tx_packet<D: EthernetDriver>(
        &self,
        driver: &mut D,
        eth: &EthernetProtocol,
        cache: &mut ArpCache,
        dest: Ipv4Addr,
        proto: IpProtocol,
    ) -> Result<FrameId, NetError> {
        let dst_mac = match self.address_type(dest) {
            AddressType::Broadcast => MacAddr::BROADCAST,
            AddressType::Multicast => multicast_mac(dest),
            AddressType::UnicastUs | AddressType::UnicastOther => {
                let next_hop = if self.config.is_local_subnet(dest) {
                    dest
                } else if !self.config.gateway.is_unspecified() {
                    self.config.gateway
                } else {
                    // Off subnet with nowhere to forward: ARPing for the
                    // destination itself would never resolve.
                    debug!("ipv4: no route to {}", dest);
                    return Err(NetError::NetworkUnreachable);
                };
                match cache.lookup(next_hop) {
                    Some(mac) => mac,
                    None => {
                        arp::send_query(driver, eth, self.config.address, next_hop);
                        return Err(NetError::HostUnreachable);
                    }
                }
            }
        };

        let id = eth
            .get_tx_frame(driver, dst_mac, EtherType::Ipv4)
            .ok_or(NetError::NoBufferSpace)?;

        let hdr = &mut driver.frame_mut(id).bytes_mut()[ETHERNET_HEADER_SIZE..];
        hdr[0] = 0x45;
        hdr[1] = 0; // DSCP/ECN
        hdr[2..4].copy_from_slice(&0u16.to_be_bytes()); // total length, patched at send
        hdr[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
        hdr[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF, no fragments
        hdr[8] = 64; // TTL
        hdr[9] = proto.as_u8();
        hdr[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, patched at send
        hdr[12..16].copy_from_slice(self.config.address.as_bytes());
        hdr[16..20].copy_from_slice(dest.as_bytes());

        Ok(id)
    }

    /// Patches length and checksum, then transmits the packet.
    pub fn send_tx_packet<D: EthernetDriver>(
        &self,
        driver: &mut D,
        eth: &EthernetProtocol,
        id: FrameId,
        upper_len: usize,
    ) {
        let total_len = IPV4_HEADER_SIZE + upper_len;
        {
            let hdr = &mut driver.frame_mut(id).bytes_mut()[ETHERNET_HEADER_SIZE..];
            hdr[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            hdr[10..12].copy_from_slice(&0u16.to_be_bytes());
            let csum = checksum::checksum(0, &hdr[..IPV4_HEADER_SIZE]);
            hdr[10..12].copy_from_slice(&csum.to_be_bytes());
        }
        eth.send_tx_frame(driver, id, total_len);
    }

    /// Abandons a packet acquired with `get_tx_packet`.
    pub fn cancel_tx_packet<D: EthernetDriver>(
        &self,
        driver: &mut D,
        eth: &EthernetProtocol,
        id: FrameId,
    ) {
        eth.cancel_tx_frame(driver, id);
    }

    /// Pseudo-header accumulator for an outbound L4 checksum.
    pub fn pseudo_header_sum(&self, dest: Ipv4Addr, proto: IpProtocol, upper_len: usize) -> u32 {
        checksum::pseudo_header_sum(self.config.address, dest, proto.as_u8(), upper_len)
    }
}

/// Maps a multicast group address to its 01:00:5e MAC (RFC 1112: low 23
/// bits of the group carried in the MAC).
fn multicast_mac(addr: Ipv4Addr) -> MacAddr {
    MacAddr([
        0x01,
        0x00,
        0x5e,
        addr.0[1] & 0x7f,
        addr.0[2],
        addr.0[3],
    ])
}
