//! ICMPv4: echo-request handling.
//!
//! Only type 8 (echo request) is processed; the reply carries the ident,
//! sequence, and payload bytes unchanged with a freshly computed checksum.
//! Everything else is ignored.

use log::debug;

use crate::arp_cache::ArpCache;
use crate::checksum;
use crate::config::{ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE, IPV4_PAYLOAD_MTU};
use crate::ethernet::EthernetProtocol;
use crate::frame::EthernetDriver;
use crate::ipv4::Ipv4Protocol;
use crate::types::{Ipv4Addr, IpProtocol};

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Handles an incoming ICMPv4 message (`message` spans the full ICMP
/// header and payload).
pub fn on_rx_packet<D: EthernetDriver>(
    driver: &mut D,
    eth: &EthernetProtocol,
    cache: &mut ArpCache,
    ipv4: &Ipv4Protocol,
    src: Ipv4Addr,
    message: &[u8],
) {
    if message.len() < 8 || message.len() > IPV4_PAYLOAD_MTU {
        return;
    }

    if checksum::checksum(0, message) != 0 {
        debug!("icmp: bad checksum");
        return;
    }

    if message[0] != ICMP_TYPE_ECHO_REQUEST {
        return;
    }

    let Ok(id) = ipv4.get_tx_packet(driver, eth, cache, src, IpProtocol::Icmp) else {
        return;
    };

    {
        let out = &mut driver.frame_mut(id).bytes_mut()
            [ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE..];
        out[0] = ICMP_TYPE_ECHO_REPLY;
        out[1] = 0;
        out[2..4].copy_from_slice(&0u16.to_be_bytes());
        // Ident, sequence, and payload are echoed unchanged.
        out[4..message.len()].copy_from_slice(&message[4..]);
        let csum = checksum::checksum(0, &out[..message.len()]);
        out[2..4].copy_from_slice(&csum.to_be_bytes());
    }

    ipv4.send_tx_packet(driver, eth, id, message.len());
}
