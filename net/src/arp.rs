//! ARP protocol handler (RFC 826, Ethernet/IPv4 only).
//!
//! Requests for our address produce a unicast reply and opportunistically
//! cache the asker's binding; replies update the cache unconditionally.
//! Opcodes other than request (1) and reply (2) are dropped, as is any
//! packet whose hardware/protocol types or lengths do not match
//! Ethernet/IPv4.

use log::debug;

use crate::arp_cache::ArpCache;
use crate::ethernet::EthernetProtocol;
use crate::frame::EthernetDriver;
use crate::types::{EtherType, Ipv4Addr, MacAddr};

pub const ARP_PACKET_SIZE: usize = 28;

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_PTYPE_IPV4: u16 = 0x0800;
pub const ARP_HLEN_ETHERNET: u8 = 6;
pub const ARP_PLEN_IPV4: u8 = 4;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;

/// Handles an incoming ARP packet (`payload` starts at the ARP header).
pub fn on_rx_packet<D: EthernetDriver>(
    driver: &mut D,
    eth: &EthernetProtocol,
    cache: &mut ArpCache,
    our_ip: Ipv4Addr,
    payload: &[u8],
) {
    if payload.len() < ARP_PACKET_SIZE {
        debug!("arp: short packet ({} bytes)", payload.len());
        return;
    }

    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    let hlen = payload[4];
    let plen = payload[5];
    let oper = u16::from_be_bytes([payload[6], payload[7]]);

    if htype != ARP_HTYPE_ETHERNET
        || ptype != ARP_PTYPE_IPV4
        || hlen != ARP_HLEN_ETHERNET
        || plen != ARP_PLEN_IPV4
    {
        debug!(
            "arp: malformed header (htype={}, ptype=0x{:04x}, hlen={}, plen={})",
            htype, ptype, hlen, plen
        );
        return;
    }

    let sender_mac = MacAddr([
        payload[8], payload[9], payload[10], payload[11], payload[12], payload[13],
    ]);
    let sender_ip = Ipv4Addr([payload[14], payload[15], payload[16], payload[17]]);
    let target_ip = Ipv4Addr([payload[24], payload[25], payload[26], payload[27]]);

    match oper {
        ARP_OPER_REQUEST => {
            if target_ip == our_ip && !our_ip.is_unspecified() {
                // The asker is about to talk to us; cache it while replying.
                cache.insert(sender_ip, sender_mac);
                send_reply(driver, eth, our_ip, sender_ip, sender_mac);
            }
        }
        ARP_OPER_REPLY => {
            cache.insert(sender_ip, sender_mac);
        }
        _ => {
            debug!("arp: unknown opcode {}", oper);
        }
    }
}

/// Broadcasts an ARP request for `target_ip`.
pub fn send_query<D: EthernetDriver>(
    driver: &mut D,
    eth: &EthernetProtocol,
    our_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) {
    debug!("arp: query for {}", target_ip);
    send_packet(
        driver,
        eth,
        MacAddr::BROADCAST,
        ARP_OPER_REQUEST,
        our_ip,
        MacAddr::ZERO,
        target_ip,
    );
}

fn send_reply<D: EthernetDriver>(
    driver: &mut D,
    eth: &EthernetProtocol,
    our_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
    target_mac: MacAddr,
) {
    debug!("arp: replying to {} ({})", target_ip, target_mac);
    send_packet(
        driver,
        eth,
        target_mac,
        ARP_OPER_REPLY,
        our_ip,
        target_mac,
        target_ip,
    );
}

fn send_packet<D: EthernetDriver>(
    driver: &mut D,
    eth: &EthernetProtocol,
    dst: MacAddr,
    oper: u16,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) {
    let our_mac = eth.mac();
    let Some(id) = eth.get_tx_frame(driver, dst, EtherType::Arp) else {
        debug!("arp: no free tx frame");
        return;
    };

    let frame = driver.frame_mut(id);
    let arp = &mut frame.bytes_mut()[crate::config::ETHERNET_HEADER_SIZE..];
    arp[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    arp[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    arp[4] = ARP_HLEN_ETHERNET;
    arp[5] = ARP_PLEN_IPV4;
    arp[6..8].copy_from_slice(&oper.to_be_bytes());
    arp[8..14].copy_from_slice(our_mac.as_bytes());
    arp[14..18].copy_from_slice(sender_ip.as_bytes());
    arp[18..24].copy_from_slice(target_mac.as_bytes());
    arp[24..28].copy_from_slice(target_ip.as_bytes());

    eth.send_tx_frame(driver, id, ARP_PACKET_SIZE);
}
