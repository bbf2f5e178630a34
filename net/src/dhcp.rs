//! DHCPv4 client (RFC 2131/2132).
//!
//! A five-state lease machine clocked by the 1 Hz aging tick:
//!
//! ```text
//! NoLease -> DiscoverSent -> RequestSent -> LeaseActive <-> LeaseRenew
//! ```
//!
//! The transaction ID is frozen for the lifetime of one discover/request
//! exchange and regenerated per transaction.  All timeouts are integral
//! seconds counted down on the tick; expiry retransmits.  A REQUEST that
//! goes unanswered falls back to DISCOVER (the request is not cached).
//! Link-down at any time resets the machine to `NoLease`.
//!
//! While an exchange is in flight the IPv4 layer is told to accept
//! unknown unicasts: the OFFER is addressed to the offered IP, which is
//! not ours yet.

use log::{debug, info};

use crate::config::{ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::frame::EthernetDriver;
use crate::stack::NetTx;
use crate::types::{EntropySource, Ipv4Addr, Port};

pub const DHCP_SERVER_PORT: Port = Port(67);
pub const DHCP_CLIENT_PORT: Port = Port(68);

const BOOTP_OP_REQUEST: u8 = 1;
const BOOTP_OP_REPLY: u8 = 2;
const BOOTP_HTYPE_ETHERNET: u8 = 1;
const BOOTP_HEADER_LEN: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_ADDRESS_REQUEST: u8 = 50;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MESSAGE_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_PARAM_REQUEST_LIST: u8 = 55;
const OPTION_END: u8 = 255;

pub const DHCP_DISCOVER: u8 = 1;
pub const DHCP_OFFER: u8 = 2;
pub const DHCP_REQUEST: u8 = 3;
pub const DHCP_ACK: u8 = 5;
pub const DHCP_NAK: u8 = 6;

const DISCOVER_TIMEOUT_SECONDS: u16 = 5;
const RENEW_TIMEOUT_SECONDS: u16 = 5;

/// Renew once the lease has less than this many seconds left.
const RENEW_THRESHOLD_SECONDS: u32 = 30;

const DEFAULT_LEASE_SECONDS: u32 = 3600;

/// Largest DHCP payload we emit (fixed BOOTP header plus options).
const DHCP_TX_MAX: usize = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpState {
    NoLease,
    DiscoverSent,
    RequestSent,
    LeaseActive,
    LeaseRenew,
}

pub struct DhcpClient {
    enabled: bool,
    state: DhcpState,
    /// Frozen for the duration of one transaction.
    xid: u32,
    elapsed_seconds: u16,
    timeout: u16,
    lease_valid_seconds: u32,
    server_address: Ipv4Addr,
    dns_server: Ipv4Addr,
}

impl DhcpClient {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            state: DhcpState::NoLease,
            xid: 0,
            elapsed_seconds: 0,
            timeout: 0,
            lease_valid_seconds: 0,
            server_address: Ipv4Addr::UNSPECIFIED,
            dns_server: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.state = DhcpState::NoLease;
        }
    }

    #[inline]
    pub fn state(&self) -> DhcpState {
        self.state
    }

    #[inline]
    pub fn lease_valid_seconds(&self) -> u32 {
        self.lease_valid_seconds
    }

    /// DNS server from the most recent lease (unspecified if the server
    /// offered none).  The core does no name resolution; this is for the
    /// host's resolver.
    #[inline]
    pub fn dns_server(&self) -> Ipv4Addr {
        self.dns_server
    }

    pub fn on_link_down(&mut self) {
        self.state = DhcpState::NoLease;
    }

    // =========================================================================
    // 1 Hz state machine
    // =========================================================================

    pub fn on_aging_tick<D: EthernetDriver>(
        &mut self,
        net: &mut NetTx<'_, D>,
        entropy: &mut dyn EntropySource,
    ) {
        if !self.enabled || !net.is_link_up() {
            self.state = DhcpState::NoLease;
            return;
        }

        self.elapsed_seconds = self.elapsed_seconds.wrapping_add(1);

        match self.state {
            DhcpState::NoLease => {
                self.xid = entropy.next_u32();
                self.state = DhcpState::DiscoverSent;
                self.timeout = DISCOVER_TIMEOUT_SECONDS;
                self.elapsed_seconds = 0;
                self.send_discover(net);
            }

            DhcpState::DiscoverSent => {
                if self.timeout == 0 {
                    self.send_discover(net);
                    self.timeout = DISCOVER_TIMEOUT_SECONDS;
                } else {
                    self.timeout -= 1;
                }
            }

            // The REQUEST never made it (or the ACK was lost).  We did not
            // cache the request contents, so fall back to DISCOVER.
            DhcpState::RequestSent => {
                if self.timeout == 0 {
                    self.send_discover(net);
                    self.state = DhcpState::DiscoverSent;
                    self.timeout = DISCOVER_TIMEOUT_SECONDS;
                } else {
                    self.timeout -= 1;
                }
            }

            DhcpState::LeaseActive => {
                if self.lease_valid_seconds < RENEW_THRESHOLD_SECONDS {
                    self.xid = entropy.next_u32();
                    self.elapsed_seconds = 0;
                    self.send_renew(net);
                } else {
                    self.lease_valid_seconds -= 1;
                }
            }

            DhcpState::LeaseRenew => {
                if self.timeout == 0 {
                    self.send_renew(net);
                } else {
                    self.timeout -= 1;
                }
            }
        }
    }

    // =========================================================================
    // TX
    // =========================================================================

    fn send_discover<D: EthernetDriver>(&mut self, net: &mut NetTx<'_, D>) {
        let mac = net.our_mac();
        let mut payload = [0u8; DHCP_TX_MAX];
        let mut len = write_bootp_header(&mut payload, mac.0, self.xid, self.elapsed_seconds);

        len = add_option(&mut payload, len, OPTION_MESSAGE_TYPE, &[DHCP_DISCOVER]);
        len = add_option(
            &mut payload,
            len,
            OPTION_PARAM_REQUEST_LIST,
            &[OPTION_SUBNET_MASK, OPTION_ROUTER, OPTION_DNS],
        );
        len = add_end(&mut payload, len);

        if !self.send_udp(net, Ipv4Addr::BROADCAST, &payload[..len]) {
            // No TX buffer: re-send on the very next tick, by which time
            // the pool (or the link) may have recovered.
            self.timeout = 0;
            return;
        }

        // The OFFER will target the offered address, which is not ours yet.
        net.ipv4.set_allow_unknown_unicasts(true);
        debug!("dhcp: DISCOVER sent (xid={:08x})", self.xid);
    }

    /// Sends a REQUEST for our current address to the leasing server.
    fn send_renew<D: EthernetDriver>(&mut self, net: &mut NetTx<'_, D>) {
        let mac = net.our_mac();
        let our_ip = net.ipv4.config.address;
        let server = self.server_address;

        let mut payload = [0u8; DHCP_TX_MAX];
        let mut len = write_bootp_header(&mut payload, mac.0, self.xid, self.elapsed_seconds);
        payload[12..16].copy_from_slice(our_ip.as_bytes()); // ciaddr
        payload[20..24].copy_from_slice(server.as_bytes()); // siaddr

        len = add_option(&mut payload, len, OPTION_MESSAGE_TYPE, &[DHCP_REQUEST]);
        len = add_option(&mut payload, len, OPTION_ADDRESS_REQUEST, our_ip.as_bytes());
        len = add_option(&mut payload, len, OPTION_SERVER_ID, server.as_bytes());
        len = add_end(&mut payload, len);

        if !self.send_udp(net, server, &payload[..len]) {
            self.timeout = 0;
            self.state = DhcpState::LeaseRenew;
            return;
        }

        self.timeout = RENEW_TIMEOUT_SECONDS;
        self.state = DhcpState::LeaseRenew;
        debug!("dhcp: renew REQUEST sent (xid={:08x})", self.xid);
    }

    fn send_udp<D: EthernetDriver>(
        &mut self,
        net: &mut NetTx<'_, D>,
        dest: Ipv4Addr,
        payload: &[u8],
    ) -> bool {
        let Ok(id) = net.get_udp_tx_packet(dest) else {
            return false;
        };
        let off = ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE;
        net.frame_mut(id).bytes_mut()[off..off + payload.len()].copy_from_slice(payload);
        net.send_udp_tx_packet(id, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, payload.len());
        true
    }

    // =========================================================================
    // RX
    // =========================================================================

    /// Handles a datagram delivered to the client port.
    pub fn on_rx_data<D: EthernetDriver>(
        &mut self,
        net: &mut NetTx<'_, D>,
        src_ip: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
        payload: &[u8],
    ) {
        if !self.enabled || src_port != DHCP_SERVER_PORT || dst_port != DHCP_CLIENT_PORT {
            return;
        }
        if payload.len() < BOOTP_HEADER_LEN {
            return;
        }
        if payload[0] != BOOTP_OP_REPLY
            || payload[1] != BOOTP_HTYPE_ETHERNET
            || payload[2] != 6
        {
            return;
        }
        if u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) != self.xid {
            return;
        }
        if payload[236..240] != MAGIC_COOKIE {
            return;
        }

        let options = &payload[BOOTP_HEADER_LEN..];
        let Some(msg_type) = find_option(options, OPTION_MESSAGE_TYPE) else {
            return;
        };
        if msg_type.len() != 1 {
            return;
        }

        match msg_type[0] {
            DHCP_OFFER => self.on_rx_offer(net, src_ip, payload),
            DHCP_ACK => self.on_rx_ack(net, src_ip, payload),
            DHCP_NAK => {
                debug!("dhcp: NAK, restarting");
                self.state = DhcpState::NoLease;
            }
            _ => {}
        }
    }

    fn on_rx_offer<D: EthernetDriver>(
        &mut self,
        net: &mut NetTx<'_, D>,
        src_ip: Ipv4Addr,
        payload: &[u8],
    ) {
        if self.state != DhcpState::DiscoverSent {
            return;
        }

        // An offer we cannot route with is useless; wait for a better one.
        let options = &payload[BOOTP_HEADER_LEN..];
        if find_option(options, OPTION_ROUTER).is_none()
            || find_option(options, OPTION_SUBNET_MASK).is_none()
        {
            debug!("dhcp: offer without router/netmask, ignoring");
            return;
        }

        let yiaddr = Ipv4Addr([payload[16], payload[17], payload[18], payload[19]]);
        let mac = net.our_mac();

        let mut request = [0u8; DHCP_TX_MAX];
        let mut len = write_bootp_header(&mut request, mac.0, self.xid, self.elapsed_seconds);
        request[20..24].copy_from_slice(src_ip.as_bytes()); // siaddr

        len = add_option(&mut request, len, OPTION_MESSAGE_TYPE, &[DHCP_REQUEST]);
        len = add_option(&mut request, len, OPTION_ADDRESS_REQUEST, yiaddr.as_bytes());
        len = add_option(&mut request, len, OPTION_SERVER_ID, src_ip.as_bytes());
        len = add_end(&mut request, len);

        if !self.send_udp(net, Ipv4Addr::BROADCAST, &request[..len]) {
            return;
        }

        debug!("dhcp: offered {} by {}, REQUEST sent", yiaddr, src_ip);
        self.state = DhcpState::RequestSent;
        self.timeout = DISCOVER_TIMEOUT_SECONDS;
    }

    fn on_rx_ack<D: EthernetDriver>(
        &mut self,
        net: &mut NetTx<'_, D>,
        src_ip: Ipv4Addr,
        payload: &[u8],
    ) {
        if self.state != DhcpState::RequestSent && self.state != DhcpState::LeaseRenew {
            return;
        }

        let yiaddr = Ipv4Addr([payload[16], payload[17], payload[18], payload[19]]);
        let options = &payload[BOOTP_HEADER_LEN..];

        let netmask = find_option(options, OPTION_SUBNET_MASK)
            .filter(|v| v.len() >= 4)
            .map(|v| Ipv4Addr([v[0], v[1], v[2], v[3]]))
            .unwrap_or(net.ipv4.config.netmask);
        let gateway = find_option(options, OPTION_ROUTER)
            .filter(|v| v.len() >= 4)
            .map(|v| Ipv4Addr([v[0], v[1], v[2], v[3]]))
            .unwrap_or(net.ipv4.config.gateway);

        net.ipv4.config.set_address(yiaddr, netmask);
        net.ipv4.config.gateway = gateway;

        self.lease_valid_seconds = find_option(options, OPTION_LEASE_TIME)
            .filter(|v| v.len() >= 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
            .unwrap_or(DEFAULT_LEASE_SECONDS);

        self.server_address = find_option(options, OPTION_SERVER_ID)
            .filter(|v| v.len() >= 4)
            .map(|v| Ipv4Addr([v[0], v[1], v[2], v[3]]))
            .unwrap_or(src_ip);

        // First DNS server only; we asked for it in the parameter list.
        self.dns_server = find_option(options, OPTION_DNS)
            .filter(|v| v.len() >= 4)
            .map(|v| Ipv4Addr([v[0], v[1], v[2], v[3]]))
            .unwrap_or(self.dns_server);

        // Configured: go back to strict unicast filtering.
        net.ipv4.set_allow_unknown_unicasts(false);
        self.state = DhcpState::LeaseActive;

        info!(
            "dhcp: lease {} for {}s (gw {}, server {})",
            yiaddr, self.lease_valid_seconds, gateway, self.server_address
        );
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BOOTP frame helpers
// =============================================================================

/// Writes the fixed BOOTP header; returns the offset where options begin.
fn write_bootp_header(buf: &mut [u8; DHCP_TX_MAX], mac: [u8; 6], xid: u32, secs: u16) -> usize {
    buf.fill(0);
    buf[0] = BOOTP_OP_REQUEST;
    buf[1] = BOOTP_HTYPE_ETHERNET;
    buf[2] = 6; // hlen
    buf[4..8].copy_from_slice(&xid.to_be_bytes());
    buf[8..10].copy_from_slice(&secs.to_be_bytes());
    buf[28..34].copy_from_slice(&mac);
    buf[236..240].copy_from_slice(&MAGIC_COOKIE);
    BOOTP_HEADER_LEN
}

/// Appends one TLV option, padding first so the option starts on a 4-byte
/// boundary.  Returns the new write offset.
fn add_option(buf: &mut [u8; DHCP_TX_MAX], mut at: usize, code: u8, value: &[u8]) -> usize {
    while at % 4 != 0 {
        buf[at] = OPTION_PAD;
        at += 1;
    }
    buf[at] = code;
    buf[at + 1] = value.len() as u8;
    buf[at + 2..at + 2 + value.len()].copy_from_slice(value);
    at + 2 + value.len()
}

/// Appends the end-of-options marker.  Returns the final payload length.
fn add_end(buf: &mut [u8; DHCP_TX_MAX], mut at: usize) -> usize {
    while at % 4 != 0 {
        buf[at] = OPTION_PAD;
        at += 1;
    }
    buf[at] = OPTION_END;
    at + 1
}

/// Scans the option region for `code`, honouring pad and end markers.
fn find_option(options: &[u8], code: u8) -> Option<&[u8]> {
    let mut i = 0usize;
    while i < options.len() {
        let c = options[i];
        if c == OPTION_END {
            return None;
        }
        if c == OPTION_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            return None;
        }
        let len = options[i + 1] as usize;
        if i + 2 + len > options.len() {
            return None;
        }
        if c == code {
            return Some(&options[i + 2..i + 2 + len]);
        }
        i += 2 + len;
    }
    None
}
