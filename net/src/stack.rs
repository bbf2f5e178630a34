//! Stack wiring: protocol ownership, RX dispatch, and the tick entry
//! points.
//!
//! [`NetStack`] owns the driver and every protocol state machine and
//! splits itself into disjoint borrows for each event.  Received frames
//! are copied out of the driver buffer and released immediately, so the
//! whole dispatch chain can borrow the frame contents while reply frames
//! are acquired from the same pool.
//!
//! [`NetTx`] is the transmit-side bundle handed down to protocol code and
//! up to server callbacks: the driver plus the L2/L3 state needed to
//! resolve, build, and send packets.

use log::debug;

use crate::arp;
use crate::arp_cache::ArpCache;
use crate::config::IPV4_HEADER_SIZE;
use crate::dhcp::{DHCP_CLIENT_PORT, DhcpClient};
use crate::ethernet::EthernetProtocol;
use crate::frame::{EthernetDriver, EthernetFrame, FrameId};
use crate::icmpv4;
use crate::ipv4::Ipv4Protocol;
use crate::perf::PerfCounters;
use crate::tcp::{TcpProtocol, TcpServer};
use crate::types::{EntropySource, EtherType, Ipv4Addr, Ipv4Config, IpProtocol, MacAddr, NetError, Port};
use crate::udp::{UdpHandler, UdpOwner, UdpProtocol};

// =============================================================================
// NetTx
// =============================================================================

/// Transmit-side view of the stack: everything needed to build and send a
/// packet from any layer.
pub struct NetTx<'a, D: EthernetDriver> {
    pub driver: &'a mut D,
    pub eth: &'a EthernetProtocol,
    pub arp_cache: &'a mut ArpCache,
    pub ipv4: &'a mut Ipv4Protocol,
}

impl<'a, D: EthernetDriver> NetTx<'a, D> {
    #[inline]
    pub fn is_link_up(&self) -> bool {
        self.driver.is_link_up()
    }

    #[inline]
    pub fn our_mac(&self) -> MacAddr {
        self.eth.mac()
    }

    #[inline]
    pub fn frame(&self, id: FrameId) -> &EthernetFrame {
        self.driver.frame(id)
    }

    #[inline]
    pub fn frame_mut(&mut self, id: FrameId) -> &mut EthernetFrame {
        self.driver.frame_mut(id)
    }

    pub fn get_ipv4_tx_packet(
        &mut self,
        dest: Ipv4Addr,
        proto: IpProtocol,
    ) -> Result<FrameId, NetError> {
        self.ipv4
            .get_tx_packet(self.driver, self.eth, self.arp_cache, dest, proto)
    }

    pub fn send_ipv4_tx_packet(&mut self, id: FrameId, upper_len: usize) {
        self.ipv4.send_tx_packet(self.driver, self.eth, id, upper_len);
    }

    pub fn get_udp_tx_packet(&mut self, dest: Ipv4Addr) -> Result<FrameId, NetError> {
        UdpProtocol::get_tx_packet(self.driver, self.eth, self.arp_cache, self.ipv4, dest)
    }

    pub fn send_udp_tx_packet(
        &mut self,
        id: FrameId,
        src_port: Port,
        dst_port: Port,
        payload_len: usize,
    ) {
        UdpProtocol::send_tx_packet(
            self.driver,
            self.eth,
            self.ipv4,
            id,
            src_port,
            dst_port,
            payload_len,
        );
    }

    pub fn cancel_tx(&mut self, id: FrameId) {
        self.driver.cancel_tx_frame(id);
    }

    pub fn pseudo_sum(&self, dest: Ipv4Addr, proto: IpProtocol, upper_len: usize) -> u32 {
        self.ipv4.pseudo_header_sum(dest, proto, upper_len)
    }
}

// =============================================================================
// NetStack
// =============================================================================

pub struct NetStack<D: EthernetDriver> {
    pub driver: D,
    pub eth: EthernetProtocol,
    pub arp_cache: ArpCache,
    pub ipv4: Ipv4Protocol,
    pub udp: UdpProtocol,
    pub tcp: TcpProtocol,
    pub dhcp: DhcpClient,
    pub perf: PerfCounters,
    /// RX frames are copied here and the driver buffer released, so reply
    /// construction can draw from the pool while we parse.
    rx_copy: EthernetFrame,
    link_was_up: bool,
}

impl<D: EthernetDriver> NetStack<D> {
    pub fn new(driver: D, mac: MacAddr, config: Ipv4Config) -> Self {
        let mut udp = UdpProtocol::new();
        // The DHCP client is part of the core; its port is bound from the
        // start even when the client is left disabled.
        let _ = udp.bind(DHCP_CLIENT_PORT, UdpOwner::Dhcp);

        Self {
            driver,
            eth: EthernetProtocol::new(mac),
            arp_cache: ArpCache::new(),
            ipv4: Ipv4Protocol::new(config),
            udp,
            tcp: TcpProtocol::new(),
            dhcp: DhcpClient::new(),
            perf: PerfCounters::new(),
            rx_copy: EthernetFrame::new(),
            link_was_up: false,
        }
    }

    /// Transmit-side view over this stack's layers.
    pub fn net_tx(&mut self) -> NetTx<'_, D> {
        NetTx {
            driver: &mut self.driver,
            eth: &self.eth,
            arp_cache: &mut self.arp_cache,
            ipv4: &mut self.ipv4,
        }
    }

    // =========================================================================
    // RX poll
    // =========================================================================

    /// Fetches and processes at most one received frame.
    ///
    /// Returns `true` if a frame was processed; the host's main loop
    /// typically spins while this returns `true`.
    pub fn poll<S, U>(
        &mut self,
        tcp_server: &mut S,
        udp_handler: &mut U,
        entropy: &mut dyn EntropySource,
    ) -> bool
    where
        S: TcpServer<D>,
        U: UdpHandler<D>,
    {
        let Some(id) = self.driver.poll_rx_frame() else {
            return false;
        };

        // Copy out and release: parsing borrows the copy while replies
        // allocate from the driver pool.
        let ok = {
            let bytes = self.driver.frame(id).bytes();
            self.rx_copy.fill_from(bytes)
        };
        self.driver.release_rx_frame(id);
        if !ok {
            return true;
        }

        self.perf.rx_frames = self.perf.rx_frames.wrapping_add(1);
        self.dispatch_frame(tcp_server, udp_handler, entropy);
        true
    }

    fn dispatch_frame<S, U>(
        &mut self,
        tcp_server: &mut S,
        udp_handler: &mut U,
        entropy: &mut dyn EntropySource,
    ) where
        S: TcpServer<D>,
        U: UdpHandler<D>,
    {
        let Self {
            driver,
            eth,
            arp_cache,
            ipv4,
            udp,
            tcp,
            dhcp,
            perf,
            rx_copy,
            ..
        } = self;

        let Some(l2) = eth.parse_rx(rx_copy) else {
            perf.rx_dropped_l2 = perf.rx_dropped_l2.wrapping_add(1);
            return;
        };
        let l3 = &rx_copy.bytes()[l2.payload_offset..];

        match l2.ethertype {
            EtherType::Arp => {
                arp::on_rx_packet(driver, eth, arp_cache, ipv4.config.address, l3);
            }

            EtherType::Ipv4 => {
                let Some(rx) = ipv4.parse_rx(l3) else {
                    perf.rx_dropped_l3 = perf.rx_dropped_l3.wrapping_add(1);
                    return;
                };
                // Slice to the IP total length: Ethernet pads runt frames.
                let l4 = &l3[IPV4_HEADER_SIZE..IPV4_HEADER_SIZE + rx.upper_len];

                match IpProtocol::from_u8(rx.proto) {
                    Some(IpProtocol::Icmp) => {
                        icmpv4::on_rx_packet(driver, eth, arp_cache, ipv4, rx.src, l4);
                    }

                    Some(IpProtocol::Udp) => {
                        let Some(urx) = UdpProtocol::parse_rx(l4, rx.upper_len, rx.pseudo_sum)
                        else {
                            perf.rx_dropped_l4 = perf.rx_dropped_l4.wrapping_add(1);
                            return;
                        };
                        let payload =
                            &l4[urx.payload_off..urx.payload_off + urx.payload_len];
                        let mut net = NetTx {
                            driver,
                            eth,
                            arp_cache,
                            ipv4,
                        };
                        match udp.lookup(urx.dst_port) {
                            Some(UdpOwner::Dhcp) => {
                                dhcp.on_rx_data(
                                    &mut net,
                                    rx.src,
                                    urx.src_port,
                                    urx.dst_port,
                                    payload,
                                );
                            }
                            Some(UdpOwner::Host(tag)) => {
                                udp_handler.on_rx_data(
                                    &mut net,
                                    tag,
                                    rx.src,
                                    urx.src_port,
                                    urx.dst_port,
                                    payload,
                                );
                            }
                            None => {
                                debug!("udp: no binding for port {}", urx.dst_port);
                                perf.rx_dropped_l4 = perf.rx_dropped_l4.wrapping_add(1);
                            }
                        }
                    }

                    Some(IpProtocol::Tcp) => {
                        let mut net = NetTx {
                            driver,
                            eth,
                            arp_cache,
                            ipv4,
                        };
                        tcp.on_rx_packet(
                            &mut net,
                            tcp_server,
                            entropy,
                            rx.src,
                            l4,
                            rx.upper_len,
                            rx.pseudo_sum,
                        );
                    }

                    None => {
                        debug!("ipv4: unhandled protocol {}", rx.proto);
                        perf.rx_dropped_l3 = perf.rx_dropped_l3.wrapping_add(1);
                    }
                }
            }

            // Recognised so the drop is quiet; the stack does not carry v6.
            EtherType::Ipv6 => {}

            EtherType::Dot1q => {}
        }
    }

    // =========================================================================
    // Ticks and link state
    // =========================================================================

    /// 1 Hz housekeeping: link-state edge detection and the DHCP machine.
    pub fn on_aging_tick(&mut self, entropy: &mut dyn EntropySource) {
        let up = self.driver.is_link_up();
        if self.link_was_up && !up {
            self.on_link_down();
        } else if !self.link_was_up && up {
            self.on_link_up();
        }
        self.link_was_up = up;

        let Self {
            driver,
            eth,
            arp_cache,
            ipv4,
            dhcp,
            ..
        } = self;
        let mut net = NetTx {
            driver,
            eth,
            arp_cache,
            ipv4,
        };
        dhcp.on_aging_tick(&mut net, entropy);
    }

    /// 10 Hz hook, reserved for TCP retransmission timers.
    ///
    /// Reliability currently rests on peer retransmission (unacknowledged
    /// segments are re-sent by the remote), so there is no timer work yet.
    pub fn on_aging_tick_10x(&mut self) {}

    pub fn on_link_up(&mut self) {
        debug!("net: link up");
    }

    /// Link loss invalidates neighbours and any in-flight DHCP exchange.
    pub fn on_link_down(&mut self) {
        debug!("net: link down");
        self.arp_cache.flush();
        self.dhcp.on_link_down();
    }
}
