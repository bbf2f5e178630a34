//! Compile-time stack geometry.
//!
//! Table shapes and buffer sizes for the whole stack.  These mirror the
//! footprint of the reference hardware target; hosts with more RAM can
//! raise them, but every value here is a hard cap — nothing grows at
//! runtime.

// =============================================================================
// Ethernet
// =============================================================================

/// Maximum Ethernet payload (bytes after the L2 header, before FCS).
pub const ETHERNET_PAYLOAD_MTU: usize = 1500;

/// L2 header: two MACs plus the EtherType.
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Size of one 802.1Q tag (TPID + TCI).
pub const ETHERNET_DOT1Q_SIZE: usize = 4;

pub const ETHERNET_MAC_SIZE: usize = 6;

/// Backing storage per frame: header + optional tag + MTU.
pub const ETHERNET_BUFFER_SIZE: usize =
    ETHERNET_HEADER_SIZE + ETHERNET_DOT1Q_SIZE + ETHERNET_PAYLOAD_MTU;

/// Minimum frame length on the wire (before FCS); shorter TX frames are
/// zero-padded up to this.
pub const ETHERNET_FRAME_MIN: usize = 60;

// =============================================================================
// ARP cache
// =============================================================================

/// Ways of associativity in the ARP cache.
pub const ARP_CACHE_WAYS: usize = 4;

/// Lines per way in the ARP cache.
pub const ARP_CACHE_LINES: usize = 256;

// =============================================================================
// IPv4 / upper layer MTUs
// =============================================================================

pub const IPV4_HEADER_SIZE: usize = 20;

/// Maximum IPv4 payload per frame (no fragmentation support).
pub const IPV4_PAYLOAD_MTU: usize = ETHERNET_PAYLOAD_MTU - IPV4_HEADER_SIZE;

pub const TCP_HEADER_SIZE: usize = 20;

/// Maximum TCP payload per segment; also the advertised receive window.
pub const TCP_IPV4_PAYLOAD_MTU: usize = IPV4_PAYLOAD_MTU - TCP_HEADER_SIZE;

pub const UDP_HEADER_SIZE: usize = 8;

// =============================================================================
// TCP socket table
// =============================================================================

/// Ways of associativity in the TCP socket table.
pub const TCP_TABLE_WAYS: usize = 2;

/// Lines per way in the TCP socket table.
pub const TCP_TABLE_LINES: usize = 16;

/// Maximum number of simultaneously open listening ports.
pub const TCP_MAX_OPEN_PORTS: usize = 8;

// =============================================================================
// UDP demux
// =============================================================================

/// Maximum number of bound UDP ports.
pub const UDP_MAX_BINDINGS: usize = 8;
