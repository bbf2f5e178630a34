//! embernet-net: a static, no-heap TCP/IP stack core.
//!
//! The stack is a set of protocol state machines wired together by
//! [`stack::NetStack`]: Ethernet framing, ARP with a set-associative cache,
//! IPv4 with ICMPv4 echo, UDP with a port demux table, a TCP server with a
//! hashed connection table, and a DHCPv4 client.
//!
//! # Execution model
//!
//! Single-threaded and cooperative.  The host drives three entry points:
//! [`stack::NetStack::poll`] for received frames, `on_aging_tick` at 1 Hz
//! (DHCP, future cache aging) and `on_aging_tick_10x` at 10 Hz (reserved
//! for TCP timers).  No protocol code blocks, allocates, or locks; every
//! table is a fixed array owned by its protocol struct, and table entries
//! are addressed by index.
//!
//! # Buffer ownership
//!
//! Frame buffers belong to the [`frame::EthernetDriver`] free-lists.  A
//! frame is loaned to the stack between `acquire`/`poll` and the matching
//! `send`/`cancel`/`release`, and is owned by exactly one layer at a time.

#![cfg_attr(not(test), no_std)]

pub mod arp;
pub mod arp_cache;
pub mod checksum;
pub mod config;
pub mod dhcp;
pub mod ethernet;
pub mod frame;
pub mod icmpv4;
pub mod ipv4;
pub mod perf;
pub mod stack;
pub mod tcp;
pub mod testutil;
pub mod types;
pub mod udp;

#[cfg(test)]
mod arp_cache_tests;

pub use frame::{EthernetDriver, EthernetFrame, FrameId};
pub use stack::{NetStack, NetTx};
pub use types::{EntropySource, Ipv4Addr, Ipv4Config, MacAddr, NetError, Port};
