//! In-memory driver for the test suites.
//!
//! [`SimDriver`] plays the role a TAP interface plays for firmware bring-up:
//! tests inject raw wire bytes as received frames and capture everything the
//! stack transmits.  It honours the same free-list handoff contract as a
//! real driver, so buffer-exhaustion paths are testable by shrinking the
//! pool.

use crate::frame::{EthernetDriver, EthernetFrame, FrameId, FramePool};
use crate::stack::NetTx;
use crate::tcp::{SocketId, TcpApi, TcpServer};
use crate::types::{EntropySource, Ipv4Addr, Port};
use crate::udp::UdpHandler;

const SIM_POOL_FRAMES: usize = 16;
const SIM_QUEUE_DEPTH: usize = 16;

/// Software frame source/sink implementing [`EthernetDriver`].
pub struct SimDriver {
    pool: FramePool<SIM_POOL_FRAMES>,
    rx_queue: [Option<FrameId>; SIM_QUEUE_DEPTH],
    rx_len: usize,
    tx_log: [Option<FrameId>; SIM_QUEUE_DEPTH],
    tx_len: usize,
    link_up: bool,
    /// When set, `acquire_tx_frame` fails — simulates pool exhaustion.
    pub refuse_tx: bool,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            pool: FramePool::new(),
            rx_queue: [None; SIM_QUEUE_DEPTH],
            rx_len: 0,
            tx_log: [None; SIM_QUEUE_DEPTH],
            tx_len: 0,
            link_up: true,
            refuse_tx: false,
        }
    }

    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }

    /// Queues raw wire bytes as a received frame.
    ///
    /// Returns `false` if the pool or queue is full.
    pub fn inject_rx(&mut self, data: &[u8]) -> bool {
        if self.rx_len == SIM_QUEUE_DEPTH {
            return false;
        }
        let Some(id) = self.pool.alloc() else {
            return false;
        };
        if !self.pool.frame_mut(id).fill_from(data) {
            self.pool.release(id);
            return false;
        }
        self.rx_queue[self.rx_len] = Some(id);
        self.rx_len += 1;
        true
    }

    /// Number of transmitted frames waiting to be read by the test.
    pub fn sent_count(&self) -> usize {
        self.tx_len
    }

    /// Removes the oldest transmitted frame, copying its wire bytes into
    /// `out`.  Returns the frame length.
    pub fn take_sent_into(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.tx_len == 0 {
            return None;
        }
        let id = self.tx_log[0].take().expect("tx log entry present");
        self.tx_log.rotate_left(1);
        self.tx_len -= 1;
        let bytes = self.pool.frame(id).bytes();
        let len = bytes.len().min(out.len());
        out[..len].copy_from_slice(&bytes[..len]);
        self.pool.release(id);
        Some(len)
    }

    /// Drops any captured TX frames.
    pub fn clear_sent(&mut self) {
        let mut sink = [0u8; 0];
        while self.tx_len > 0 {
            let _ = self.take_sent_into(&mut sink);
        }
    }

    /// Free pool slots (diagnostic; a leak shows up as a shrinking value).
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Null upper layers and fixed entropy
// =============================================================================

/// Entropy source that replays a fixed sequence, for deterministic tests.
pub struct FixedEntropy(pub u32);

impl EntropySource for FixedEntropy {
    fn next_u32(&mut self) -> u32 {
        self.0
    }
}

/// TCP server that accepts everything and discards delivered data.
pub struct NullTcpServer;

impl<D: EthernetDriver> TcpServer<D> for NullTcpServer {
    fn on_rx_data(&mut self, _tcp: &mut TcpApi<'_, '_, D>, _sock: SocketId, _data: &[u8]) -> bool {
        true
    }
}

/// UDP handler that drops everything.
pub struct NullUdpHandler;

impl<D: EthernetDriver> UdpHandler<D> for NullUdpHandler {
    fn on_rx_data(
        &mut self,
        _net: &mut NetTx<'_, D>,
        _tag: u8,
        _src: Ipv4Addr,
        _src_port: Port,
        _dst_port: Port,
        _payload: &[u8],
    ) {
    }
}

impl EthernetDriver for SimDriver {
    fn acquire_tx_frame(&mut self) -> Option<FrameId> {
        if self.refuse_tx {
            return None;
        }
        self.pool.alloc()
    }

    fn send_tx_frame(&mut self, id: FrameId) {
        if self.tx_len == SIM_QUEUE_DEPTH {
            // Queue overflow: drop the frame like a saturated NIC would.
            self.pool.release(id);
            return;
        }
        self.tx_log[self.tx_len] = Some(id);
        self.tx_len += 1;
    }

    fn cancel_tx_frame(&mut self, id: FrameId) {
        self.pool.release(id);
    }

    fn poll_rx_frame(&mut self) -> Option<FrameId> {
        if self.rx_len == 0 {
            return None;
        }
        let id = self.rx_queue[0].take().expect("rx queue entry present");
        self.rx_queue.rotate_left(1);
        self.rx_len -= 1;
        Some(id)
    }

    fn release_rx_frame(&mut self, id: FrameId) {
        self.pool.release(id);
    }

    fn frame(&self, id: FrameId) -> &EthernetFrame {
        self.pool.frame(id)
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut EthernetFrame {
        self.pool.frame_mut(id)
    }

    fn is_link_up(&self) -> bool {
        self.link_up
    }
}
