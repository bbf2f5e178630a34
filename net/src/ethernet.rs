//! Ethernet II layer: RX classification and TX header construction.
//!
//! RX accepts frames addressed to our unicast MAC or to any multicast
//! address, strips at most one 802.1Q tag (tag contents are otherwise
//! ignored), drops LLC traffic, and hands the inner EtherType plus payload
//! offset to the dispatcher.  TX fills the L2 header and pads short frames
//! to the 60-byte wire minimum.

use log::debug;

use crate::config::{
    ETHERNET_DOT1Q_SIZE, ETHERNET_FRAME_MIN, ETHERNET_HEADER_SIZE, ETHERNET_MAC_SIZE,
};
use crate::frame::{EthernetDriver, EthernetFrame, FrameId};
use crate::types::{EtherType, MacAddr};

/// Outcome of L2 RX classification.
pub struct EthernetRx {
    pub ethertype: EtherType,
    /// Byte offset of the L3 payload within the frame (14, or 18 if tagged).
    pub payload_offset: usize,
}

/// Ethernet protocol state: our station address.
pub struct EthernetProtocol {
    mac: MacAddr,
}

impl EthernetProtocol {
    pub const fn new(mac: MacAddr) -> Self {
        Self { mac }
    }

    #[inline]
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    // =========================================================================
    // RX
    // =========================================================================

    /// Classifies a received frame.
    ///
    /// Returns `None` (drop) for runts, frames addressed elsewhere, LLC
    /// traffic, and EtherTypes the stack does not carry.
    pub fn parse_rx(&self, frame: &EthernetFrame) -> Option<EthernetRx> {
        let data = frame.bytes();
        if data.len() < ETHERNET_HEADER_SIZE {
            debug!("eth: runt frame ({} bytes)", data.len());
            return None;
        }

        let dst = MacAddr([data[0], data[1], data[2], data[3], data[4], data[5]]);
        if dst != self.mac && !dst.is_multicast() {
            return None;
        }

        let outer = u16::from_be_bytes([data[12], data[13]]);
        let (raw_type, payload_offset) = if outer == EtherType::Dot1q.as_u16() {
            // Single 802.1Q tag: EtherType moves past the 4-byte tag.
            if data.len() < ETHERNET_HEADER_SIZE + ETHERNET_DOT1Q_SIZE {
                debug!("eth: truncated 802.1q tag");
                return None;
            }
            (
                u16::from_be_bytes([data[16], data[17]]),
                ETHERNET_HEADER_SIZE + ETHERNET_DOT1Q_SIZE,
            )
        } else {
            (outer, ETHERNET_HEADER_SIZE)
        };

        // EtherType values at or below 1500 are 802.3 length fields (LLC).
        if raw_type <= 1500 {
            debug!("eth: LLC frame, ignoring");
            return None;
        }

        let ethertype = match EtherType::from_u16(raw_type) {
            // A second tag would parse as Dot1q here; no QinQ support.
            Some(EtherType::Dot1q) | None => {
                debug!("eth: unhandled ethertype 0x{:04x}", raw_type);
                return None;
            }
            Some(t) => t,
        };

        Some(EthernetRx {
            ethertype,
            payload_offset,
        })
    }

    // =========================================================================
    // TX
    // =========================================================================

    /// Acquires a TX frame with the L2 header filled in.
    ///
    /// The caller builds its payload starting at
    /// [`ETHERNET_HEADER_SIZE`]; TX frames are always emitted untagged.
    pub fn get_tx_frame<D: EthernetDriver>(
        &self,
        driver: &mut D,
        dst: MacAddr,
        ethertype: EtherType,
    ) -> Option<FrameId> {
        let id = driver.acquire_tx_frame()?;
        let data = driver.frame_mut(id).bytes_mut();
        data[0..ETHERNET_MAC_SIZE].copy_from_slice(dst.as_bytes());
        data[ETHERNET_MAC_SIZE..2 * ETHERNET_MAC_SIZE].copy_from_slice(self.mac.as_bytes());
        data[12..14].copy_from_slice(&ethertype.as_u16().to_be_bytes());
        Some(id)
    }

    /// Finalises and transmits a frame carrying `payload_len` L3 bytes.
    ///
    /// Short frames are padded to the 60-byte minimum; the pad bytes are
    /// zero because pool buffers are zeroised between uses.
    pub fn send_tx_frame<D: EthernetDriver>(&self, driver: &mut D, id: FrameId, payload_len: usize) {
        let frame = driver.frame_mut(id);
        frame.set_payload_length(payload_len);
        if frame.length() < ETHERNET_FRAME_MIN {
            frame.set_length(ETHERNET_FRAME_MIN);
        }
        driver.send_tx_frame(id);
    }

    /// Abandons a previously acquired TX frame.
    pub fn cancel_tx_frame<D: EthernetDriver>(&self, driver: &mut D, id: FrameId) {
        driver.cancel_tx_frame(id);
    }
}
