//! Receive-path performance counters.
//!
//! Cheap always-on u32 counters, bumped once per frame on the poll path.
//! Wraparound is acceptable; these exist for field diagnostics, not
//! accounting.

#[derive(Clone, Copy, Default, Debug)]
pub struct PerfCounters {
    /// Frames handed to the stack by the driver.
    pub rx_frames: u32,
    /// Dropped at L2: wrong destination, runt, LLC, unknown EtherType.
    pub rx_dropped_l2: u32,
    /// Dropped at L3: bad header, checksum, or address class.
    pub rx_dropped_l3: u32,
    /// Dropped at L4: bad checksum, unbound port.
    pub rx_dropped_l4: u32,
}

impl PerfCounters {
    pub const fn new() -> Self {
        Self {
            rx_frames: 0,
            rx_dropped_l2: 0,
            rx_dropped_l3: 0,
            rx_dropped_l4: 0,
        }
    }
}
