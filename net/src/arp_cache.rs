//! Set-associative ARP cache.
//!
//! 4 ways × 256 lines by default.  The line is selected by FNV-1 over the
//! four address octets; all ways of a line are searched on lookup.  Inserts
//! update an existing binding in place, otherwise take the first free way;
//! when every way of a line is occupied, a round-robin victim (tracked
//! across the whole cache by `next_way_to_evict`) is overwritten.
//!
//! Entries do not age out: a stale binding is corrected by the next ARP
//! reply from the moved host, which updates in place.

use log::trace;

use crate::config::{ARP_CACHE_LINES, ARP_CACHE_WAYS};
use crate::types::{Ipv4Addr, MacAddr};
use embernet_lib::fnv1_32;

#[derive(Clone, Copy, Default)]
struct ArpCacheEntry {
    valid: bool,
    ip: Ipv4Addr,
    mac: MacAddr,
}

pub struct ArpCache {
    ways: [[ArpCacheEntry; ARP_CACHE_LINES]; ARP_CACHE_WAYS],
    next_way_to_evict: usize,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            ways: [[ArpCacheEntry {
                valid: false,
                ip: Ipv4Addr([0; 4]),
                mac: MacAddr([0; 6]),
            }; ARP_CACHE_LINES]; ARP_CACHE_WAYS],
            next_way_to_evict: 0,
        }
    }

    #[inline]
    fn line(ip: Ipv4Addr) -> usize {
        fnv1_32(ip.as_bytes()) as usize % ARP_CACHE_LINES
    }

    /// Looks up the MAC bound to `ip`, scanning every way of its line.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let line = Self::line(ip);
        for way in &self.ways {
            let row = &way[line];
            if row.valid && row.ip == ip {
                return Some(row.mac);
            }
        }
        None
    }

    /// Inserts or updates the binding `ip -> mac`.
    ///
    /// Re-inserting a cached address is a legal no-op (the MAC is
    /// refreshed in place).
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        let line = Self::line(ip);

        // Update in place on hit; remember the first empty way otherwise.
        let mut empty_way = None;
        for (w, way) in self.ways.iter_mut().enumerate() {
            let row = &mut way[line];
            if row.valid {
                if row.ip == ip {
                    row.mac = mac;
                    return;
                }
            } else if empty_way.is_none() {
                empty_way = Some(w);
            }
        }

        let way = match empty_way {
            Some(w) => w,
            None => {
                // Line full: overwrite the round-robin victim.
                let w = self.next_way_to_evict;
                self.next_way_to_evict = (self.next_way_to_evict + 1) % ARP_CACHE_WAYS;
                w
            }
        };

        trace!("arp: cache {} -> {} (way {})", ip, mac, way);
        self.ways[way][line] = ArpCacheEntry {
            valid: true,
            ip,
            mac,
        };
    }

    /// Drops every cached binding.
    pub fn flush(&mut self) {
        for way in &mut self.ways {
            for row in way.iter_mut() {
                row.valid = false;
            }
        }
        self.next_way_to_evict = 0;
    }

    /// Number of valid entries (diagnostic).
    pub fn entry_count(&self) -> usize {
        self.ways
            .iter()
            .flat_map(|w| w.iter())
            .filter(|e| e.valid)
            .count()
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}
