//! 32-bit FNV-1 hashing for table bucket selection.
//!
//! Simple and well-mixed; used by the ARP cache and the TCP socket table
//! to pick a line within a set-associative array.

pub const FNV_INITIAL: u32 = 0x811c_9dc5;
pub const FNV_MULT: u32 = 0x0100_0193;

/// Hashes a byte slice with 32-bit FNV-1 (multiply, then xor).
pub fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash = FNV_INITIAL;
    for &b in data {
        hash = hash.wrapping_mul(FNV_MULT) ^ (b as u32);
    }
    hash
}
