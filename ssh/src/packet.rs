//! Transport packet framing (RFC 4253 §6).
//!
//! On the wire every packet is
//! `{u32 length, u8 padding_length, u8 type, payload, padding, [tag]}`
//! where `length` counts from `padding_length` through the last padding
//! byte.  Before keys are active the length word is included in the
//! 8-byte alignment; once GCM is running the length word is associated
//! data (neither encrypted nor counted) and the protected region aligns
//! to the 16-byte cipher block, per RFC 5647.

use embernet_crypto::GCM_TAG_SIZE;

pub const SSH_MSG_DISCONNECT: u8 = 1;
pub const SSH_MSG_IGNORE: u8 = 2;
pub const SSH_MSG_SERVICE_REQUEST: u8 = 5;
pub const SSH_MSG_SERVICE_ACCEPT: u8 = 6;
pub const SSH_MSG_KEXINIT: u8 = 20;
pub const SSH_MSG_NEWKEYS: u8 = 21;
pub const SSH_MSG_KEX_ECDH_INIT: u8 = 30;
pub const SSH_MSG_KEX_ECDH_REPLY: u8 = 31;
pub const SSH_MSG_USERAUTH_REQUEST: u8 = 50;
pub const SSH_MSG_USERAUTH_FAILURE: u8 = 51;
pub const SSH_MSG_USERAUTH_SUCCESS: u8 = 52;
pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;
pub const SSH_MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const SSH_MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const SSH_MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const SSH_MSG_CHANNEL_DATA: u8 = 94;
pub const SSH_MSG_CHANNEL_EOF: u8 = 96;
pub const SSH_MSG_CHANNEL_CLOSE: u8 = 97;
pub const SSH_MSG_CHANNEL_REQUEST: u8 = 98;
pub const SSH_MSG_CHANNEL_SUCCESS: u8 = 99;
pub const SSH_MSG_CHANNEL_FAILURE: u8 = 100;

/// DISCONNECT reason: protocol error.
pub const SSH_DISCONNECT_PROTOCOL_ERROR: u32 = 2;

/// Minimum padding required by the RFC.
pub const MIN_PADDING: usize = 4;

/// Padding length for a payload (type byte included) of `payload_len`.
pub fn padding_for(payload_len: usize, encrypted: bool) -> usize {
    let (block, fixed) = if encrypted {
        // Length word excluded: it is AAD, not ciphertext.
        (16, 1 + payload_len)
    } else {
        (8, 4 + 1 + payload_len)
    };
    let mut pad = MIN_PADDING;
    while (fixed + pad) % block != 0 {
        pad += 1;
    }
    pad
}

/// Total wire bytes for a payload of `payload_len`.
pub fn wire_size(payload_len: usize, encrypted: bool) -> usize {
    let pad = padding_for(payload_len, encrypted);
    4 + 1 + payload_len + pad + if encrypted { GCM_TAG_SIZE } else { 0 }
}

/// Fills `out` with a complete packet around `payload` (which must start
/// with the message type byte).  `random_padding` supplies the pad bytes.
/// Returns the wire length written, excluding any tag space.
pub fn frame_packet(
    out: &mut [u8],
    payload: &[u8],
    encrypted: bool,
    random_padding: &mut dyn FnMut(&mut [u8]),
) -> Option<usize> {
    let pad = padding_for(payload.len(), encrypted);
    let packet_length = 1 + payload.len() + pad;
    let wire = 4 + packet_length;
    if out.len() < wire {
        return None;
    }

    out[0..4].copy_from_slice(&(packet_length as u32).to_be_bytes());
    out[4] = pad as u8;
    out[5..5 + payload.len()].copy_from_slice(payload);
    random_padding(&mut out[5 + payload.len()..wire]);
    Some(wire)
}
