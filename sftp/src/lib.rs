//! embernet-sftp: a minimal SFTP server subsystem.
//!
//! Speaks protocol version 6 or lower (draft-ietf-secsh-filexfer-13,
//! server side, minimal profile) over an SSH session channel.  Supported
//! requests: INIT, STAT/LSTAT, OPEN, CLOSE, FSETSTAT (accepted as a
//! no-op), and WRITE in "huge packet" mode — a packet too large for the
//! reassembly FIFO is streamed through the filesystem adapter in chunks
//! instead of being buffered.  Everything else earns
//! `SSH_FX_OP_UNSUPPORTED`.
//!
//! The filesystem itself lives behind [`fs::SftpFilesystem`]; the server
//! knows nothing about storage.

#![cfg_attr(not(test), no_std)]

pub mod fs;
pub mod server;

pub use fs::{SftpAccess, SftpFilesystem, SftpOpenFlags};
pub use server::{SessionOutput, SftpServer};

/// Per-connection packet reassembly buffer.  A packet whose declared
/// length reaches this size switches the connection into huge-packet
/// streaming.
pub const SFTP_RX_BUFFER_SIZE: usize = 2048;
