//! Filesystem adapter boundary.
//!
//! The host supplies the storage — a flash filesystem, a firmware update
//! region, a RAM staging buffer.  Handles are opaque 32-bit values chosen
//! by the adapter; the server never interprets them.
//!
//! OPEN requests carry two 32-bit words, typed here so adapters match on
//! named bits instead of magic numbers.  A version ≤ 5 client sends a
//! single pflags word, which lands in [`SftpAccess`] unchanged; unknown
//! bits are retained either way so the adapter sees exactly what was on
//! the wire.

use bitflags::bitflags;

bitflags! {
    /// ACE4-style desired-access mask from an OPEN request (the subset a
    /// small device store acts on).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SftpAccess: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;

        const _ = !0;
    }
}

bitflags! {
    /// `SSH_FXF_*` open flags.  The low three bits are the access
    /// disposition (create/truncate/open-existing), exposed through
    /// [`ACCESS_DISPOSITION`](Self::ACCESS_DISPOSITION).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SftpOpenFlags: u32 {
        const ACCESS_DISPOSITION = 0x0000_0007;
        const APPEND_DATA = 0x0000_0008;
        const APPEND_DATA_ATOMIC = 0x0000_0010;
        const TEXT_MODE = 0x0000_0020;
        const BLOCK_READ = 0x0000_0040;
        const BLOCK_WRITE = 0x0000_0080;
        const BLOCK_DELETE = 0x0000_0100;

        const _ = !0;
    }
}

pub trait SftpFilesystem {
    fn file_exists(&mut self, path: &[u8]) -> bool;

    /// Policy check before [`open`](Self::open); a refusal maps to
    /// `SSH_FX_PERMISSION_DENIED`.
    fn can_open(&mut self, path: &[u8], desired_access: SftpAccess, flags: SftpOpenFlags) -> bool;

    /// Opens a file and returns its handle, or `None` on failure.
    fn open(&mut self, path: &[u8], desired_access: SftpAccess, flags: SftpOpenFlags)
    -> Option<u32>;

    /// Writes `data` at `offset`.  Huge-packet streaming may deliver one
    /// logical WRITE as several calls with advancing offsets.
    fn write(&mut self, handle: u32, offset: u64, data: &[u8]) -> bool;

    fn close(&mut self, handle: u32) -> bool;
}
