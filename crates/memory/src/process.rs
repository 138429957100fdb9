//! Remote process access trait
//!
//! Everything the hook engine does to the target process goes through
//! [`RemoteProcess`]: raw reads and writes, executable region allocation,
//! page protection changes and instruction cache flushes. The engine never
//! touches its own address space, so the whole stack can be exercised
//! against the in-memory [`FakeProcess`](crate::FakeProcess) double.

use bitflags::bitflags;

use crate::error::MemoryResult;

bitflags! {
    /// Page protection for allocated or patched regions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl Protection {
    /// Read + write, for data channels
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Read + write + execute, for trampoline regions and live patching
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// Read + execute, typical protection of a code page at rest
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
}

/// Access to an external process's memory.
///
/// Implementations treat every call as blocking I/O; callers must not hold
/// locks across them. Addresses are in the *target* process's address space.
pub trait RemoteProcess {
    /// Read exactly `buf.len()` bytes starting at `addr`.
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> MemoryResult<()>;

    /// Write all of `data` starting at `addr`.
    fn write_bytes(&self, addr: usize, data: &[u8]) -> MemoryResult<()>;

    /// Allocate a zero-initialized region of at least `len` bytes.
    ///
    /// `near` is a placement hint: when `Some`, the implementation should
    /// try to place the region within rel32 reach (±2 GiB) of that address
    /// so relative jumps into it can be encoded. The hint is best-effort;
    /// callers verify reach themselves.
    fn alloc(&self, len: usize, prot: Protection, near: Option<usize>) -> MemoryResult<usize>;

    /// Free a region previously returned by [`alloc`](Self::alloc).
    fn free(&self, addr: usize) -> MemoryResult<()>;

    /// Change protection on `[addr, addr + len)`, returning the prior protection.
    fn protect(&self, addr: usize, len: usize, prot: Protection) -> MemoryResult<Protection>;

    /// Flush the instruction cache over a patched range.
    ///
    /// A no-op on architectures/backends with coherent icaches; still called
    /// after every code patch.
    fn flush_instruction_cache(&self, addr: usize, len: usize) -> MemoryResult<()>;

    /// Read a `u32` at `addr`.
    fn read_u32(&self, addr: usize) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a `u64` at `addr`.
    fn read_u64(&self, addr: usize) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read an `f32` at `addr`.
    fn read_f32(&self, addr: usize) -> MemoryResult<f32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Read a pointer-sized value at `addr`.
    fn read_ptr(&self, addr: usize) -> MemoryResult<usize> {
        Ok(self.read_u64(addr)? as usize)
    }

    /// Write a `u32` at `addr`.
    fn write_u32(&self, addr: usize, value: u32) -> MemoryResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a `u64` at `addr`.
    fn write_u64(&self, addr: usize, value: u64) -> MemoryResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }
}

/// Validate that an address looks like something worth dereferencing.
///
/// Raw captured words are filtered against this before any transform runs:
/// zero and the first 64 KiB (null page and friends) are never plausible.
pub const MIN_PLAUSIBLE_ADDR: u64 = 0x1_0000;

/// Returns `true` if `raw` is worth handing to a transform callback.
pub fn plausible_address(raw: u64, min_addr: u64) -> bool {
    raw != 0 && raw >= min_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_composites() {
        assert!(Protection::RWX.contains(Protection::WRITE));
        assert!(Protection::RX.contains(Protection::EXECUTE));
        assert!(!Protection::RW.contains(Protection::EXECUTE));
    }

    #[test]
    fn test_plausible_address_filter() {
        assert!(!plausible_address(0, MIN_PLAUSIBLE_ADDR));
        assert!(!plausible_address(0xFF00, MIN_PLAUSIBLE_ADDR));
        assert!(plausible_address(0x7FFF_0000_0000, MIN_PLAUSIBLE_ADDR));
    }
}
