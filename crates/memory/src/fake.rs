//! In-memory fake of a remote process
//!
//! Backs the engine's tests: a flat arena standing in for the target's
//! address space, an allocation ledger so leak checks can assert that
//! rollback freed everything, and failure injection for the write/alloc/
//! protect paths. Writes are not protection-checked; the double verifies
//! protocol, not hardware.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{MemoryError, MemoryResult};
use crate::process::{Protection, RemoteProcess};

/// Base address of the fake address space.
///
/// Chosen well above [`MIN_PLAUSIBLE_ADDR`](crate::MIN_PLAUSIBLE_ADDR) so
/// pointers into the arena survive the poller's plausibility filter.
pub const FAKE_BASE: usize = 0x5000_0000;

/// Size of the fake address space (1 MiB)
const FAKE_SPACE: usize = 0x10_0000;

/// Offset within the arena where allocations start; everything below is
/// free for fixtures (fake code pages, fake entity structs).
const ALLOC_WATERMARK: usize = 0x8_0000;

struct FakeInner {
    mem: Vec<u8>,
    /// Bump offset for the next allocation
    next_alloc: usize,
    /// Outstanding allocations, addr -> len
    allocations: HashMap<usize, usize>,
    /// Every protect() call, in order: (addr, len, requested)
    protect_log: Vec<(usize, usize, Protection)>,
    fail_next_alloc: bool,
    /// Writes touching this address fail
    fail_writes_at: Option<usize>,
    fail_reads: bool,
    unavailable: bool,
}

/// Fake remote process for tests
pub struct FakeProcess {
    inner: Mutex<FakeInner>,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner {
                mem: vec![0u8; FAKE_SPACE],
                next_alloc: ALLOC_WATERMARK,
                allocations: HashMap::new(),
                protect_log: Vec::new(),
                fail_next_alloc: false,
                fail_writes_at: None,
                fail_reads: false,
                unavailable: false,
            }),
        }
    }

    /// Number of regions allocated and not yet freed
    pub fn outstanding_allocations(&self) -> usize {
        self.inner.lock().allocations.len()
    }

    /// Make the next `alloc` call fail
    pub fn fail_next_alloc(&self) {
        self.inner.lock().fail_next_alloc = true;
    }

    /// Make any write touching `addr` fail
    pub fn fail_writes_at(&self, addr: usize) {
        self.inner.lock().fail_writes_at = Some(addr);
    }

    /// Clear write failure injection
    pub fn clear_write_failures(&self) {
        self.inner.lock().fail_writes_at = None;
    }

    /// Make every read fail, simulating a temporarily unreadable target
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Simulate the target exiting: every subsequent call fails
    pub fn set_unavailable(&self) {
        self.inner.lock().unavailable = true;
    }

    /// Protection changes observed so far
    pub fn protect_log(&self) -> Vec<(usize, usize, Protection)> {
        self.inner.lock().protect_log.clone()
    }

    fn check_range(mem_len: usize, addr: usize, len: usize) -> MemoryResult<usize> {
        let offset = addr.wrapping_sub(FAKE_BASE);
        if addr < FAKE_BASE || offset.saturating_add(len) > mem_len {
            return Err(MemoryError::Read {
                addr,
                len,
                reason: "outside fake address space".into(),
            });
        }
        Ok(offset)
    }
}

impl RemoteProcess for FakeProcess {
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> MemoryResult<()> {
        let inner = self.inner.lock();
        if inner.unavailable {
            return Err(MemoryError::TargetUnavailable);
        }
        if inner.fail_reads {
            return Err(MemoryError::Read {
                addr,
                len: buf.len(),
                reason: "injected read failure".into(),
            });
        }
        let offset = Self::check_range(inner.mem.len(), addr, buf.len())?;
        buf.copy_from_slice(&inner.mem[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, addr: usize, data: &[u8]) -> MemoryResult<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(MemoryError::TargetUnavailable);
        }
        if let Some(poison) = inner.fail_writes_at {
            if addr <= poison && poison < addr + data.len() {
                return Err(MemoryError::Write {
                    addr,
                    len: data.len(),
                    reason: "injected write failure".into(),
                });
            }
        }
        let offset = Self::check_range(inner.mem.len(), addr, data.len()).map_err(|_| {
            MemoryError::Write {
                addr,
                len: data.len(),
                reason: "outside fake address space".into(),
            }
        })?;
        inner.mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn alloc(&self, len: usize, _prot: Protection, _near: Option<usize>) -> MemoryResult<usize> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(MemoryError::TargetUnavailable);
        }
        if inner.fail_next_alloc {
            inner.fail_next_alloc = false;
            return Err(MemoryError::Allocation {
                len,
                reason: "injected allocation failure".into(),
            });
        }
        // 16-byte aligned bump allocation; the arena is never reused within
        // one test, so freed addresses stay dead.
        let offset = (inner.next_alloc + 15) & !15;
        if offset + len > inner.mem.len() {
            return Err(MemoryError::Allocation {
                len,
                reason: "fake address space exhausted".into(),
            });
        }
        inner.next_alloc = offset + len;
        inner.mem[offset..offset + len].fill(0);
        let addr = FAKE_BASE + offset;
        inner.allocations.insert(addr, len);
        Ok(addr)
    }

    fn free(&self, addr: usize) -> MemoryResult<()> {
        let mut inner = self.inner.lock();
        if inner.allocations.remove(&addr).is_none() {
            return Err(MemoryError::Allocation {
                len: 0,
                reason: format!("free of unallocated address {addr:x}"),
            });
        }
        Ok(())
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> MemoryResult<Protection> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(MemoryError::TargetUnavailable);
        }
        inner.protect_log.push((addr, len, prot));
        // The double does not model per-page state; report code-at-rest
        // protection as the prior value.
        Ok(Protection::RX)
    }

    fn flush_instruction_cache(&self, _addr: usize, _len: usize) -> MemoryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let fake = FakeProcess::new();
        fake.write_bytes(FAKE_BASE + 0x100, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        fake.read_bytes(FAKE_BASE + 0x100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_alloc_ledger_tracks_outstanding() {
        let fake = FakeProcess::new();
        let a = fake.alloc(64, Protection::RW, None).unwrap();
        let b = fake.alloc(64, Protection::RWX, Some(a)).unwrap();
        assert_ne!(a, b);
        assert_eq!(fake.outstanding_allocations(), 2);
        fake.free(a).unwrap();
        fake.free(b).unwrap();
        assert_eq!(fake.outstanding_allocations(), 0);
        assert!(fake.free(a).is_err());
    }

    #[test]
    fn test_alloc_zero_initialized() {
        let fake = FakeProcess::new();
        let addr = fake.alloc(32, Protection::RW, None).unwrap();
        let mut buf = [0xAAu8; 32];
        fake.read_bytes(addr, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_injected_write_failure() {
        let fake = FakeProcess::new();
        fake.fail_writes_at(FAKE_BASE + 0x202);
        // Range not touching the poisoned byte still works
        fake.write_bytes(FAKE_BASE + 0x400, &[1]).unwrap();
        let err = fake.write_bytes(FAKE_BASE + 0x200, &[0; 8]).unwrap_err();
        assert!(matches!(err, MemoryError::Write { .. }));
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let fake = FakeProcess::new();
        let mut buf = [0u8; 4];
        assert!(fake.read_bytes(0x10, &mut buf).is_err());
        assert!(fake.write_bytes(FAKE_BASE + FAKE_SPACE, &[0]).is_err());
    }

    #[test]
    fn test_unavailable_target() {
        let fake = FakeProcess::new();
        fake.set_unavailable();
        let err = fake.alloc(16, Protection::RW, None).unwrap_err();
        assert!(matches!(err, MemoryError::TargetUnavailable));
    }
}
