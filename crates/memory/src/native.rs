//! Windows remote-process backend
//!
//! Implements [`RemoteProcess`] over the Win32 debug/memory APIs. This is
//! the only real backend; the engine is otherwise exercised through
//! [`FakeProcess`](crate::FakeProcess).

use std::ffi::c_void;

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, ReadProcessMemory, WriteProcessMemory,
};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
    PROCESS_VM_WRITE,
};

use crate::error::{MemoryError, MemoryResult};
use crate::process::{Protection, RemoteProcess};

/// Maximum distance for placement hints (rel32 reach minus slack)
const NEAR_RANGE: usize = 0x7FFF_0000;

/// Hint step when scanning for a nearby free region
const NEAR_STEP: usize = 0x10_0000;

/// A handle to a live external process
pub struct WinProcess {
    handle: HANDLE,
}

// SAFETY: the handle is only used through Win32 calls that are documented
// thread-safe for process handles.
unsafe impl Send for WinProcess {}
unsafe impl Sync for WinProcess {}

impl WinProcess {
    /// Open a process by pid with the access rights the engine needs
    pub fn open(pid: u32) -> MemoryResult<Self> {
        let access = PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_VM_OPERATION
            | PROCESS_QUERY_INFORMATION;
        let handle = unsafe { OpenProcess(access, false, pid) }
            .map_err(|_| MemoryError::TargetUnavailable)?;
        tracing::debug!("opened process {} -> handle {:?}", pid, handle);
        Ok(Self { handle })
    }

    /// Wrap an already-opened handle; ownership transfers to `WinProcess`
    pub fn from_handle(handle: HANDLE) -> Self {
        Self { handle }
    }

    fn to_page_flags(prot: Protection) -> PAGE_PROTECTION_FLAGS {
        match (
            prot.contains(Protection::READ),
            prot.contains(Protection::WRITE),
            prot.contains(Protection::EXECUTE),
        ) {
            (_, true, true) => PAGE_EXECUTE_READWRITE,
            (true, false, true) => PAGE_EXECUTE_READ,
            (false, false, true) => PAGE_EXECUTE,
            (_, true, false) => PAGE_READWRITE,
            (true, false, false) => PAGE_READONLY,
            (false, false, false) => PAGE_NOACCESS,
        }
    }

    fn from_page_flags(flags: PAGE_PROTECTION_FLAGS) -> Protection {
        match flags {
            PAGE_EXECUTE_READWRITE => Protection::RWX,
            PAGE_EXECUTE_READ => Protection::RX,
            PAGE_EXECUTE => Protection::EXECUTE,
            PAGE_READWRITE => Protection::RW,
            PAGE_READONLY => Protection::READ,
            _ => Protection::empty(),
        }
    }

    unsafe fn try_alloc_at(&self, hint: Option<usize>, len: usize, prot: Protection) -> usize {
        VirtualAllocEx(
            self.handle,
            hint.map(|h| h as *const c_void),
            len,
            MEM_COMMIT | MEM_RESERVE,
            Self::to_page_flags(prot),
        ) as usize
    }
}

impl Drop for WinProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl RemoteProcess for WinProcess {
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> MemoryResult<()> {
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut read),
            )
        }
        .map_err(|e| MemoryError::Read {
            addr,
            len: buf.len(),
            reason: e.to_string(),
        })?;
        if read != buf.len() {
            return Err(MemoryError::Read {
                addr,
                len: buf.len(),
                reason: format!("short read ({read} bytes)"),
            });
        }
        Ok(())
    }

    fn write_bytes(&self, addr: usize, data: &[u8]) -> MemoryResult<()> {
        let mut written = 0usize;
        unsafe {
            WriteProcessMemory(
                self.handle,
                addr as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| MemoryError::Write {
            addr,
            len: data.len(),
            reason: e.to_string(),
        })?;
        if written != data.len() {
            return Err(MemoryError::Write {
                addr,
                len: data.len(),
                reason: format!("short write ({written} bytes)"),
            });
        }
        Ok(())
    }

    fn alloc(&self, len: usize, prot: Protection, near: Option<usize>) -> MemoryResult<usize> {
        if let Some(target) = near {
            // Scan outward from the hint until something lands in rel32
            // reach, same approach as a near trampoline allocator.
            let start = target.saturating_sub(NEAR_RANGE).max(NEAR_STEP);
            let end = target.saturating_add(NEAR_RANGE);
            for hint in (start..end).step_by(NEAR_STEP) {
                let addr = unsafe { self.try_alloc_at(Some(hint), len, prot) };
                if addr == 0 {
                    continue;
                }
                if addr.abs_diff(target) < NEAR_RANGE {
                    return Ok(addr);
                }
                // Landed out of reach, give it back and keep scanning
                unsafe {
                    let _ = VirtualFreeEx(self.handle, addr as *mut c_void, 0, MEM_RELEASE);
                }
            }
            tracing::warn!(
                "near allocation beside {:x} failed, falling back to any address",
                target
            );
        }
        let addr = unsafe { self.try_alloc_at(None, len, prot) };
        if addr == 0 {
            return Err(MemoryError::Allocation {
                len,
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(addr)
    }

    fn free(&self, addr: usize) -> MemoryResult<()> {
        unsafe { VirtualFreeEx(self.handle, addr as *mut c_void, 0, MEM_RELEASE) }.map_err(|e| {
            MemoryError::Allocation {
                len: 0,
                reason: format!("free at {addr:x} failed: {e}"),
            }
        })
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> MemoryResult<Protection> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtectEx(
                self.handle,
                addr as *const c_void,
                len,
                Self::to_page_flags(prot),
                &mut old,
            )
        }
        .map_err(|e| MemoryError::Protect {
            addr,
            reason: e.to_string(),
        })?;
        Ok(Self::from_page_flags(old))
    }

    fn flush_instruction_cache(&self, addr: usize, len: usize) -> MemoryResult<()> {
        unsafe { FlushInstructionCache(self.handle, Some(addr as *const c_void), len) }.map_err(
            |e| MemoryError::Write {
                addr,
                len,
                reason: format!("icache flush failed: {e}"),
            },
        )
    }
}
