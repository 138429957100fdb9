//! Hook sites
//!
//! A [`HookSite`] owns one patched location in the target process: the saved
//! original bytes, the trampoline and channel regions, and the install/
//! uninstall protocol. The site is never observably half-installed: either
//! the original bytes are live at the target or the jump stub is; every
//! failure path rolls back to the original state and frees both regions.

use std::sync::Arc;
use std::time::Duration;

use tapwire_memory::{MemoryError, Protection, RemoteProcess};

use crate::channel::{CaptureChannel, CaptureScheme};
use crate::trampoline::{jump_stub, BuildError, GpReg, TrampolineBuilder, TRAMPOLINE_CAP};

/// Default grace delay between restoring the original bytes and freeing the
/// trampoline region, covering a target thread still inside the trampoline
/// at the moment of removal.
pub const DEFAULT_UNHOOK_GRACE: Duration = Duration::from_millis(25);

/// Error type for hook site operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Install called on a site that already has a live hook
    #[error("hook already installed at {0:x}")]
    AlreadyInstalled(usize),

    /// Uninstall called on a site with no live hook (benign on shutdown paths)
    #[error("hook is not installed")]
    NotInstalled,

    /// Remote allocation, write or protection call failed
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Trampoline generation failed for this hook point / scheme
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Install protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SiteState {
    Uninstalled,
    Installing,
    Installed,
    Uninstalling,
}

/// One patched location in the target process
pub struct HookSite<P: RemoteProcess> {
    process: Arc<P>,
    target: usize,
    stolen_len: usize,
    scheme: CaptureScheme,
    captures: Vec<GpReg>,
    unhook_grace: Duration,
    state: SiteState,
    /// Original bytes at `target`, retained while installed
    saved: Vec<u8>,
    /// Base addresses of the allocated regions, retained while installed
    trampoline: Option<usize>,
    channel_base: Option<usize>,
}

impl<P: RemoteProcess> HookSite<P> {
    /// Describe a hook site. Validates the scheme, capture registers and
    /// stolen length up front; nothing touches the target until
    /// [`install`](Self::install).
    pub fn new(
        process: Arc<P>,
        target: usize,
        stolen_len: usize,
        scheme: CaptureScheme,
        captures: Vec<GpReg>,
    ) -> Result<Self, HookError> {
        // Stolen bytes are only read at install time; validate with a
        // placeholder of the declared length.
        let placeholder = vec![0u8; stolen_len];
        TrampolineBuilder::new(target, scheme, &captures, &placeholder).check()?;
        Ok(Self {
            process,
            target,
            stolen_len,
            scheme,
            captures,
            unhook_grace: DEFAULT_UNHOOK_GRACE,
            state: SiteState::Uninstalled,
            saved: Vec::new(),
            trampoline: None,
            channel_base: None,
        })
    }

    /// Override the teardown grace delay (tests use zero)
    pub fn with_unhook_grace(mut self, grace: Duration) -> Self {
        self.unhook_grace = grace;
        self
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn scheme(&self) -> CaptureScheme {
        self.scheme
    }

    pub fn is_installed(&self) -> bool {
        self.state == SiteState::Installed
    }

    /// Channel view for the live hook, if installed
    pub fn channel(&self) -> Option<CaptureChannel> {
        self.channel_base
            .map(|base| CaptureChannel::new(base, self.scheme))
    }

    /// Patch the target and stand up the capture channel.
    ///
    /// On success the jump stub is live and the returned channel receives
    /// captures. On any failure both regions are freed and the target's
    /// original bytes are left (or put back) in place.
    pub fn install(&mut self) -> Result<CaptureChannel, HookError> {
        if self.state == SiteState::Installed {
            return Err(HookError::AlreadyInstalled(self.target));
        }
        self.state = SiteState::Installing;
        tracing::debug!("installing hook at {:x}", self.target);

        match self.install_inner() {
            Ok(channel) => {
                self.state = SiteState::Installed;
                tracing::info!(
                    "installed hook at {:x} (trampoline {:x}, channel {:x})",
                    self.target,
                    self.trampoline.unwrap_or(0),
                    channel.base()
                );
                Ok(channel)
            }
            Err(e) => {
                self.release_regions();
                self.saved.clear();
                self.state = SiteState::Uninstalled;
                tracing::warn!("hook install at {:x} failed: {}", self.target, e);
                Err(e)
            }
        }
    }

    fn install_inner(&mut self) -> Result<CaptureChannel, HookError> {
        // 1. Read and retain the original bytes; they double as the stolen
        //    instructions replayed inside the trampoline.
        let mut saved = vec![0u8; self.stolen_len];
        self.process.read_bytes(self.target, &mut saved)?;
        self.saved = saved;

        // 2. Allocate the channel (zero-initialized) and the trampoline,
        //    the latter within rel32 reach of the target if possible.
        let channel_addr = self
            .process
            .alloc(self.scheme.channel_len(), Protection::RW, None)?;
        self.channel_base = Some(channel_addr);

        let trampoline_addr =
            self.process
                .alloc(TRAMPOLINE_CAP, Protection::RWX, Some(self.target))?;
        self.trampoline = Some(trampoline_addr);

        // 3. Build against the now-known addresses and write the trampoline.
        let code = TrampolineBuilder::new(self.target, self.scheme, &self.captures, &self.saved)
            .build(trampoline_addr, channel_addr)?;
        self.process.write_bytes(trampoline_addr, &code)?;

        // 4. Hook stub: rel32 jump to the trampoline, NOP-padded.
        let stub = jump_stub(self.target, trampoline_addr, self.stolen_len)?;

        // 5. Patch the target. If the stub write fails partway the original
        //    bytes go back before the error surfaces.
        let prior = self
            .process
            .protect(self.target, self.stolen_len, Protection::RWX)?;
        if let Err(e) = self.process.write_bytes(self.target, &stub) {
            self.try_restore_bytes();
            let _ = self.process.protect(self.target, self.stolen_len, prior);
            let _ = self
                .process
                .flush_instruction_cache(self.target, self.stolen_len);
            return Err(e.into());
        }
        let sealed = self
            .process
            .protect(self.target, self.stolen_len, prior)
            .and_then(|_| {
                self.process
                    .flush_instruction_cache(self.target, self.stolen_len)
            });
        if let Err(e) = sealed {
            // Stub is live but the page could not be sealed/flushed; back
            // out completely rather than leave a half-finished patch.
            self.try_restore_bytes();
            let _ = self
                .process
                .flush_instruction_cache(self.target, self.stolen_len);
            return Err(e.into());
        }

        Ok(CaptureChannel::new(channel_addr, self.scheme))
    }

    /// Restore the target and free both regions.
    ///
    /// Idempotent: a second call (or a call on a never-installed site)
    /// returns [`HookError::NotInstalled`] and performs no remote operation.
    /// Shutdown and error-recovery paths treat that as success.
    pub fn uninstall(&mut self) -> Result<(), HookError> {
        if self.state != SiteState::Installed {
            return Err(HookError::NotInstalled);
        }
        self.state = SiteState::Uninstalling;
        tracing::debug!("uninstalling hook at {:x}", self.target);

        let result = self.restore_target();

        // The target cannot be cooperatively suspended; give any thread
        // mid-trampoline a moment before the region disappears.
        if !self.unhook_grace.is_zero() {
            std::thread::sleep(self.unhook_grace);
        }
        self.release_regions();
        self.saved.clear();
        self.state = SiteState::Uninstalled;

        match &result {
            Ok(()) => tracing::info!("uninstalled hook at {:x}", self.target),
            Err(e) => tracing::warn!("uninstall of hook at {:x} degraded: {}", self.target, e),
        }
        result
    }

    fn restore_target(&mut self) -> Result<(), HookError> {
        let prior = self
            .process
            .protect(self.target, self.stolen_len, Protection::RWX)?;
        self.process.write_bytes(self.target, &self.saved)?;
        self.process.protect(self.target, self.stolen_len, prior)?;
        self.process
            .flush_instruction_cache(self.target, self.stolen_len)?;
        Ok(())
    }

    /// Best-effort write-back of the saved bytes during rollback
    fn try_restore_bytes(&self) {
        if self.saved.is_empty() {
            return;
        }
        if let Err(e) = self.process.write_bytes(self.target, &self.saved) {
            tracing::error!(
                "rollback could not restore original bytes at {:x}: {}",
                self.target,
                e
            );
        }
    }

    /// Free both regions, logging rather than propagating failures
    fn release_regions(&mut self) {
        for addr in [self.trampoline.take(), self.channel_base.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.process.free(addr) {
                tracing::warn!("failed to free region at {:x}: {}", addr, e);
            }
        }
    }
}

impl<P: RemoteProcess> Drop for HookSite<P> {
    fn drop(&mut self) {
        if self.state == SiteState::Installed {
            if let Err(e) = self.uninstall() {
                tracing::error!(
                    "hook at {:x} not cleanly removed on drop: {}",
                    self.target,
                    e
                );
            }
        }
    }
}
