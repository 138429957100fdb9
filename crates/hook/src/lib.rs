//! tapwire hook engine
//!
//! Redirects execution inside a running external process at an arbitrary
//! instruction boundary and reports runtime values back through a
//! shared-memory capture channel:
//!
//! - [`TrampolineBuilder`] assembles the relocatable capture code
//! - [`HookSite`] owns one patched location and its install/uninstall
//!   protocol, with rollback on every failure path
//! - [`CaptureChannel`] defines the in-target-process data layout and the
//!   continuous / transactional read contracts
//! - [`Poller`] drains a channel from a dedicated background thread and
//!   publishes a deduplicated snapshot
//!
//! The caller supplies a hook point and a stolen-byte length already known
//! to be instruction-boundary safe; the engine is a best-effort monitoring
//! channel, not a transactional protocol.

pub mod channel;
pub mod poller;
pub mod site;
pub mod trampoline;

pub use channel::{CaptureChannel, CaptureScheme};
pub use poller::Poller;
pub use site::{HookError, HookSite, DEFAULT_UNHOOK_GRACE};
pub use trampoline::{
    jump_stub, resolve_jmp_rel32, BuildError, GpReg, TrampolineBuilder, MAX_STOLEN_LEN,
    MIN_STOLEN_LEN, TRAMPOLINE_CAP,
};
