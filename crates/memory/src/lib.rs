//! tapwire memory layer
//!
//! Remote-process memory access behind the [`RemoteProcess`] trait: raw
//! reads/writes, executable allocation with near-placement hints, page
//! protection, instruction cache flushes. Ships an offset-table driven
//! [`StructReader`] for resolving captured pointers into typed fields, a
//! Windows backend, and the [`FakeProcess`] double the engine tests run
//! against.

mod error;
pub mod fake;
pub mod offsets;
pub mod process;

#[cfg(windows)]
pub mod native;

pub use error::{MemoryError, MemoryResult};
pub use fake::{FakeProcess, FAKE_BASE};
pub use offsets::{OffsetTable, StructReader};
pub use process::{plausible_address, Protection, RemoteProcess, MIN_PLAUSIBLE_ADDR};

#[cfg(windows)]
pub use native::WinProcess;
