//! Capture channels
//!
//! The shared-memory structure a trampoline reports through. One channel is
//! private to one hook session: an 8-byte header (32-bit write index or
//! event flag, plus padding) followed by 8-byte slots. Every slot store on
//! the writer side is a single aligned machine-word move, so the reader
//! never sees a torn value; it may see *stale* values, which the contracts
//! below accept.
//!
//! Two read/write contracts exist:
//!
//! - **Continuous**: the writer stores at `slot[index mod S]` and advances
//!   the index, unbounded and unsynchronized. The reader re-reads the whole
//!   slot array per tick and treats it as a current-membership set. Entries
//!   overwritten between reads are lost; the consumer only wants "what
//!   currently exists", so the channel is lossy by construction.
//! - **Transactional**: the writer overwrites the word slots and sets the
//!   flag on every invocation, consumed or not. The reader delivers exactly
//!   one event per flag set→clear cycle; back-to-back writes before a read
//!   coalesce into the latest values.

use tapwire_memory::{MemoryResult, RemoteProcess};

/// Header bytes before the slot array (index/flag u32 + 4 bytes padding,
/// keeping slots 8-aligned)
pub const HEADER_LEN: usize = 8;

/// Width of one slot in bytes
pub const SLOT_LEN: usize = 8;

/// Capture policy for one hook site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureScheme {
    /// Wraparound slot table; index advances on every capture
    Continuous { slot_count: u32 },
    /// Flag-gated event slots; one in-flight event, newest wins
    Transactional { slot_words: u32 },
}

impl CaptureScheme {
    /// Number of 8-byte slots in the channel
    pub fn slot_count(&self) -> u32 {
        match *self {
            CaptureScheme::Continuous { slot_count } => slot_count,
            CaptureScheme::Transactional { slot_words } => slot_words,
        }
    }

    /// Total channel size in bytes
    pub fn channel_len(&self) -> usize {
        HEADER_LEN + self.slot_count() as usize * SLOT_LEN
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, CaptureScheme::Continuous { .. })
    }
}

/// Host-side view of one channel region in the target process.
///
/// Holds no target-owned memory; the region itself belongs to the
/// [`HookSite`](crate::HookSite) that allocated it.
#[derive(Debug, Clone, Copy)]
pub struct CaptureChannel {
    base: usize,
    scheme: CaptureScheme,
}

impl CaptureChannel {
    pub fn new(base: usize, scheme: CaptureScheme) -> Self {
        Self { base, scheme }
    }

    /// Base address of the channel in the target process
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn scheme(&self) -> CaptureScheme {
        self.scheme
    }

    /// Address of slot `i`
    pub fn slot_addr(&self, i: u32) -> usize {
        self.base + HEADER_LEN + i as usize * SLOT_LEN
    }

    /// Continuous read: the whole slot array as a membership set.
    ///
    /// Deduplicates by value, preserving slot order of first occurrence.
    /// Zero slots (not yet warmed) are kept; plausibility filtering belongs
    /// to the [`Poller`](crate::Poller).
    pub fn read_membership<P: RemoteProcess + ?Sized>(
        &self,
        process: &P,
    ) -> MemoryResult<Vec<u64>> {
        let count = self.scheme.slot_count() as usize;
        let mut raw = vec![0u8; count * SLOT_LEN];
        process.read_bytes(self.base + HEADER_LEN, &mut raw)?;
        let mut values = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(SLOT_LEN) {
            let value = u64::from_le_bytes(chunk.try_into().unwrap());
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Transactional read: if the flag is set, read the words and clear the
    /// flag in the same call. One event per set→clear cycle.
    pub fn take_event<P: RemoteProcess + ?Sized>(
        &self,
        process: &P,
    ) -> MemoryResult<Option<Vec<u64>>> {
        if process.read_u32(self.base)? == 0 {
            return Ok(None);
        }
        let words = self.scheme.slot_count();
        let mut values = Vec::with_capacity(words as usize);
        for i in 0..words {
            values.push(process.read_u64(self.slot_addr(i))?);
        }
        process.write_u32(self.base, 0)?;
        Ok(Some(values))
    }

    /// Scheme-dispatched read used by the poller: membership set for
    /// continuous channels, event words (or nothing) for transactional ones.
    pub fn drain<P: RemoteProcess + ?Sized>(&self, process: &P) -> MemoryResult<Vec<u64>> {
        match self.scheme {
            CaptureScheme::Continuous { .. } => self.read_membership(process),
            CaptureScheme::Transactional { .. } => {
                Ok(self.take_event(process)?.unwrap_or_default())
            }
        }
    }

    /// Host-side mirror of the generated continuous writer: store at the
    /// pre-increment index, then advance. Used by tests and dry-run
    /// diagnostics; must match the trampoline's semantics bit-for-bit.
    pub fn mirror_continuous_write<P: RemoteProcess + ?Sized>(
        &self,
        process: &P,
        value: u64,
    ) -> MemoryResult<()> {
        let mask = self.scheme.slot_count() - 1;
        let index = process.read_u32(self.base)?;
        process.write_u64(self.slot_addr(index & mask), value)?;
        process.write_u32(self.base, index.wrapping_add(1))
    }

    /// Host-side mirror of the generated transactional writer: overwrite
    /// the words, then set the flag.
    pub fn mirror_transactional_write<P: RemoteProcess + ?Sized>(
        &self,
        process: &P,
        words: &[u64],
    ) -> MemoryResult<()> {
        for (i, word) in words.iter().enumerate() {
            process.write_u64(self.slot_addr(i as u32), *word)?;
        }
        process.write_u32(self.base, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapwire_memory::{FakeProcess, Protection, RemoteProcess};

    fn make_channel(fake: &FakeProcess, scheme: CaptureScheme) -> CaptureChannel {
        let base = fake.alloc(scheme.channel_len(), Protection::RW, None).unwrap();
        CaptureChannel::new(base, scheme)
    }

    #[test]
    fn test_layout_math() {
        let scheme = CaptureScheme::Continuous { slot_count: 256 };
        assert_eq!(scheme.channel_len(), 8 + 256 * 8);
        let chan = CaptureChannel::new(0x1000, scheme);
        assert_eq!(chan.slot_addr(0), 0x1008);
        assert_eq!(chan.slot_addr(255), 0x1008 + 255 * 8);
    }

    #[test]
    fn test_continuous_wraparound_membership() {
        let fake = FakeProcess::new();
        let chan = make_channel(&fake, CaptureScheme::Continuous { slot_count: 4 });

        // Six distinct values through four slots: the first two are
        // overwritten, the set is at most four entries.
        for v in [0x10_0001u64, 0x10_0002, 0x10_0003, 0x10_0004, 0x10_0005, 0x10_0006] {
            chan.mirror_continuous_write(&fake, v).unwrap();
        }
        let set = chan.read_membership(&fake).unwrap();
        assert!(set.len() <= 4);
        for v in &set {
            assert!([0x10_0003u64, 0x10_0004, 0x10_0005, 0x10_0006].contains(v));
        }
        assert_eq!(fake.read_u32(chan.base()).unwrap(), 6);
    }

    #[test]
    fn test_continuous_dedup_by_value() {
        let fake = FakeProcess::new();
        let chan = make_channel(&fake, CaptureScheme::Continuous { slot_count: 4 });
        for _ in 0..4 {
            chan.mirror_continuous_write(&fake, 0xAB_CDEF).unwrap();
        }
        let set = chan.read_membership(&fake).unwrap();
        assert_eq!(set, vec![0xAB_CDEF]);
    }

    #[test]
    fn test_index_wraps_past_u32_range() {
        let fake = FakeProcess::new();
        let chan = make_channel(&fake, CaptureScheme::Continuous { slot_count: 4 });
        fake.write_u32(chan.base(), u32::MAX).unwrap();
        chan.mirror_continuous_write(&fake, 0x77).unwrap();
        // u32::MAX & 3 == 3, index wraps to 0
        assert_eq!(fake.read_u64(chan.slot_addr(3)).unwrap(), 0x77);
        assert_eq!(fake.read_u32(chan.base()).unwrap(), 0);
    }

    #[test]
    fn test_transactional_take_clears_flag() {
        let fake = FakeProcess::new();
        let chan = make_channel(&fake, CaptureScheme::Transactional { slot_words: 2 });

        assert_eq!(chan.take_event(&fake).unwrap(), None);
        chan.mirror_transactional_write(&fake, &[0xDEAD, 0xBEEF]).unwrap();
        assert_eq!(chan.take_event(&fake).unwrap(), Some(vec![0xDEAD, 0xBEEF]));
        // Flag cleared as part of the read; nothing on the second poll.
        assert_eq!(chan.take_event(&fake).unwrap(), None);
    }

    #[test]
    fn test_transactional_coalesces_to_latest() {
        let fake = FakeProcess::new();
        let chan = make_channel(&fake, CaptureScheme::Transactional { slot_words: 1 });
        chan.mirror_transactional_write(&fake, &[1]).unwrap();
        chan.mirror_transactional_write(&fake, &[2]).unwrap();
        assert_eq!(chan.take_event(&fake).unwrap(), Some(vec![2]));
        assert_eq!(chan.take_event(&fake).unwrap(), None);
    }
}
