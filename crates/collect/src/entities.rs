//! Entity telemetry collection
//!
//! The continuous specialization: a hook at an entity-iteration point feeds
//! entity pointers through a wraparound channel, and a background poller
//! publishes the resolved set at ~60 Hz. `pause` hands a caller (say, an
//! aim-assist routine mid-computation) a stable view without removing the
//! hook; `resume` picks ticking back up.

use std::sync::Arc;
use std::time::Duration;

use tapwire_hook::{CaptureScheme, GpReg, HookError, HookSite, Poller};
use tapwire_memory::{OffsetTable, RemoteProcess, StructReader};

use crate::config::CollectorConfig;

/// One resolved entity, as captured this tick
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Entity struct address in the target process
    pub address: usize,
    pub id: u32,
    pub position: [f32; 3],
}

/// Resolves a captured entity pointer into an [`EntityRecord`] using an
/// offset table. Read failures drop the record: the pointer may have gone
/// stale between capture and poll, which is the channel's accepted
/// lossiness, not an error.
pub struct EntityResolver<P: RemoteProcess> {
    process: Arc<P>,
    offsets: OffsetTable,
}

impl<P: RemoteProcess> EntityResolver<P> {
    pub fn new(process: Arc<P>, offsets: OffsetTable) -> Self {
        Self { process, offsets }
    }

    pub fn resolve(&self, raw: u64) -> Option<EntityRecord> {
        let reader = StructReader::new(&*self.process, &self.offsets, raw as usize);
        let id = reader.read_u32("id").ok()?;
        let position = reader.read_vec3("position").ok()?;
        Some(EntityRecord {
            address: raw as usize,
            id,
            position,
        })
    }
}

/// Continuous entity telemetry over one hook site
pub struct EntityCollector<P: RemoteProcess + Send + Sync + 'static> {
    site: HookSite<P>,
    poller: Option<Poller<EntityRecord>>,
}

impl<P: RemoteProcess + Send + Sync + 'static> EntityCollector<P> {
    /// Install the hook and start polling.
    ///
    /// `target` is the absolute hook address (module base already applied),
    /// `capture` the register holding the entity pointer there, and
    /// `offsets` the entity struct layout for resolution.
    pub fn start(
        process: Arc<P>,
        target: usize,
        stolen_len: usize,
        capture: GpReg,
        offsets: OffsetTable,
        cfg: &CollectorConfig,
    ) -> Result<Self, HookError> {
        let mut site = HookSite::new(
            process.clone(),
            target,
            stolen_len,
            CaptureScheme::Continuous {
                slot_count: cfg.slot_count,
            },
            vec![capture],
        )?;
        let channel = site.install()?;

        let resolver = EntityResolver::new(process.clone(), offsets);
        let poller = Poller::spawn(
            process,
            channel,
            Duration::from_millis(cfg.tick_ms),
            cfg.min_address,
            move |raw| resolver.resolve(raw),
        );
        tracing::info!("entity collector running against hook at {:x}", target);

        Ok(Self {
            site,
            poller: Some(poller),
        })
    }

    /// Current set of resolved entities (cheap Arc clone)
    pub fn snapshot(&self) -> Arc<Vec<EntityRecord>> {
        self.poller
            .as_ref()
            .map(|p| p.snapshot())
            .unwrap_or_default()
    }

    /// Freeze the published snapshot (clearing it) without removing the hook
    pub fn pause(&self) {
        if let Some(p) = &self.poller {
            p.pause();
        }
    }

    /// Resume ticking; the snapshot refreshes within one tick
    pub fn resume(&self) {
        if let Some(p) = &self.poller {
            p.resume();
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_some()
    }

    /// Channel view of the live hook; diagnostics and tests only
    pub fn channel(&self) -> Option<tapwire_hook::CaptureChannel> {
        self.site.channel()
    }

    /// Stop the poll loop, then remove the hook. The loop is stopped and
    /// acknowledged *before* memory is unpatched, so no poll ever reads a
    /// freed channel. Idempotent.
    pub fn stop(&mut self) -> Result<(), HookError> {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        match self.site.uninstall() {
            Ok(()) => Ok(()),
            // Second stop, or the site never finished installing
            Err(HookError::NotInstalled) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl<P: RemoteProcess + Send + Sync + 'static> Drop for EntityCollector<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("entity collector teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapwire_memory::{FakeProcess, OffsetTable, FAKE_BASE};

    const TARGET: usize = FAKE_BASE + 0x200;
    const STOLEN_LEN: usize = 5;
    const ORIGINAL: [u8; 5] = [0x48, 0x89, 0x5C, 0x24, 0x08];
    const SETTLE: Duration = Duration::from_millis(60);

    fn offsets() -> OffsetTable {
        OffsetTable::from_iter([("id", 0x08usize), ("position", 0x10)])
    }

    fn seed_entity(fake: &FakeProcess, addr: usize, id: u32, pos: [f32; 3]) {
        fake.write_u32(addr + 0x08, id).unwrap();
        for (i, p) in pos.iter().enumerate() {
            fake.write_bytes(addr + 0x10 + i * 4, &p.to_le_bytes()).unwrap();
        }
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            slot_count: 4,
            tick_ms: 5,
            min_address: 0x1_0000,
        }
    }

    fn start(fake: &Arc<FakeProcess>) -> EntityCollector<FakeProcess> {
        fake.write_bytes(TARGET, &ORIGINAL).unwrap();
        EntityCollector::start(
            fake.clone(),
            TARGET,
            STOLEN_LEN,
            GpReg::Rdi,
            offsets(),
            &fast_config(),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_is_resolved_entity_set() {
        let fake = Arc::new(FakeProcess::new());
        let e1 = FAKE_BASE + 0x2000;
        let e2 = FAKE_BASE + 0x3000;
        seed_entity(&fake, e1, 7, [1.0, 2.0, 3.0]);
        seed_entity(&fake, e2, 9, [4.0, 5.0, 6.0]);

        let mut collector = start(&fake);
        let channel = collector.channel().unwrap();
        channel.mirror_continuous_write(&*fake, e1 as u64).unwrap();
        channel.mirror_continuous_write(&*fake, e2 as u64).unwrap();
        std::thread::sleep(SETTLE);

        let snapshot = collector.snapshot();
        let mut ids: Vec<u32> = snapshot.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 9]);
        let e = snapshot.iter().find(|e| e.id == 7).unwrap();
        assert_eq!(e.address, e1);
        assert_eq!(e.position, [1.0, 2.0, 3.0]);

        collector.stop().unwrap();
    }

    #[test]
    fn test_pause_resume_cycle() {
        let fake = Arc::new(FakeProcess::new());
        let e1 = FAKE_BASE + 0x2000;
        seed_entity(&fake, e1, 7, [1.0, 2.0, 3.0]);

        let mut collector = start(&fake);
        let channel = collector.channel().unwrap();
        channel.mirror_continuous_write(&*fake, e1 as u64).unwrap();
        std::thread::sleep(SETTLE);
        assert_eq!(collector.snapshot().len(), 1);

        collector.pause();
        std::thread::sleep(SETTLE);
        let frozen = collector.snapshot();
        assert!(frozen.is_empty());

        let e2 = FAKE_BASE + 0x3000;
        seed_entity(&fake, e2, 9, [4.0, 5.0, 6.0]);
        channel.mirror_continuous_write(&*fake, e2 as u64).unwrap();
        std::thread::sleep(SETTLE);
        assert!(Arc::ptr_eq(&frozen, &collector.snapshot()));

        collector.resume();
        std::thread::sleep(SETTLE);
        assert!(collector.snapshot().iter().any(|e| e.id == 9));

        collector.stop().unwrap();
    }

    #[test]
    fn test_stop_restores_target_and_frees_regions() {
        let fake = Arc::new(FakeProcess::new());
        let mut collector = start(&fake);
        collector.stop().unwrap();
        // Idempotent
        collector.stop().unwrap();

        let mut buf = [0u8; 5];
        fake.read_bytes(TARGET, &mut buf).unwrap();
        assert_eq!(buf, ORIGINAL);
        assert_eq!(fake.outstanding_allocations(), 0);
    }

    #[test]
    fn test_stale_entity_pointer_dropped() {
        let fake = Arc::new(FakeProcess::new());
        let mut collector = start(&fake);
        let channel = collector.channel().unwrap();
        // Plausible-looking pointer outside the fake's address space:
        // resolution fails, the record is dropped, nothing crashes.
        channel
            .mirror_continuous_write(&*fake, 0x7FFF_0000_0000)
            .unwrap();
        std::thread::sleep(SETTLE);
        assert!(collector.snapshot().is_empty());
        collector.stop().unwrap();
    }
}
