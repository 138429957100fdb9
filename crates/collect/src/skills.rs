//! Skill-cast detection
//!
//! The transactional specialization: a hook at the cast-commit point writes
//! the skill id (and any extra words) into a flag-gated channel. There is no
//! background thread; the owner calls [`update`](SkillCastDetector::update)
//! from its own logic tick, and a detected event invokes the observer
//! registered at construction, clearing the flag in the same read. Two casts
//! between ticks coalesce to the latest, which is acceptable for a
//! rate-limited in-game action.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tapwire_hook::{CaptureChannel, CaptureScheme, GpReg, HookError, HookSite};
use tapwire_memory::RemoteProcess;

/// Minimum spacing between channel-read failure warnings
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Receives one callback per detected cast
pub trait SkillCastObserver: Send {
    /// `values` are the captured raw words; `values[0]` is the skill id by
    /// convention, further words are hook-point specific.
    fn on_skill_cast(&mut self, values: &[u64]);
}

impl<F: FnMut(&[u64]) + Send> SkillCastObserver for F {
    fn on_skill_cast(&mut self, values: &[u64]) {
        self(values)
    }
}

/// Transactional single-event detector over one hook site
pub struct SkillCastDetector<P: RemoteProcess + Send + Sync> {
    process: Arc<P>,
    site: HookSite<P>,
    channel: CaptureChannel,
    observer: Box<dyn SkillCastObserver>,
    last_warn: Option<Instant>,
}

impl<P: RemoteProcess + Send + Sync> SkillCastDetector<P> {
    /// Install the hook and register the observer.
    ///
    /// `captures` holds one source register per event word; the word count
    /// is taken from its length.
    pub fn start(
        process: Arc<P>,
        target: usize,
        stolen_len: usize,
        captures: Vec<GpReg>,
        observer: impl SkillCastObserver + 'static,
    ) -> Result<Self, HookError> {
        let mut site = HookSite::new(
            process.clone(),
            target,
            stolen_len,
            CaptureScheme::Transactional {
                slot_words: captures.len() as u32,
            },
            captures,
        )?;
        let channel = site.install()?;
        tracing::info!("skill cast detector armed at {:x}", target);
        Ok(Self {
            process,
            site,
            channel,
            observer: Box::new(observer),
            last_warn: None,
        })
    }

    /// Poll once from the owner's logic tick.
    ///
    /// Returns `true` if an event was delivered. A channel-read failure is
    /// "no event this tick", logged at a rate-limited level.
    pub fn update(&mut self) -> bool {
        match self.channel.take_event(&*self.process) {
            Ok(Some(values)) => {
                tracing::debug!("skill cast detected: id {:x}", values[0]);
                self.observer.on_skill_cast(&values);
                true
            }
            Ok(None) => false,
            Err(e) => {
                let now = Instant::now();
                if self
                    .last_warn
                    .map_or(true, |t| now.duration_since(t) >= WARN_INTERVAL)
                {
                    tracing::warn!("skill channel read failed: {}", e);
                    self.last_warn = Some(now);
                }
                false
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.site.is_installed()
    }

    /// Channel view of the live hook; diagnostics and tests only
    pub fn channel(&self) -> CaptureChannel {
        self.channel
    }

    /// Remove the hook. Idempotent.
    pub fn stop(&mut self) -> Result<(), HookError> {
        match self.site.uninstall() {
            Ok(()) => Ok(()),
            Err(HookError::NotInstalled) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl<P: RemoteProcess + Send + Sync> Drop for SkillCastDetector<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("skill cast detector teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tapwire_memory::{FakeProcess, FAKE_BASE};

    const TARGET: usize = FAKE_BASE + 0x300;
    const ORIGINAL: [u8; 6] = [0x48, 0x89, 0x5C, 0x24, 0x08, 0x90];

    #[derive(Default)]
    struct Recorder {
        casts: Arc<Mutex<Vec<Vec<u64>>>>,
    }

    impl SkillCastObserver for Recorder {
        fn on_skill_cast(&mut self, values: &[u64]) {
            self.casts.lock().unwrap().push(values.to_vec());
        }
    }

    fn fixture() -> (
        Arc<FakeProcess>,
        SkillCastDetector<FakeProcess>,
        Arc<Mutex<Vec<Vec<u64>>>>,
    ) {
        let fake = Arc::new(FakeProcess::new());
        fake.write_bytes(TARGET, &ORIGINAL).unwrap();
        let casts = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            casts: casts.clone(),
        };
        let detector = SkillCastDetector::start(
            fake.clone(),
            TARGET,
            ORIGINAL.len(),
            vec![GpReg::Rdx, GpReg::R8],
            recorder,
        )
        .unwrap();
        (fake, detector, casts)
    }

    #[test]
    fn test_event_delivered_once_per_cycle() {
        let (fake, mut detector, casts) = fixture();
        assert!(!detector.update());

        let channel = detector.channel();
        channel
            .mirror_transactional_write(&*fake, &[0x2A, 0x1234])
            .unwrap();
        assert!(detector.update());
        // Flag cleared in the same read; no repeat delivery.
        assert!(!detector.update());
        assert_eq!(*casts.lock().unwrap(), vec![vec![0x2A, 0x1234]]);

        detector.stop().unwrap();
    }

    #[test]
    fn test_back_to_back_casts_coalesce() {
        let (fake, mut detector, casts) = fixture();
        let channel = detector.channel();
        channel.mirror_transactional_write(&*fake, &[1, 0]).unwrap();
        channel.mirror_transactional_write(&*fake, &[2, 0]).unwrap();
        assert!(detector.update());
        assert!(!detector.update());
        assert_eq!(*casts.lock().unwrap(), vec![vec![2, 0]]);
        detector.stop().unwrap();
    }

    #[test]
    fn test_read_failure_is_no_event() {
        let (fake, mut detector, casts) = fixture();
        fake.set_fail_reads(true);
        assert!(!detector.update());
        fake.set_fail_reads(false);

        detector
            .channel()
            .mirror_transactional_write(&*fake, &[5, 6])
            .unwrap();
        assert!(detector.update());
        assert_eq!(casts.lock().unwrap().len(), 1);
        detector.stop().unwrap();
    }

    #[test]
    fn test_stop_restores_bytes() {
        let (fake, mut detector, _) = fixture();
        detector.stop().unwrap();
        detector.stop().unwrap();
        let mut buf = [0u8; 6];
        fake.read_bytes(TARGET, &mut buf).unwrap();
        assert_eq!(buf, ORIGINAL);
        assert_eq!(fake.outstanding_allocations(), 0);
    }

    #[test]
    fn test_closure_observer() {
        let fake = Arc::new(FakeProcess::new());
        fake.write_bytes(TARGET, &ORIGINAL).unwrap();
        let seen = Arc::new(Mutex::new(0u64));
        let sink = seen.clone();
        let mut detector = SkillCastDetector::start(
            fake.clone(),
            TARGET,
            ORIGINAL.len(),
            vec![GpReg::Rcx],
            move |values: &[u64]| *sink.lock().unwrap() = values[0],
        )
        .unwrap();

        detector
            .channel()
            .mirror_transactional_write(&*fake, &[0x77])
            .unwrap();
        assert!(detector.update());
        assert_eq!(*seen.lock().unwrap(), 0x77);
        detector.stop().unwrap();
    }
}
