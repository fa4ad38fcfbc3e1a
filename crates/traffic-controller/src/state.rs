//! Process-wide weight snapshot.
//!
//! The reconciliation loop is the only writer; every per-route pipeline run
//! reads a snapshot. Readers never block the writer (`ArcSwap`), and a stale
//! read is corrected by the fan-out that follows every published change.

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeightSnapshot {
    /// Cluster-wide target weight read from the shared store.
    pub desired: i64,
    /// Last weight this cluster acted upon and persisted.
    pub current: i64,
    pub health_check_id: Option<String>,
    /// Bumped on every publish.
    pub version: u64,
}

impl WeightSnapshot {
    pub fn new(desired: i64, current: i64, health_check_id: Option<String>) -> Self {
        Self { desired, current, health_check_id: health_check_id.filter(|id| !id.is_empty()), version: 0 }
    }
}

pub struct WeightState;

impl WeightState {
    pub fn new(initial: WeightSnapshot) -> (WeightWriter, WeightReader) {
        let inner = Arc::new(ArcSwap::from_pointee(initial));
        (WeightWriter { inner: inner.clone() }, WeightReader { inner })
    }
}

/// Read handle, cheap to clone into every pipeline invocation.
#[derive(Clone, Debug)]
pub struct WeightReader {
    inner: Arc<ArcSwap<WeightSnapshot>>,
}

impl WeightReader {
    pub fn snapshot(&self) -> Arc<WeightSnapshot> {
        self.inner.load_full()
    }
}

/// Sole write handle. Not `Clone`; mutation requires `&mut self`.
#[derive(Debug)]
pub struct WeightWriter {
    inner: Arc<ArcSwap<WeightSnapshot>>,
}

impl WeightWriter {
    pub fn snapshot(&self) -> Arc<WeightSnapshot> {
        self.inner.load_full()
    }

    /// Startup only: set both weights before the loop is spawned.
    pub fn seed(&mut self, desired: i64, current: i64) -> Arc<WeightSnapshot> {
        self.update(|s| {
            s.desired = desired;
            s.current = current;
        })
    }

    pub fn publish_desired(&mut self, desired: i64) -> Arc<WeightSnapshot> {
        self.update(|s| s.desired = desired)
    }

    pub fn commit_current(&mut self, current: i64) -> Arc<WeightSnapshot> {
        self.update(|s| s.current = current)
    }

    fn update(&mut self, f: impl FnOnce(&mut WeightSnapshot)) -> Arc<WeightSnapshot> {
        let mut next = WeightSnapshot::clone(&self.inner.load());
        f(&mut next);
        next.version += 1;
        let next = Arc::new(next);
        self.inner.store(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_observe_published_values() {
        let (mut writer, reader) = WeightState::new(WeightSnapshot::new(10, 10, None));
        let before = reader.snapshot();
        writer.publish_desired(80);
        assert_eq!(before.desired, 10, "old snapshot is immutable");
        let after = reader.snapshot();
        assert_eq!((after.desired, after.current), (80, 10));
        assert_eq!(after.version, before.version + 1);
        writer.commit_current(80);
        assert_eq!(reader.snapshot().current, 80);
    }

    #[test]
    fn empty_health_check_id_is_dropped() {
        let s = WeightSnapshot::new(0, 0, Some(String::new()));
        assert_eq!(s.health_check_id, None);
    }
}
