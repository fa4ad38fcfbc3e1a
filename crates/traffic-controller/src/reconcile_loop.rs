//! Periodic weight reconciliation.
//!
//! Each tick reads the desired weight from the shared store. When it differs
//! from what this cluster last acted upon, the new value is published, every
//! route is re-enqueued, and the store is told the change was applied.

use k8s_openapi::api::networking::v1::Ingress;
use kube_runtime::reflector::ObjectRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::state::WeightWriter;
use crate::store::{StoreConfig, WeightStore};
use crate::telemetry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged { weight: i64 },
    FannedOut { weight: i64, routes: usize },
}

pub struct ReconcileLoop {
    store: Arc<dyn WeightStore>,
    writer: WeightWriter,
    routes: Arc<dyn ClusterApi>,
    events: mpsc::Sender<ObjectRef<Ingress>>,
}

impl ReconcileLoop {
    pub fn new(
        store: Arc<dyn WeightStore>,
        writer: WeightWriter,
        routes: Arc<dyn ClusterApi>,
        events: mpsc::Sender<ObjectRef<Ingress>>,
    ) -> Self {
        Self { store, writer, routes, events }
    }

    pub fn writer(&self) -> &WeightWriter { &self.writer }

    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let desired = self.store.read_weight().await?;
        let current = self.writer.snapshot().current;
        if desired == current {
            debug!(weight = desired, "weight_loop.unchanged");
            return Ok(TickOutcome::Unchanged { weight: desired });
        }
        info!(current, desired, "weight_loop.change_detected");
        let published = self.writer.publish_desired(desired);
        telemetry::record_weights(&published);

        let routes = self.fan_out().await?;

        let config = StoreConfig { current_weight: desired, ..StoreConfig::from(published.as_ref()) };
        self.store.on_weight_update(&config).await?;
        // Only now is the change considered applied; a failed write is picked up again next tick.
        let committed = self.writer.commit_current(desired);
        telemetry::record_weights(&committed);
        info!(weight = desired, routes, "weight_loop.change_applied");
        Ok(TickOutcome::FannedOut { weight: desired, routes })
    }

    async fn fan_out(&self) -> Result<usize> {
        let ingresses = self.routes.list_ingresses().await?;
        for ingress in &ingresses {
            self.events.send(ObjectRef::from_obj(ingress)).await.map_err(|_| Error::FanOutClosed)?;
        }
        Ok(ingresses.len())
    }

    /// Tick every `period` until `shutdown` flips to `true` or its sender is
    /// dropped. A cycle in progress always runs to completion.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "weight_loop.started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.tick().await {
                telemetry::WEIGHT_POLL_FAILURES.inc();
                error!(error=%e, "weight_loop.tick_failed");
            }
        }
        info!("weight_loop.stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{WeightSnapshot, WeightState};
    use crate::test_support::{IngressBuilder, InMemoryCluster, ScriptedWeightStore};

    fn setup(current: i64, stored: i64) -> (ReconcileLoop, Arc<ScriptedWeightStore>, mpsc::Receiver<ObjectRef<Ingress>>) {
        let cluster = InMemoryCluster::default();
        cluster.add_ingress(IngressBuilder::new("ns", "a").build());
        cluster.add_ingress(IngressBuilder::new("ns", "b").build());
        let store = Arc::new(ScriptedWeightStore::new(stored));
        let (writer, _reader) = WeightState::new(WeightSnapshot::new(current, current, None));
        let (tx, rx) = mpsc::channel(8);
        (ReconcileLoop::new(store.clone(), writer, Arc::new(cluster), tx), store, rx)
    }

    #[tokio::test]
    async fn read_failure_is_propagated_without_fan_out() {
        let (mut weight_loop, store, mut rx) = setup(50, 80);
        store.fail_reads(true);
        assert!(weight_loop.tick().await.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(weight_loop.writer().snapshot().desired, 50);
    }

    #[tokio::test]
    async fn closed_channel_leaves_current_uncommitted() {
        let (mut weight_loop, store, rx) = setup(50, 80);
        drop(rx);
        assert!(matches!(weight_loop.tick().await, Err(Error::FanOutClosed)));
        assert_eq!(weight_loop.writer().snapshot().current, 50);
        assert!(store.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_changes_on_schedule_and_stops_on_shutdown() {
        let (weight_loop, store, mut events) = setup(50, 80);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(weight_loop.run(Duration::from_secs(20), rx));

        // First cycle: 50 -> 80 fans out both routes and persists.
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        let mut names = vec![first.name, second.name];
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        // A later change is only seen on the next period.
        store.set_weight(30);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(events.recv().await.unwrap().namespace.as_deref(), Some("ns"));
        assert_eq!(events.recv().await.unwrap().namespace.as_deref(), Some("ns"));

        tx.send(true).unwrap();
        handle.await.unwrap();
        let persisted: Vec<i64> = store.updates().iter().map(|c| c.current_weight).collect();
        assert_eq!(persisted, vec![80, 30], "cycles in flight complete before the loop stops");
        assert!(events.try_recv().is_err());
    }
}
