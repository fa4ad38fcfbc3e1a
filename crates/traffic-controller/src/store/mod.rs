//! Cross-cluster weight store.
//!
//! Every replica of every peer cluster shares one table holding a single row
//! per cluster: `ClusterName` (key), `DesiredWeight`, `CurrentWeight`. An
//! operator changes `DesiredWeight`; the reconciliation loop notices and
//! writes back `CurrentWeight` once the change has been fanned out.

#[cfg(feature = "dynamodb")]
pub mod dynamo;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, StoreError};
use crate::state::{WeightReader, WeightSnapshot};

pub const CLUSTER_NAME_ATTR: &str = "ClusterName";
pub const DESIRED_WEIGHT_ATTR: &str = "DesiredWeight";
pub const CURRENT_WEIGHT_ATTR: &str = "CurrentWeight";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreConfig {
    pub desired_weight: i64,
    pub current_weight: i64,
    pub health_check_id: Option<String>,
}

impl From<&WeightSnapshot> for StoreConfig {
    fn from(s: &WeightSnapshot) -> Self {
        Self { desired_weight: s.desired, current_weight: s.current, health_check_id: s.health_check_id.clone() }
    }
}

#[async_trait]
pub trait WeightStore: Send + Sync + 'static {
    /// Desired weight for this cluster. `StoreError::NotFound` when the row
    /// has never been written.
    async fn read_weight(&self) -> Result<i64, StoreError>;
    /// Persist `current_weight` after a change has been acted upon.
    async fn on_weight_update(&self, config: &StoreConfig) -> Result<(), StoreError>;
    /// Create the row from `seed` when absent. Safe to run from several replicas.
    async fn initialize_if_absent(&self, _seed: &StoreConfig) -> Result<(), StoreError> { Ok(()) }
}

/// Single-cluster setups: the in-memory desired weight is the truth.
#[derive(Debug, Clone)]
pub struct NoopWeightStore { weights: WeightReader }

impl NoopWeightStore {
    pub fn new(weights: WeightReader) -> Self { Self { weights } }
}

#[async_trait]
impl WeightStore for NoopWeightStore {
    async fn read_weight(&self) -> Result<i64, StoreError> { Ok(self.weights.snapshot().desired) }
    async fn on_weight_update(&self, _config: &StoreConfig) -> Result<(), StoreError> { Ok(()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeightRow {
    pub cluster_name: String,
    pub desired_weight: i64,
    pub current_weight: i64,
}

impl WeightRow {
    /// Build a row from the numeric attributes found on an item. A row without
    /// `DesiredWeight` is rejected rather than read as zero, which would drain
    /// the cluster.
    pub fn from_attributes(cluster: &str, desired: Option<i64>, current: Option<i64>) -> Result<Self, StoreError> {
        let desired_weight = desired.ok_or_else(|| StoreError::Malformed(format!("{cluster}: missing {DESIRED_WEIGHT_ATTR}")))?;
        Ok(Self { cluster_name: cluster.to_string(), desired_weight, current_weight: current.unwrap_or_default() })
    }
}

/// A single-item conditional write executed inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub update_expression: String,
    pub values: BTreeMap<String, i64>,
    pub condition_expression: Option<String>,
}

impl ItemUpdate {
    pub fn current_weight(config: &StoreConfig) -> Self {
        Self {
            update_expression: format!("SET {CURRENT_WEIGHT_ATTR} = :c"),
            values: BTreeMap::from([(":c".to_string(), config.current_weight)]),
            condition_expression: None,
        }
    }

    pub fn seed(config: &StoreConfig) -> Self {
        Self {
            update_expression: format!("SET {DESIRED_WEIGHT_ATTR} = :d, {CURRENT_WEIGHT_ATTR} = :c"),
            values: BTreeMap::from([
                (":d".to_string(), config.desired_weight),
                (":c".to_string(), config.current_weight),
            ]),
            condition_expression: Some(format!("attribute_not_exists({CLUSTER_NAME_ATTR})")),
        }
    }
}

/// Minimal table surface the durable store needs.
#[async_trait]
pub trait WeightTable: Send + Sync + 'static {
    async fn get_row(&self, cluster: &str) -> Result<Option<WeightRow>, StoreError>;
    async fn transact_update(&self, cluster: &str, update: ItemUpdate) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub struct TableWeightStore<T> {
    cluster_name: String,
    table: T,
}

impl<T: WeightTable> TableWeightStore<T> {
    pub fn new(cluster_name: impl Into<String>, table: T) -> Self {
        Self { cluster_name: cluster_name.into(), table }
    }

    pub fn table(&self) -> &T { &self.table }

    async fn write(&self, update: ItemUpdate) -> Result<(), StoreError> {
        let res = self.table.transact_update(&self.cluster_name, update).await;
        match &res {
            Err(StoreError::TransactionConflict(reason)) => {
                warn!(cluster=%self.cluster_name, %reason, "weight_store.transaction_conflict (more than one controller running?)");
            }
            Err(StoreError::ConditionFailed) | Ok(()) => {}
            Err(e) => warn!(cluster=%self.cluster_name, error=%e, "weight_store.write_failed"),
        }
        res
    }
}

impl<T: WeightTable> TableWeightStore<T> {
    /// Re-read after a cancelled seed and write once more only if the row is still missing.
    async fn settle_concurrent_seed(&self, seed: &StoreConfig) -> Result<(), StoreError> {
        match self.read_weight().await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => match self.write(ItemUpdate::seed(seed)).await {
                Err(StoreError::ConditionFailed) => Ok(()),
                other => other,
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: WeightTable> WeightStore for TableWeightStore<T> {
    async fn read_weight(&self) -> Result<i64, StoreError> {
        match self.table.get_row(&self.cluster_name).await? {
            Some(row) => Ok(row.desired_weight),
            None => Err(StoreError::NotFound(self.cluster_name.clone())),
        }
    }

    async fn on_weight_update(&self, config: &StoreConfig) -> Result<(), StoreError> {
        self.write(ItemUpdate::current_weight(config)).await
    }

    async fn initialize_if_absent(&self, seed: &StoreConfig) -> Result<(), StoreError> {
        match self.read_weight().await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                info!(cluster=%self.cluster_name, desired=seed.desired_weight, current=seed.current_weight, "weight_store.seed");
                match self.write(ItemUpdate::seed(seed)).await {
                    // Another replica seeded the row first.
                    Err(StoreError::ConditionFailed) => Ok(()),
                    // A concurrent seed cancelled ours; settle on whatever is there now.
                    Err(StoreError::TransactionConflict(_)) => self.settle_concurrent_seed(seed).await,
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    #[value(name = "fake")]
    Fake,
    #[value(name = "dynamoDB", alias = "dynamodb")]
    DynamoDb,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fake" => Ok(Self::Fake),
            "dynamoDB" | "dynamodb" => Ok(Self::DynamoDb),
            other => Err(Error::Config(format!("unknown weight backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub backend: BackendKind,
    pub cluster_name: String,
    pub aws_region: String,
    pub table_name: String,
}

pub async fn new_backend(settings: &StoreSettings, weights: WeightReader) -> Result<Arc<dyn WeightStore>, Error> {
    match settings.backend {
        BackendKind::Fake => {
            info!("weight_store.init_fake");
            Ok(Arc::new(NoopWeightStore::new(weights)))
        }
        BackendKind::DynamoDb => {
            #[cfg(feature = "dynamodb")]
            {
                let table = dynamo::DynamoWeightTable::connect(&settings.aws_region, &settings.table_name).await?;
                info!(table=%settings.table_name, region=%settings.aws_region, cluster=%settings.cluster_name, "weight_store.init_dynamodb");
                Ok(Arc::new(TableWeightStore::new(settings.cluster_name.clone(), table)))
            }
            #[cfg(not(feature = "dynamodb"))]
            {
                let _ = weights;
                Err(Error::Config("dynamoDB backend requested but the dynamodb feature is not enabled".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WeightState;
    use crate::test_support::InMemoryWeightTable;

    fn config(desired: i64, current: i64) -> StoreConfig {
        StoreConfig { desired_weight: desired, current_weight: current, health_check_id: None }
    }

    #[tokio::test]
    async fn on_weight_update_only_writes_current() {
        let store = TableWeightStore::new("lolo", InMemoryWeightTable::default());
        store.on_weight_update(&config(10, 35)).await.unwrap();
        let written = store.table().updates();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].update_expression, "SET CurrentWeight = :c");
        assert_eq!(written[0].values, BTreeMap::from([(":c".to_string(), 35)]));
        assert_eq!(written[0].condition_expression, None);
    }

    #[tokio::test]
    async fn seed_writes_both_weights_and_reads_back_desired() {
        let store = TableWeightStore::new("lolo", InMemoryWeightTable::default());
        assert!(store.read_weight().await.unwrap_err().is_not_found());
        store.initialize_if_absent(&config(10, 35)).await.unwrap();
        let written = store.table().updates();
        assert_eq!(written[0].update_expression, "SET DesiredWeight = :d, CurrentWeight = :c");
        assert_eq!(written[0].values, BTreeMap::from([(":d".to_string(), 10), (":c".to_string(), 35)]));
        assert_eq!(store.read_weight().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn seeding_twice_keeps_the_first_row() {
        let store = TableWeightStore::new("lolo", InMemoryWeightTable::default());
        store.initialize_if_absent(&config(50, 35)).await.unwrap();
        store.initialize_if_absent(&config(100, 35)).await.unwrap();
        assert_eq!(store.read_weight().await.unwrap(), 50);
        assert_eq!(store.table().updates().len(), 1, "existing row is not rewritten");
    }

    #[tokio::test]
    async fn concurrent_seed_by_another_replica_is_not_an_error() {
        let table = InMemoryWeightTable::default();
        // Row appears between our read and our conditional write.
        table.insert_after_next_read("lolo", 70, 70);
        let store = TableWeightStore::new("lolo", table);
        store.initialize_if_absent(&config(20, 20)).await.unwrap();
        assert_eq!(store.read_weight().await.unwrap(), 70);
    }

    #[tokio::test]
    async fn seed_cancelled_by_a_concurrent_seed_is_not_an_error() {
        let table = InMemoryWeightTable::default();
        // The other replica's seed lands while ours is cancelled.
        table.insert_after_next_read("lolo", 70, 70);
        table.fail_next_write(StoreError::TransactionConflict("TransactionConflict".into()));
        let store = TableWeightStore::new("lolo", table);
        store.initialize_if_absent(&config(20, 20)).await.unwrap();
        assert_eq!(store.read_weight().await.unwrap(), 70);
        assert!(store.table().updates().is_empty(), "the winner's row is kept");
    }

    #[tokio::test]
    async fn seed_retries_once_when_the_cancelled_row_never_appeared() {
        let table = InMemoryWeightTable::default();
        table.fail_next_write(StoreError::TransactionConflict("TransactionConflict".into()));
        let store = TableWeightStore::new("lolo", table);
        store.initialize_if_absent(&config(20, 15)).await.unwrap();
        assert_eq!(
            store.table().row("lolo"),
            Some(BTreeMap::from([(DESIRED_WEIGHT_ATTR.to_string(), 20), (CURRENT_WEIGHT_ATTR.to_string(), 15)]))
        );
    }

    #[tokio::test]
    async fn conflicting_transaction_is_reported() {
        let table = InMemoryWeightTable::default();
        table.fail_next_write(StoreError::TransactionConflict("in progress".into()));
        let store = TableWeightStore::new("lolo", table);
        let err = store.on_weight_update(&config(10, 10)).await.unwrap_err();
        assert!(matches!(err, StoreError::TransactionConflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn noop_store_reads_in_memory_desired() {
        let (mut writer, reader) = WeightState::new(WeightSnapshot::new(200, 0, None));
        let store = NoopWeightStore::new(reader);
        assert_eq!(store.read_weight().await.unwrap(), 200);
        writer.publish_desired(30);
        assert_eq!(store.read_weight().await.unwrap(), 30);
        store.on_weight_update(&StoreConfig::default()).await.unwrap();
    }

    #[test]
    fn backend_names() {
        assert_eq!("fake".parse::<BackendKind>().unwrap(), BackendKind::Fake);
        assert_eq!("dynamoDB".parse::<BackendKind>().unwrap(), BackendKind::DynamoDb);
        assert!(matches!("foolanito".parse::<BackendKind>(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn fake_backend_builds_without_cloud_access() {
        let (_writer, reader) = WeightState::new(WeightSnapshot::new(5, 5, None));
        let settings = StoreSettings {
            backend: BackendKind::Fake,
            cluster_name: "foo".into(),
            aws_region: String::new(),
            table_name: String::new(),
        };
        let store = new_backend(&settings, reader).await.unwrap();
        assert_eq!(store.read_weight().await.unwrap(), 5);
    }

    #[test]
    fn row_without_desired_weight_is_malformed() {
        assert!(matches!(WeightRow::from_attributes("c", None, Some(3)), Err(StoreError::Malformed(_))));
        assert_eq!(WeightRow::from_attributes("c", Some(4), None).unwrap().current_weight, 0);
    }
}
