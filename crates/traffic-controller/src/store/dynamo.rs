use async_trait::async_trait;
use aws_config::{retry::RetryConfig, BehaviorVersion};
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, TransactWriteItem, Update};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{ItemUpdate, WeightRow, WeightTable, CLUSTER_NAME_ATTR, CURRENT_WEIGHT_ATTR, DESIRED_WEIGHT_ATTR};
use crate::error::{Error, StoreError};

const MAX_ATTEMPTS: u32 = 10;
const ENDPOINT_ENV: &str = "TRAFFIC_CONTROLLER_DYNAMODB_ENDPOINT";

#[derive(Clone)]
pub struct DynamoWeightTable { client: Client, table_name: String }

impl std::fmt::Debug for DynamoWeightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoWeightTable").field("table_name", &self.table_name).finish()
    }
}

impl DynamoWeightTable {
    pub async fn connect(region: &str, table_name: &str) -> Result<Self, Error> {
        if region.is_empty() {
            return Err(Error::Config("missing aws region (required)".into()));
        }
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS))
            .load()
            .await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Ok(ep) = std::env::var(ENDPOINT_ENV) {
            if !ep.is_empty() {
                info!(endpoint=%ep, "weight_store.dynamodb_endpoint_override");
                builder = builder.endpoint_url(ep);
            }
        }
        Ok(Self::from_client(Client::from_conf(builder.build()), table_name))
    }

    pub fn from_client(client: Client, table_name: impl Into<String>) -> Self {
        Self { client, table_name: table_name.into() }
    }
}

fn number_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<Option<i64>, StoreError> {
    match item.get(name) {
        None => Ok(None),
        Some(AttributeValue::N(n)) => n
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::Malformed(format!("{name}={n}: {e}"))),
        Some(other) => Err(StoreError::Malformed(format!("{name} is not a number: {other:?}"))),
    }
}

fn classify_write_error(err: TransactWriteItemsError) -> StoreError {
    match err {
        TransactWriteItemsError::TransactionCanceledException(e) => {
            let condition_failed = e
                .cancellation_reasons()
                .iter()
                .any(|r| r.code() == Some("ConditionalCheckFailed"));
            if condition_failed {
                StoreError::ConditionFailed
            } else {
                StoreError::TransactionConflict(e.message().unwrap_or("transaction canceled").to_string())
            }
        }
        TransactWriteItemsError::TransactionInProgressException(e) => {
            StoreError::TransactionConflict(e.message().unwrap_or("transaction in progress").to_string())
        }
        other => StoreError::Backend(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl WeightTable for DynamoWeightTable {
    async fn get_row(&self, cluster: &str) -> Result<Option<WeightRow>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(CLUSTER_NAME_ATTR, AttributeValue::S(cluster.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?;
        let Some(item) = out.item().filter(|i| !i.is_empty()) else {
            return Ok(None);
        };
        let row = WeightRow::from_attributes(
            cluster,
            number_attr(item, DESIRED_WEIGHT_ATTR)?,
            number_attr(item, CURRENT_WEIGHT_ATTR)?,
        )?;
        debug!(cluster, desired=row.desired_weight, current=row.current_weight, "weight_store.row");
        Ok(Some(row))
    }

    async fn transact_update(&self, cluster: &str, update: ItemUpdate) -> Result<(), StoreError> {
        let mut builder = Update::builder()
            .table_name(&self.table_name)
            .key(CLUSTER_NAME_ATTR, AttributeValue::S(cluster.to_string()))
            .update_expression(update.update_expression);
        for (placeholder, value) in update.values {
            builder = builder.expression_attribute_values(placeholder, AttributeValue::N(value.to_string()));
        }
        if let Some(condition) = update.condition_expression {
            builder = builder.condition_expression(condition);
        }
        let update = builder.build().map_err(|e| StoreError::Backend(e.into()))?;
        self.client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().update(update).build())
            .send()
            .await
            .map_err(|e| classify_write_error(e.into_service_error()))?;
        Ok(())
    }
}
