//! In-memory collaborators and fixtures shared by unit and integration tests.
use async_trait::async_trait;
use dns_endpoint::DNSEndpoint;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressLoadBalancerIngress,
    IngressLoadBalancerStatus, IngressRule, IngressServiceBackend, IngressSpec, IngressStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::cluster::{ClusterApi, RouteKey};
use crate::error::StoreError;
use crate::store::{ItemUpdate, StoreConfig, WeightRow, WeightStore, WeightTable, CURRENT_WEIGHT_ATTR, DESIRED_WEIGHT_ATTR};

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("injected {reason}"),
        reason: reason.into(),
        code,
    })
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() }
}

/// A rule whose paths point at `services`, one path each.
pub fn rule(host: &str, services: &[&str]) -> IngressRule {
    let paths = services
        .iter()
        .enumerate()
        .map(|(i, svc)| HTTPIngressPath {
            path: Some(format!("/{i}")),
            path_type: "Prefix".into(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend { name: svc.to_string(), port: None }),
                resource: None,
            },
        })
        .collect();
    IngressRule { host: Some(host.into()), http: Some(HTTPIngressRuleValue { paths }) }
}

#[derive(Debug, Clone)]
pub struct IngressBuilder {
    ingress: Ingress,
}

impl IngressBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut metadata = meta(namespace, name);
        metadata.uid = Some(format!("uid-{namespace}-{name}"));
        Self { ingress: Ingress { metadata, spec: Some(IngressSpec::default()), status: None } }
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.ingress.annotations_mut().insert(key.into(), value.into());
        self
    }

    pub fn rule(mut self, host: &str, services: &[&str]) -> Self {
        self.push_rule(rule(host, services));
        self
    }

    pub fn rule_without_http(mut self, host: &str) -> Self {
        self.push_rule(IngressRule { host: Some(host.into()), http: None });
        self
    }

    fn push_rule(&mut self, rule: IngressRule) {
        let spec = self.ingress.spec.get_or_insert_with(IngressSpec::default);
        spec.rules.get_or_insert_with(Vec::new).push(rule);
    }

    pub fn lb_hostname(mut self, hostname: &str) -> Self {
        self.ingress.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress { hostname: Some(hostname.into()), ..Default::default() }]),
            }),
        });
        self
    }

    pub fn terminating(mut self) -> Self {
        self.ingress.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        self
    }

    pub fn build(self) -> Ingress { self.ingress }
}

/// Endpoints with one subset holding one ready address.
pub fn endpoints(namespace: &str, name: &str) -> Endpoints {
    Endpoints {
        metadata: meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress { ip: "10.0.0.1".into(), ..Default::default() }]),
            ..Default::default()
        }]),
    }
}

pub fn endpoints_without_subsets(namespace: &str, name: &str) -> Endpoints {
    Endpoints { metadata: meta(namespace, name), subsets: None }
}

/// One ready subset next to one with no addresses.
pub fn endpoints_with_empty_subset(namespace: &str, name: &str) -> Endpoints {
    let mut ep = endpoints(namespace, name);
    if let Some(subsets) = ep.subsets.as_mut() {
        subsets.push(EndpointSubset { addresses: Some(vec![]), ..Default::default() });
    }
    ep
}

pub fn terminating(mut endpoints: Endpoints) -> Endpoints {
    endpoints.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    endpoints
}

#[derive(Default)]
struct ClusterObjects {
    ingresses: BTreeMap<RouteKey, Ingress>,
    endpoints: BTreeMap<RouteKey, Endpoints>,
    dns_endpoints: BTreeMap<RouteKey, DNSEndpoint>,
    endpoint_errors: BTreeMap<RouteKey, u16>,
    list_error: Option<u16>,
    applied: Vec<RouteKey>,
    deleted: Vec<RouteKey>,
}

/// Cluster double: plain maps plus a log of writes.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<ClusterObjects>,
}

impl InMemoryCluster {
    fn with<R>(&self, f: impl FnOnce(&mut ClusterObjects) -> R) -> R {
        let mut guard = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn add_ingress(&self, ingress: Ingress) {
        self.with(|o| o.ingresses.insert(RouteKey::of(&ingress), ingress));
    }

    pub fn remove_ingress(&self, namespace: &str, name: &str) {
        self.with(|o| o.ingresses.remove(&RouteKey::new(namespace, name)));
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.with(|o| o.endpoints.insert(RouteKey::of(&endpoints), endpoints));
    }

    pub fn add_dns_endpoint(&self, record: DNSEndpoint) {
        self.with(|o| o.dns_endpoints.insert(RouteKey::of(&record), record));
    }

    /// Fetching these endpoints fails with an API error carrying `code`.
    pub fn fail_endpoints(&self, namespace: &str, name: &str, error: kube::Error) {
        let code = match error {
            kube::Error::Api(ae) => ae.code,
            _ => 500,
        };
        self.with(|o| o.endpoint_errors.insert(RouteKey::new(namespace, name), code));
    }

    pub fn fail_listing(&self, code: u16) {
        self.with(|o| o.list_error = Some(code));
    }

    pub fn dns_endpoint(&self, namespace: &str, name: &str) -> Option<DNSEndpoint> {
        self.with(|o| o.dns_endpoints.get(&RouteKey::new(namespace, name)).cloned())
    }

    pub fn dns_endpoint_count(&self) -> usize {
        self.with(|o| o.dns_endpoints.len())
    }

    pub fn applied(&self) -> Vec<RouteKey> {
        self.with(|o| o.applied.clone())
    }

    pub fn deleted(&self) -> Vec<RouteKey> {
        self.with(|o| o.deleted.clone())
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_ingresses(&self) -> Result<Vec<Ingress>, kube::Error> {
        self.with(|o| match o.list_error {
            Some(code) => Err(api_error(code, "ListFailed")),
            None => Ok(o.ingresses.values().cloned().collect()),
        })
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error> {
        Ok(self.with(|o| o.ingresses.get(&RouteKey::new(namespace, name)).cloned()))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error> {
        let key = RouteKey::new(namespace, name);
        self.with(|o| match o.endpoint_errors.get(&key) {
            Some(code) => Err(api_error(*code, "InternalError")),
            None => Ok(o.endpoints.get(&key).cloned()),
        })
    }

    async fn get_dns_endpoint(&self, namespace: &str, name: &str) -> Result<Option<DNSEndpoint>, kube::Error> {
        Ok(self.dns_endpoint(namespace, name))
    }

    async fn apply_dns_endpoint(&self, endpoint: &DNSEndpoint) -> Result<(), kube::Error> {
        let key = RouteKey::of(endpoint);
        self.with(|o| {
            o.applied.push(key.clone());
            o.dns_endpoints.insert(key, endpoint.clone());
        });
        Ok(())
    }

    async fn delete_dns_endpoint(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let key = RouteKey::new(namespace, name);
        Ok(self.with(|o| {
            o.deleted.push(key.clone());
            o.dns_endpoints.remove(&key).is_some()
        }))
    }
}

#[derive(Default)]
struct TableState {
    rows: BTreeMap<String, BTreeMap<String, i64>>,
    updates: Vec<ItemUpdate>,
    failures: VecDeque<StoreError>,
    insert_after_read: Option<(String, i64, i64)>,
}

/// Weight table double that understands the update shapes the store emits.
#[derive(Default)]
pub struct InMemoryWeightTable {
    state: Mutex<TableState>,
}

impl InMemoryWeightTable {
    fn with<R>(&self, f: impl FnOnce(&mut TableState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn insert_row(&self, cluster: &str, desired: i64, current: i64) {
        self.with(|s| {
            s.rows.insert(
                cluster.into(),
                BTreeMap::from([(DESIRED_WEIGHT_ATTR.into(), desired), (CURRENT_WEIGHT_ATTR.into(), current)]),
            )
        });
    }

    /// Simulate another writer creating the row right after our next read.
    pub fn insert_after_next_read(&self, cluster: &str, desired: i64, current: i64) {
        self.with(|s| s.insert_after_read = Some((cluster.into(), desired, current)));
    }

    pub fn fail_next_write(&self, error: StoreError) {
        self.with(|s| s.failures.push_back(error));
    }

    /// Successful writes, oldest first.
    pub fn updates(&self) -> Vec<ItemUpdate> {
        self.with(|s| s.updates.clone())
    }

    pub fn row(&self, cluster: &str) -> Option<BTreeMap<String, i64>> {
        self.with(|s| s.rows.get(cluster).cloned())
    }
}

/// `SET A = :a, B = :b` into `[(A, :a), (B, :b)]`.
fn assignments(expression: &str) -> Vec<(String, String)> {
    expression
        .trim_start_matches("SET ")
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(attr, placeholder)| (attr.trim().to_string(), placeholder.trim().to_string()))
        .collect()
}

#[async_trait]
impl WeightTable for InMemoryWeightTable {
    async fn get_row(&self, cluster: &str) -> Result<Option<WeightRow>, StoreError> {
        self.with(|s| {
            let row = s.rows.get(cluster).cloned();
            if let Some((name, desired, current)) = s.insert_after_read.take() {
                s.rows.insert(
                    name,
                    BTreeMap::from([(DESIRED_WEIGHT_ATTR.into(), desired), (CURRENT_WEIGHT_ATTR.into(), current)]),
                );
            }
            row.map(|attrs| {
                WeightRow::from_attributes(cluster, attrs.get(DESIRED_WEIGHT_ATTR).copied(), attrs.get(CURRENT_WEIGHT_ATTR).copied())
            })
            .transpose()
        })
    }

    async fn transact_update(&self, cluster: &str, update: ItemUpdate) -> Result<(), StoreError> {
        self.with(|s| {
            if let Some(err) = s.failures.pop_front() {
                return Err(err);
            }
            let exists = s.rows.contains_key(cluster);
            if update.condition_expression.as_deref().is_some_and(|c| c.starts_with("attribute_not_exists")) && exists {
                return Err(StoreError::ConditionFailed);
            }
            let row = s.rows.entry(cluster.to_string()).or_default();
            for (attr, placeholder) in assignments(&update.update_expression) {
                let value = update
                    .values
                    .get(&placeholder)
                    .copied()
                    .ok_or_else(|| StoreError::Malformed(format!("unbound placeholder {placeholder}")))?;
                row.insert(attr, value);
            }
            s.updates.push(update);
            Ok(())
        })
    }
}

/// Weight store whose answers are set by the test.
pub struct ScriptedWeightStore {
    weight: AtomicI64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    updates: Mutex<Vec<StoreConfig>>,
}

impl ScriptedWeightStore {
    pub fn new(weight: i64) -> Self {
        Self {
            weight: AtomicI64::new(weight),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn set_weight(&self, weight: i64) { self.weight.store(weight, Ordering::SeqCst); }
    pub fn fail_reads(&self, fail: bool) { self.fail_reads.store(fail, Ordering::SeqCst); }
    pub fn fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    pub fn updates(&self) -> Vec<StoreConfig> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WeightStore for ScriptedWeightStore {
    async fn read_weight(&self) -> Result<i64, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("injected read failure")));
        }
        Ok(self.weight.load(Ordering::SeqCst))
    }

    async fn on_weight_update(&self, config: &StoreConfig) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::TransactionConflict("injected".into()));
        }
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).push(config.clone());
        Ok(())
    }
}
