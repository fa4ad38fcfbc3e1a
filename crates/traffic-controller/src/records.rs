//! Per-route DNS record synthesis.
//!
//! Every Ingress owns at most one `DNSEndpoint` with the same name and
//! namespace. The pipeline here decides whether that object should exist and
//! what it should contain; the controller and the deletion watcher only feed
//! it keys.

use dns_endpoint::{
    DNSEndpoint, DNSEndpointSpec, Endpoint, ProviderSpecificProperty, HEALTH_CHECK_ID_PROPERTY,
    RECORD_TYPE_CNAME, WEIGHT_PROPERTY,
};
use k8s_openapi::api::networking::v1::{Ingress, IngressRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, RouteKey};
use crate::error::Result;
use crate::health::rule_has_pods;
use crate::state::{WeightReader, WeightSnapshot};
use crate::weight::{annotation_key, route_weight};

/// Target advertised when running without a real load balancer.
pub const DEV_MODE_TARGET: &str = "devmode";
/// Retry delay while the previous record is still being removed.
pub const RECORD_DELETION_RETRY: Duration = Duration::from_secs(5);

/// Optional `key=value` annotation a route must carry to be managed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationFilter {
    expected: Option<(String, String)>,
}

impl AnnotationFilter {
    /// Anything other than exactly one `=` after a non-empty key yields a
    /// filter matching every route.
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split('=').collect();
        match parts.as_slice() {
            [key, value] if !key.is_empty() => Self { expected: Some((key.to_string(), value.to_string())) },
            _ => Self::default(),
        }
    }

    pub fn is_match_all(&self) -> bool { self.expected.is_none() }

    pub fn matches(&self, ingress: &Ingress) -> bool {
        match &self.expected {
            None => true,
            Some((key, value)) => ingress.annotations().get(key) == Some(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub cluster_name: String,
    pub binding_domain: String,
    pub annotation_prefix: String,
    pub annotation_filter: AnnotationFilter,
    pub dev_mode: bool,
}

impl RecordSettings {
    pub fn weight_annotation(&self) -> String { annotation_key(&self.annotation_prefix) }
}

/// Rules with a non-empty host under `binding_domain`.
pub fn rules_to_bind<'a>(rules: &'a [IngressRule], binding_domain: &'a str) -> impl Iterator<Item = &'a IngressRule> + 'a {
    rules.iter().filter(move |rule| {
        rule.host.as_deref().is_some_and(|host| !host.is_empty() && host.ends_with(binding_domain))
    })
}

pub fn target_for(ingress: &Ingress, dev_mode: bool) -> Option<String> {
    if dev_mode {
        return Some(DEV_MODE_TARGET.to_string());
    }
    ingress
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .hostname
        .clone()
        .filter(|h| !h.is_empty())
}

/// Weight assigned to one bound host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWeight {
    pub host: String,
    pub weight: u32,
}

/// Desired `DNSEndpoint` for `ingress`: same identity, a single controller
/// owner reference and one weighted CNAME per host.
pub fn build_dns_endpoint(
    ingress: &Ingress,
    target: &str,
    cluster_name: &str,
    health_check_id: Option<&str>,
    hosts: &[HostWeight],
) -> DNSEndpoint {
    let endpoints = hosts
        .iter()
        .map(|h| {
            let mut properties = vec![ProviderSpecificProperty::new(WEIGHT_PROPERTY, h.weight.to_string())];
            if let Some(id) = health_check_id {
                properties.push(ProviderSpecificProperty::new(HEALTH_CHECK_ID_PROPERTY, id));
            }
            Endpoint {
                dns_name: h.host.clone(),
                targets: vec![target.to_string()],
                record_type: RECORD_TYPE_CNAME.to_string(),
                set_identifier: cluster_name.to_string(),
                provider_specific: properties,
                ..Default::default()
            }
        })
        .collect();
    let mut record = DNSEndpoint::new(&ingress.name_any(), DNSEndpointSpec { endpoints });
    record.metadata = ObjectMeta {
        name: Some(ingress.name_any()),
        namespace: ingress.namespace(),
        owner_references: ingress.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    };
    record
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    FilterMismatch,
    NoTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied(ApplyOutcome),
    Deleted { existed: bool },
    Skipped(SkipReason),
    /// Try again after the given delay.
    Deferred(Duration),
    /// Weight could not be computed; the existing record was left alone.
    Invalid,
    /// The route is going away; the record follows through garbage collection.
    RouteTerminating,
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied(ApplyOutcome::Created) => "created",
            Self::Applied(ApplyOutcome::Updated) => "updated",
            Self::Applied(ApplyOutcome::Unchanged) => "unchanged",
            Self::Deleted { .. } => "deleted",
            Self::Skipped(_) => "skipped",
            Self::Deferred(_) => "deferred",
            Self::Invalid => "invalid",
            Self::RouteTerminating => "terminating",
        }
    }
}

pub struct RoutePipeline {
    cluster: Arc<dyn ClusterApi>,
    weights: WeightReader,
    settings: RecordSettings,
    weight_annotation: String,
}

impl RoutePipeline {
    pub fn new(cluster: Arc<dyn ClusterApi>, weights: WeightReader, settings: RecordSettings) -> Self {
        let weight_annotation = settings.weight_annotation();
        Self { cluster, weights, settings, weight_annotation }
    }

    pub async fn reconcile(&self, key: &RouteKey) -> Result<RouteOutcome> {
        let Some(ingress) = self.cluster.get_ingress(&key.namespace, &key.name).await? else {
            let existed = self.cluster.delete_dns_endpoint(&key.namespace, &key.name).await?;
            info!(route=%key, existed, "records.route_gone_record_deleted");
            return Ok(RouteOutcome::Deleted { existed });
        };
        if ingress.meta().deletion_timestamp.is_some() {
            debug!(route=%key, "records.route_terminating");
            return Ok(RouteOutcome::RouteTerminating);
        }
        if self.record_being_deleted(key).await {
            info!(route=%key, "records.record_being_removed_requeue");
            return Ok(RouteOutcome::Deferred(RECORD_DELETION_RETRY));
        }
        self.sync_records(&ingress).await
    }

    async fn record_being_deleted(&self, key: &RouteKey) -> bool {
        match self.cluster.get_dns_endpoint(&key.namespace, &key.name).await {
            Ok(Some(record)) => record.metadata.deletion_timestamp.is_some(),
            // Missing or unreadable: carry on and let the apply surface real problems.
            Ok(None) | Err(_) => false,
        }
    }

    async fn sync_records(&self, ingress: &Ingress) -> Result<RouteOutcome> {
        let key = RouteKey::of(ingress);
        if !self.settings.annotation_filter.matches(ingress) {
            debug!(route=%key, "records.filter_mismatch_skip");
            return Ok(RouteOutcome::Skipped(SkipReason::FilterMismatch));
        }
        let Some(target) = target_for(ingress, self.settings.dev_mode) else {
            debug!(route=%key, "records.no_target_skip");
            return Ok(RouteOutcome::Skipped(SkipReason::NoTarget));
        };
        let snapshot = self.weights.snapshot();
        let desired = match self.desired_record(ingress, &target, &snapshot).await {
            Ok(record) => record,
            Err(e) => {
                error!(route=%key, error=%e, "records.weight_calculation_failed (record left untouched)");
                return Ok(RouteOutcome::Invalid);
            }
        };
        Ok(RouteOutcome::Applied(self.apply(&key, desired).await?))
    }

    /// Desired record for the current snapshot. Hosts whose backing services
    /// have no ready addresses are advertised with weight zero.
    pub async fn desired_record(&self, ingress: &Ingress, target: &str, snapshot: &WeightSnapshot) -> Result<DNSEndpoint> {
        let weight = route_weight(snapshot, ingress, &self.weight_annotation)?;
        let namespace = ingress.namespace().unwrap_or_default();
        let rules = ingress.spec.as_ref().and_then(|s| s.rules.as_deref()).unwrap_or_default();
        let mut hosts = Vec::new();
        for rule in rules_to_bind(rules, &self.settings.binding_domain) {
            let healthy = rule_has_pods(self.cluster.as_ref(), &namespace, rule).await;
            hosts.push(HostWeight {
                host: rule.host.clone().unwrap_or_default(),
                weight: if healthy { weight } else { 0 },
            });
        }
        if ingress.meta().uid.is_none() {
            warn!(route=%RouteKey::of(ingress), "records.route_without_uid (record will not be garbage collected)");
        }
        Ok(build_dns_endpoint(
            ingress,
            target,
            &self.settings.cluster_name,
            snapshot.health_check_id.as_deref(),
            &hosts,
        ))
    }

    async fn apply(&self, key: &RouteKey, desired: DNSEndpoint) -> Result<ApplyOutcome> {
        let outcome = match self.cluster.get_dns_endpoint(&key.namespace, &key.name).await? {
            Some(existing)
                if existing.spec == desired.spec
                    && existing.metadata.owner_references == desired.metadata.owner_references =>
            {
                return Ok(ApplyOutcome::Unchanged);
            }
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        self.cluster.apply_dns_endpoint(&desired).await?;
        info!(route=%key, outcome=?outcome, hosts=desired.spec.endpoints.len(), "records.applied");
        Ok(outcome)
    }
}
