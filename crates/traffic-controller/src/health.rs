//! Backing capacity detection.
//!
//! A host is only advertised while every service behind it has ready
//! addresses. Two failure modes are deliberately asymmetric: a missing
//! Endpoints object means no capacity, while any other read failure is
//! treated as healthy so a flaky API server does not flap routes to zero.

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::IngressRule;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::cluster::ClusterApi;

/// Distinct backend service names referenced by a rule's paths.
pub fn rule_services(rule: &IngressRule) -> BTreeSet<&str> {
    rule.http
        .iter()
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .map(|svc| svc.name.as_str())
        .collect()
}

/// At least one subset, and no subset without ready addresses.
pub fn endpoints_have_pods(endpoints: &Endpoints) -> bool {
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();
    !subsets.is_empty()
        && subsets
            .iter()
            .all(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

pub async fn rule_has_pods(cluster: &dyn ClusterApi, namespace: &str, rule: &IngressRule) -> bool {
    // Rules without an http section, or whose paths name no service, carry no capacity.
    let services = rule_services(rule);
    if services.is_empty() {
        return false;
    }
    for service in services {
        match cluster.get_endpoints(namespace, service).await {
            Ok(Some(endpoints)) => {
                if endpoints.metadata.deletion_timestamp.is_some() {
                    debug!(namespace, service, "health.endpoints_terminating");
                    return false;
                }
                if !endpoints_have_pods(&endpoints) {
                    // One starved service moves the whole host elsewhere.
                    debug!(namespace, service, "health.no_ready_addresses");
                    return false;
                }
            }
            Ok(None) => {
                debug!(namespace, service, "health.endpoints_not_found");
                return false;
            }
            Err(e) => {
                warn!(namespace, service, error=%e, "health.endpoints_fetch_failed (assuming healthy)");
            }
        }
    }
    true
}
