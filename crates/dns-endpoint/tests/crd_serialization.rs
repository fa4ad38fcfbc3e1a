use dns_endpoint::{DNSEndpoint, DNSEndpointSpec, Endpoint, ProviderSpecificProperty, WEIGHT_PROPERTY};
use kube::{CustomResourceExt, Resource};
use serde_json::json;

fn weighted_endpoint() -> Endpoint {
    Endpoint {
        dns_name: "app.example.io".into(),
        targets: vec!["lb.example.net".into()],
        record_type: "CNAME".into(),
        set_identifier: "cluster-a".into(),
        provider_specific: vec![ProviderSpecificProperty::new(WEIGHT_PROPERTY, "40")],
        ..Default::default()
    }
}

#[test]
fn endpoint_uses_external_dns_field_names() {
    let j = serde_json::to_value(weighted_endpoint()).unwrap();
    assert_eq!(
        j,
        json!({
            "dnsName": "app.example.io",
            "targets": ["lb.example.net"],
            "recordType": "CNAME",
            "setIdentifier": "cluster-a",
            "providerSpecific": [{"name": "aws/weight", "value": "40"}]
        })
    );
}

#[test]
fn spec_accepts_objects_written_by_other_tools() {
    let raw = json!({
        "endpoints": [{
            "dnsName": "app.example.io",
            "recordTTL": 60,
            "labels": {"owner": "someone-else"}
        }]
    });
    let spec: DNSEndpointSpec = serde_json::from_value(raw).unwrap();
    assert_eq!(spec.endpoints[0].record_ttl, Some(60));
    assert!(spec.endpoints[0].targets.is_empty());
    assert_eq!(spec.endpoints[0].provider_value(WEIGHT_PROPERTY), None);
}

#[test]
fn crd_matches_external_dns_group() {
    let crd = DNSEndpoint::crd();
    assert_eq!(crd.spec.group, "externaldns.k8s.io");
    assert_eq!(crd.spec.names.plural, "dnsendpoints");
    assert_eq!(DNSEndpoint::api_version(&()), "externaldns.k8s.io/v1alpha1");
}
