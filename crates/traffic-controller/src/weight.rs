//! Per-route weight from the cluster's desired weight and an optional
//! percentage annotation on the Ingress.

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::error::{Error, Result};
use crate::state::WeightSnapshot;

pub const TRAFFIC_WEIGHT_ANNOTATION: &str = "traffic-weight";
pub const MAX_WEIGHT: i64 = 100;

/// `<prefix>/traffic-weight`
pub fn annotation_key(prefix: &str) -> String {
    format!("{prefix}/{TRAFFIC_WEIGHT_ANNOTATION}")
}

/// `ceil(min(desired, 100) / 100 * min(override, 100))`.
///
/// Both inputs must be non-negative. The product is formed before dividing
/// so integral inputs never pick up rounding noise ahead of the ceiling.
pub fn calculate_weight(desired: i64, override_pct: f64) -> Result<u32> {
    if desired < 0 {
        return Err(Error::NegativeWeight(desired as f64));
    }
    if override_pct < 0.0 {
        return Err(Error::NegativeWeight(override_pct));
    }
    let desired = desired.min(MAX_WEIGHT) as f64;
    let override_pct = override_pct.min(MAX_WEIGHT as f64);
    Ok((desired * override_pct / MAX_WEIGHT as f64).ceil() as u32)
}

/// Weight for every record synthesized from `ingress`.
///
/// Without the annotation the cluster's desired weight is used as is, so a
/// desired weight above 100 is not clamped on this path.
pub fn route_weight(snapshot: &WeightSnapshot, ingress: &Ingress, annotation_key: &str) -> Result<u32> {
    if snapshot.desired < 0 {
        return Err(Error::NegativeWeight(snapshot.desired as f64));
    }
    match ingress.annotations().get(annotation_key) {
        Some(raw) => calculate_weight(snapshot.desired, parse_override(annotation_key, raw)?),
        None => Ok(u32::try_from(snapshot.desired).unwrap_or(u32::MAX)),
    }
}

fn parse_override(key: &str, raw: &str) -> Result<f64> {
    let parse_error = || Error::AnnotationParse { key: key.to_string(), value: raw.to_string() };
    let value: f64 = raw.parse().map_err(|_| parse_error())?;
    if value.is_nan() {
        return Err(parse_error());
    }
    Ok(value)
}
