use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::reconcile_loop::DEFAULT_POLL_INTERVAL;
use crate::records::{AnnotationFilter, RecordSettings};
use crate::store::{BackendKind, StoreSettings};

#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat { Auto, Text, Json }

/// Every flag can also be set through `TRAFFIC_CONTROLLER_<FLAG>`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "traffic-controller",
    version,
    about = "Weighted DNS records for Ingresses across peer clusters",
    long_about = "Weighted DNS records for Ingresses across peer clusters.\n\n\
        There is no leader election: deploy a single replica per cluster. \
        Extra replicas repeat every fan-out and race on the shared weight row."
)]
pub struct Args {
    /// Identifier of this cluster; used as the record set identifier and the store key
    #[arg(long, env = "TRAFFIC_CONTROLLER_CLUSTER_NAME")]
    pub cluster_name: String,
    /// Only Ingress hosts ending with this suffix get records
    #[arg(long, env = "TRAFFIC_CONTROLLER_BINDING_DOMAIN", default_value = "")]
    pub binding_domain: String,
    /// Where the desired weight is read from: fake|dynamoDB
    #[arg(long, env = "TRAFFIC_CONTROLLER_BACKEND_TYPE", value_enum, default_value = "fake")]
    pub backend_type: BackendKind,
    #[arg(long, env = "TRAFFIC_CONTROLLER_AWS_REGION", default_value = "eu-west-1")]
    pub aws_region: String,
    #[arg(long, env = "TRAFFIC_CONTROLLER_TABLE_NAME", default_value = "traffic-controller")]
    pub table_name: String,
    /// Route53 health check attached to every record
    #[arg(long, env = "TRAFFIC_CONTROLLER_AWS_HEALTH_CHECK_ID")]
    pub aws_health_check_id: Option<String>,
    /// Only manage Ingresses carrying this key=value annotation
    #[arg(long, env = "TRAFFIC_CONTROLLER_ANNOTATION_FILTER", default_value = "")]
    pub annotation_filter: String,
    #[arg(long, env = "TRAFFIC_CONTROLLER_ANNOTATION_PREFIX", default_value = "dns.adevinta.com")]
    pub annotation_prefix: String,
    /// Weight written to the store when this cluster has no row yet
    #[arg(long, env = "TRAFFIC_CONTROLLER_INITIAL_WEIGHT", default_value_t = 0, allow_negative_numbers = true)]
    pub initial_weight: i64,
    /// Use a fixed record target instead of the load balancer hostname
    #[arg(long, env = "TRAFFIC_CONTROLLER_DEV_MODE")]
    pub dev_mode: bool,
    #[arg(long, env = "TRAFFIC_CONTROLLER_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,
    #[arg(long, env = "TRAFFIC_CONTROLLER_WEIGHT_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub weight_poll_interval_secs: u64,
    /// trace|debug|info|warn|error
    #[arg(long, env = "TRAFFIC_CONTROLLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "TRAFFIC_CONTROLLER_LOG_FORMAT", value_enum, default_value = "auto")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub records: RecordSettings,
    pub initial_weight: i64,
    pub health_check_id: Option<String>,
    pub metrics_addr: SocketAddr,
    pub poll_interval: Duration,
}

impl Args {
    pub fn into_settings(self) -> Result<Settings, Error> {
        let cluster_name = self.cluster_name.trim().to_string();
        if cluster_name.is_empty() {
            return Err(Error::Config("cluster name must not be empty".into()));
        }
        if self.initial_weight < 0 {
            return Err(Error::Config(format!("initial weight {} is negative", self.initial_weight)));
        }
        if self.backend_type == BackendKind::DynamoDb && self.aws_region.trim().is_empty() {
            return Err(Error::Config("the dynamoDB backend needs an AWS region".into()));
        }
        if self.weight_poll_interval_secs == 0 {
            return Err(Error::Config("weight poll interval must be at least one second".into()));
        }
        Ok(Settings {
            store: StoreSettings {
                backend: self.backend_type,
                cluster_name: cluster_name.clone(),
                aws_region: self.aws_region,
                table_name: self.table_name,
            },
            records: RecordSettings {
                cluster_name,
                binding_domain: self.binding_domain,
                annotation_prefix: self.annotation_prefix,
                annotation_filter: AnnotationFilter::parse(&self.annotation_filter),
                dev_mode: self.dev_mode,
            },
            initial_weight: self.initial_weight,
            health_check_id: self.aws_health_check_id.filter(|id| !id.is_empty()),
            metrics_addr: self.metrics_addr,
            poll_interval: Duration::from_secs(self.weight_poll_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Settings, Error> {
        let mut argv = vec!["traffic-controller"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).expect("valid flags").into_settings()
    }

    #[test]
    fn defaults() {
        let s = parse(&["--cluster-name", "c1"]).unwrap();
        assert_eq!(s.store.backend, BackendKind::Fake);
        assert_eq!(s.store.aws_region, "eu-west-1");
        assert_eq!(s.store.table_name, "traffic-controller");
        assert_eq!(s.records.annotation_prefix, "dns.adevinta.com");
        assert!(s.records.annotation_filter.is_match_all());
        assert_eq!(s.initial_weight, 0);
        assert_eq!(s.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(DEFAULT_POLL_INTERVAL, Duration::from_secs(20));
        assert_eq!(s.metrics_addr.port(), 8080);
        assert_eq!(s.health_check_id, None);
    }

    #[test]
    fn backend_names_follow_the_flag_values() {
        let s = parse(&["--cluster-name", "c1", "--backend-type", "dynamoDB"]).unwrap();
        assert_eq!(s.store.backend, BackendKind::DynamoDb);
        assert!(Args::try_parse_from(["traffic-controller", "--cluster-name", "c1", "--backend-type", "foolanito"]).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(parse(&["--cluster-name", "c1", "--initial-weight", "-1"]), Err(Error::Config(_))));
        assert!(matches!(parse(&["--cluster-name", " "]), Err(Error::Config(_))));
        assert!(matches!(
            parse(&["--cluster-name", "c1", "--backend-type", "dynamoDB", "--aws-region", ""]),
            Err(Error::Config(_))
        ));
        assert!(Args::try_parse_from(["traffic-controller"]).is_err(), "cluster name is required");
    }

    #[test]
    fn long_help_states_the_replica_requirement() {
        use clap::CommandFactory;
        let help = Args::command().render_long_help().to_string();
        assert!(help.contains("single replica per cluster"), "{help}");
    }

    #[test]
    fn record_settings_carry_filter_and_dev_mode() {
        let s = parse(&["--cluster-name", "c1", "--annotation-filter", "team=edge", "--dev-mode", "--binding-domain", "foo.io"]).unwrap();
        assert!(!s.records.annotation_filter.is_match_all());
        assert!(s.records.dev_mode);
        assert_eq!(s.records.binding_domain, "foo.io");
        assert_eq!(s.records.weight_annotation(), "dns.adevinta.com/traffic-weight");
    }
}
