use dns_endpoint::DNSEndpoint;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher::{watcher, Config, Event};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cluster::RouteKey;
use crate::error::Error;
use crate::health::rule_services;
use crate::records::{RouteOutcome, RoutePipeline};
use crate::telemetry::ROUTE_RECONCILIATIONS;

/// Requeue delay after a failed reconciliation.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(15);

pub struct Context {
    pub pipeline: Arc<RoutePipeline>,
}

/// Ingresses in the same namespace with a path backed by the service these
/// endpoints belong to.
pub fn ingresses_for_endpoints(endpoints: &Endpoints, ingresses: &[Arc<Ingress>]) -> Vec<ObjectRef<Ingress>> {
    let namespace = endpoints.namespace();
    let service = endpoints.name_any();
    let mut seen = BTreeSet::new();
    ingresses
        .iter()
        .filter(|ing| ing.namespace() == namespace)
        .filter(|ing| {
            ing.spec
                .iter()
                .flat_map(|spec| spec.rules.iter().flatten())
                .any(|rule| rule_services(rule).contains(service.as_str()))
        })
        .filter(|ing| seen.insert(RouteKey::of::<Ingress>(ing)))
        .map(|ing| ObjectRef::from_obj(&**ing))
        .collect()
}

pub fn action_for(outcome: &RouteOutcome) -> Action {
    match outcome {
        RouteOutcome::Deferred(delay) => Action::requeue(*delay),
        _ => Action::await_change(),
    }
}

async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = RouteKey::of(&*ingress);
    let outcome = ctx.pipeline.reconcile(&key).await?;
    ROUTE_RECONCILIATIONS.with_label_values(&[outcome.label()]).inc();
    tracing::debug!(route=%key, outcome=outcome.label(), "controller.reconciled");
    Ok(action_for(&outcome))
}

fn error_policy(ingress: Arc<Ingress>, err: &Error, _ctx: Arc<Context>) -> Action {
    ROUTE_RECONCILIATIONS.with_label_values(&[err.metric_label()]).inc();
    tracing::warn!(route=%RouteKey::of(&*ingress), error=%err, retryable=err.is_retryable(), "controller.reconcile_failed");
    Action::requeue(ERROR_REQUEUE)
}

/// Drive the Ingress controller until SIGINT/SIGTERM. Besides Ingress
/// changes it reacts to owned `DNSEndpoint`s, to `Endpoints` of referenced
/// services, and to the weight loop's fan-out channel.
pub async fn run_controller(client: Client, pipeline: Arc<RoutePipeline>, fan_out: mpsc::Receiver<ObjectRef<Ingress>>) {
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let controller = Controller::new(ingresses, Config::default());
    let store = controller.store();
    controller
        .owns(Api::<DNSEndpoint>::all(client.clone()), Config::default())
        .watches(Api::<Endpoints>::all(client), Config::default(), move |endpoints| {
            ingresses_for_endpoints(&endpoints, &store.state())
        })
        .reconcile_on(ReceiverStream::new(fan_out))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Context { pipeline }))
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::debug!(error=%e, "controller.event_dropped");
            }
        })
        .await;
}

/// The controller forgets deleted Ingresses, so deletions are observed here
/// and routed through the pipeline's "route gone" path.
pub async fn run_route_deletion_watcher(client: Client, pipeline: Arc<RoutePipeline>) {
    let api: Api<Ingress> = Api::all(client);
    let stream = watcher(api, Config::default());
    futures_util::pin_mut!(stream);
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Deleted(ingress)) => {
                let key = RouteKey::of(&ingress);
                match pipeline.reconcile(&key).await {
                    Ok(outcome) => { ROUTE_RECONCILIATIONS.with_label_values(&[outcome.label()]).inc(); }
                    Err(e) => tracing::warn!(route=%key, error=%e, "deletion_watcher.cleanup_failed"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error=%e, "deletion_watcher.stream_error"),
        }
    }
}
