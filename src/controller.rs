//! Controller wiring: watches ComputeCluster resources and drives one
//! apply pass per managed record on every trigger.
//!
//! Retry and backoff policy live here, not in the engine: a retryable
//! conflict requeues quickly, anything else goes through the error
//! policy.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::Api;
use kube::core::ErrorResponse;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::accessor::{KubeAccessor, RecordIdentity};
use crate::apply::{apply_record, ApplyError};
use crate::observe::{EventSink, TracingSink};
use crate::owner;
use crate::synthesis::{self, Role, SynthesisError};
use crate::types::ComputeCluster;

#[derive(Debug, Error)]
pub enum Error {
    #[error("custom resource misses {0}")]
    MissingObjectKey(&'static str),
    #[error("failed to get ComputeCluster: {0}")]
    CRGetFailed(#[source] kube::Error),
    #[error("failed to reconcile {identity}: {source}")]
    ApplyFailed {
        identity: RecordIdentity,
        #[source]
        source: ApplyError,
    },
}

pub struct Context {
    pub client: Client,
    pub sink: Arc<dyn EventSink>,
}

/// Collects per-record failures so one record never aborts its siblings.
struct PassResult {
    first_error: Option<Error>,
    all_retryable: bool,
}

impl PassResult {
    fn new() -> Self {
        PassResult {
            first_error: None,
            all_retryable: true,
        }
    }

    fn note(
        &mut self,
        identity: &RecordIdentity,
        result: Result<crate::apply::Outcome, ApplyError>,
    ) {
        if let Err(source) = result {
            warn!(identity = %identity, error = %source, "record reconcile failed, continuing with siblings");
            self.all_retryable = self.all_retryable && source.is_retryable();
            if self.first_error.is_none() {
                self.first_error = Some(Error::ApplyFailed {
                    identity: identity.clone(),
                    source,
                });
            }
        }
    }
}

/// Reconciles every managed record of one ComputeCluster: the master and
/// worker deployments, the master services and the settings map. Each
/// record is applied independently.
pub async fn reconcile(
    cr_from_cache: Arc<ComputeCluster>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = cr_from_cache
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = cr_from_cache
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?
        .to_string();

    // Re-read the custom resource for the most updated spec before taking
    // any reconciliation actions.
    let cr_api = Api::<ComputeCluster>::namespaced(client.clone(), &namespace);
    let cr = match cr_api.get(name).await {
        Err(kube::Error::Api(ErrorResponse { ref reason, .. })) if reason == "NotFound" => {
            info!("ComputeCluster {} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
        Err(err) => return Err(Error::CRGetFailed(err)),
        Ok(cr) => cr,
    };

    let owner_link = owner::link_for(&cr).map_err(|err| match err {
        SynthesisError::MissingObjectKey(key) => Error::MissingObjectKey(key),
        _ => Error::MissingObjectKey(".metadata.uid"),
    })?;

    let deployments: KubeAccessor<appsv1::Deployment> =
        KubeAccessor::namespaced(client.clone(), &namespace);
    let services: KubeAccessor<corev1::Service> =
        KubeAccessor::namespaced(client.clone(), &namespace);
    let config_maps: KubeAccessor<corev1::ConfigMap> =
        KubeAccessor::namespaced(client.clone(), &namespace);
    let sink = &*ctx.sink;

    let mut pass = PassResult::new();

    for role in [Role::Master, Role::Worker] {
        let identity = RecordIdentity::namespaced::<appsv1::Deployment>(
            namespace.clone(),
            synthesis::deployment_name(name, role),
        );
        let result = apply_record(&deployments, sink, identity.clone(), &owner_link, |_| {
            synthesis::deployment(&cr, role)
        })
        .await;
        pass.note(&identity, result);
    }

    for headless in [false, true] {
        let identity = RecordIdentity::namespaced::<corev1::Service>(
            namespace.clone(),
            synthesis::master_service_name(name, headless),
        );
        let result = apply_record(&services, sink, identity.clone(), &owner_link, |_| {
            synthesis::master_service(&cr, headless)
        })
        .await;
        pass.note(&identity, result);
    }

    let identity = RecordIdentity::namespaced::<corev1::ConfigMap>(
        namespace.clone(),
        synthesis::settings_name(name),
    );
    let result = apply_record(&config_maps, sink, identity.clone(), &owner_link, |_| {
        synthesis::settings(&cr)
    })
    .await;
    pass.note(&identity, result);

    match pass.first_error {
        // version conflicts are transient; re-run the pass soon
        Some(_) if pass.all_retryable => Ok(Action::requeue(Duration::from_secs(5))),
        Some(error) => Err(error),
        None => Ok(Action::requeue(Duration::from_secs(300))),
    }
}

pub fn error_policy(_object: Arc<ComputeCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

/// Runs the controller until shutdown. The caller owns tracing setup;
/// `init_tracing` is a convenience for binaries.
pub async fn run(client: Client) -> anyhow::Result<()> {
    let context = Arc::new(Context {
        client: client.clone(),
        sink: Arc::new(TracingSink),
    });
    let clusters = Api::<ComputeCluster>::all(client);

    Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok(obj) => info!("reconciled {:?}", obj),
                Err(err) => warn!("reconcile failed: {}", err),
            }
        })
        .await;
    info!("controller terminated");
    Ok(())
}

pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}

/// The installable custom resource definition, for `kubectl apply`.
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&ComputeCluster::crd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_export_is_parseable_yaml() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("computeclusters.grid.dev"));
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert!(value.get("spec").is_some());
    }
}
