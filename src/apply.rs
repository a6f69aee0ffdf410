//! The idempotent apply protocol: at most one mutation per record per
//! reconciliation pass.
//!
//! Correctness under concurrent writers relies on optimistic concurrency,
//! never on locks: the merged record carries the version token of the
//! revision it was derived from, and a stale token surfaces as a
//! retryable conflict for the calling control loop to handle.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use thiserror::Error;

use crate::accessor::{CreateOutcome, RecordAccessor, RecordIdentity, UpdateOutcome};
use crate::compare::{FieldChange, Materialized};
use crate::observe::{EventOutcome, EventSink, ReconcileEvent};
use crate::owner;
use crate::synthesis::SynthesisError;

/// What one apply pass did to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated { changes: Vec<FieldChange> },
    Unchanged,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The record changed under us between read and write. Transient:
    /// the caller re-runs the whole reconcile; retry policy and backoff
    /// live in the external control loop.
    #[error("version conflict on {0}; reconcile must be retried")]
    Conflict(RecordIdentity),
    /// The desired record could not be derived from the cluster spec.
    /// Fatal for this identity's pass; nothing was written.
    #[error("synthesizing {identity}: {source}")]
    Synthesis {
        identity: RecordIdentity,
        #[source]
        source: SynthesisError,
    },
    /// The record store failed for infrastructure reasons. The cause is
    /// propagated verbatim; no state mutation is assumed to have
    /// happened.
    #[error("record store failure on {identity}: {cause}")]
    Transport {
        identity: RecordIdentity,
        cause: anyhow::Error,
    },
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Conflict(_))
    }
}

fn report_failure(sink: &dyn EventSink, identity: &RecordIdentity, error: &ApplyError) {
    sink.record(
        ReconcileEvent::new(identity.clone(), EventOutcome::Failed)
            .with_detail(error.to_string()),
    );
}

/// Reconciles one record identity against its synthesized desired state.
///
/// Reads the current record; creates it (owner-linked) when absent, and
/// otherwise merges only the material differences and updates under the
/// current version token. A steady state issues no write at all. A create
/// losing a race to a concurrent creator collapses to `Unchanged`.
///
/// `synthesize` receives the current record so desired state may depend
/// on deployed context; it must not perform I/O.
pub async fn apply_record<K, A, F>(
    accessor: &A,
    sink: &dyn EventSink,
    identity: RecordIdentity,
    owner_link: &OwnerReference,
    synthesize: F,
) -> Result<Outcome, ApplyError>
where
    K: Materialized + Resource + Send + Sync,
    A: RecordAccessor<K> + ?Sized,
    F: FnOnce(Option<&K>) -> Result<K, SynthesisError>,
{
    let current = match accessor.read(&identity).await {
        Ok(current) => current,
        Err(cause) => {
            let error = ApplyError::Transport {
                identity: identity.clone(),
                cause,
            };
            report_failure(sink, &identity, &error);
            return Err(error);
        }
    };

    let synthesize_for = |context: Option<&K>| {
        synthesize(context).map_err(|source| ApplyError::Synthesis {
            identity: identity.clone(),
            source,
        })
    };

    match current {
        None => {
            let desired = match synthesize_for(None) {
                Ok(desired) => desired,
                Err(error) => {
                    report_failure(sink, &identity, &error);
                    return Err(error);
                }
            };
            let desired = owner::link(desired, owner_link);
            match accessor.create(&desired).await {
                Ok(CreateOutcome::Created(_)) => {
                    sink.record(ReconcileEvent::new(identity, EventOutcome::Created));
                    Ok(Outcome::Created)
                }
                // a concurrent reconciler created it first; that is the
                // state we wanted, not an error
                Ok(CreateOutcome::AlreadyExists) => {
                    sink.record(
                        ReconcileEvent::new(identity, EventOutcome::Unchanged)
                            .with_detail("created concurrently"),
                    );
                    Ok(Outcome::Unchanged)
                }
                Err(cause) => {
                    let error = ApplyError::Transport {
                        identity: identity.clone(),
                        cause,
                    };
                    report_failure(sink, &identity, &error);
                    Err(error)
                }
            }
        }
        Some(current) => {
            let desired = match synthesize_for(Some(&current)) {
                Ok(desired) => desired,
                Err(error) => {
                    report_failure(sink, &identity, &error);
                    return Err(error);
                }
            };
            let diff = K::compare(&current, &desired);
            if !diff.is_changed() {
                sink.record(ReconcileEvent::new(identity, EventOutcome::Unchanged));
                return Ok(Outcome::Unchanged);
            }
            // the merged record starts from the current one, so it keeps
            // the version token the read observed
            let (merged, changes) = diff.into_parts();
            match accessor.update(&merged).await {
                Ok(UpdateOutcome::Updated(_)) => {
                    sink.record(
                        ReconcileEvent::new(identity, EventOutcome::Updated)
                            .with_changes(changes.clone()),
                    );
                    Ok(Outcome::Updated { changes })
                }
                Ok(UpdateOutcome::Conflict) => {
                    let error = ApplyError::Conflict(identity.clone());
                    report_failure(sink, &identity, &error);
                    Err(error)
                }
                Err(cause) => {
                    let error = ApplyError::Transport {
                        identity: identity.clone(),
                        cause,
                    };
                    report_failure(sink, &identity, &error);
                    Err(error)
                }
            }
        }
    }
}
