//! Reconciliation engine for ComputeCluster workloads.
//!
//! Keeps the deployed records of a master/worker compute cluster (the
//! role deployments, the master services and the shared settings map) in
//! sync with a single declarative ComputeCluster resource. The engine
//! never fights external writers: it compares only an explicit list of
//! material fields per record kind, merges just the differing fields into
//! the deployed record, and writes under the record's version token so a
//! concurrent edit surfaces as a retryable conflict instead of being
//! overwritten. A steady state issues no writes at all.
//!
//! ```ignore
//! ComputeCluster --synthesis--> desired record
//!                                    |
//!                 current record <--read-- store
//!                                    |
//!                    compare / merge (material fields only)
//!                                    |
//!                    create | update-with-token | no-op
//! ```
//!
//! Deletion is not handled here: every managed record carries a weak
//! owner link back to its ComputeCluster, and cascading cleanup is the
//! cluster garbage collector's job.

pub mod accessor;
pub mod apply;
pub mod compare;
pub mod controller;
pub mod observe;
pub mod owner;
pub mod synthesis;
pub mod types;

pub use accessor::{KubeAccessor, RecordAccessor, RecordIdentity};
pub use apply::{apply_record, ApplyError, Outcome};
pub use compare::{FieldChange, MaterialDiff, Materialized};
pub use observe::{EventSink, ReconcileEvent, TracingSink};
pub use synthesis::{Role, SynthesisError};
pub use types::{ComputeCluster, ComputeClusterSpec};
