//! Structured reconcile events.
//!
//! The sink is passed into the coordinator explicitly; there is no global
//! logger, so tests observe outcomes deterministically.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::accessor::RecordIdentity;
use crate::compare::FieldChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Created,
    Updated,
    Unchanged,
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Created => "created",
            EventOutcome::Updated => "updated",
            EventOutcome::Unchanged => "unchanged",
            EventOutcome::Failed => "failed",
        }
    }
}

/// One reconcile outcome for one record, with the field-level detail an
/// operator needs to audit what the engine did and why.
#[derive(Debug, Clone)]
pub struct ReconcileEvent {
    pub identity: RecordIdentity,
    pub outcome: EventOutcome,
    pub changes: Vec<FieldChange>,
    pub detail: Option<String>,
}

impl ReconcileEvent {
    pub fn new(identity: RecordIdentity, outcome: EventOutcome) -> Self {
        ReconcileEvent {
            identity,
            outcome,
            changes: Vec::new(),
            detail: None,
        }
    }

    pub fn with_changes(mut self, changes: Vec<FieldChange>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: ReconcileEvent);
}

/// Emits each event as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ReconcileEvent) {
        let fields: Vec<&str> = event.changes.iter().map(|c| c.field.as_str()).collect();
        match event.outcome {
            EventOutcome::Failed => warn!(
                identity = %event.identity,
                detail = event.detail.as_deref().unwrap_or(""),
                "reconcile failed"
            ),
            outcome => info!(
                identity = %event.identity,
                outcome = outcome.as_str(),
                changed_fields = ?fields,
                changes = ?event.changes,
                detail = event.detail.as_deref().unwrap_or(""),
                "reconciled record"
            ),
        }
    }
}

/// Stores every event for later inspection; used by tests.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn take(&self) -> Vec<ReconcileEvent> {
        std::mem::take(&mut *self.events.lock().expect("lock poisoned"))
    }
}

impl EventSink for CapturingSink {
    fn record(&self, event: ReconcileEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}
