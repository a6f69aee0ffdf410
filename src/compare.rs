//! Field-scoped comparison of deployed records against synthesized ones.
//!
//! Only an explicit list of material fields per record kind is ever
//! compared or carried into a merge; orchestrator-injected fields (status,
//! generated identifiers, default-populated scheduling data) are left
//! untouched so an update never causes collateral churn.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use serde::Serialize;

const SUMMARY_LIMIT: usize = 160;

/// One material field that differs between the current and desired record,
/// with summarized old/new values for the observability sink. Values of
/// sensitive fields are redacted at construction time and never reach the
/// sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub current: String,
    pub desired: String,
}

impl FieldChange {
    fn new<T: Serialize>(field: String, current: &T, desired: &T) -> Self {
        FieldChange {
            field,
            current: summarize(current),
            desired: summarize(desired),
        }
    }

    fn redacted(field: String, current: String, desired: String) -> Self {
        FieldChange {
            field,
            current,
            desired,
        }
    }
}

fn summarize<T: Serialize>(value: &T) -> String {
    let mut text =
        serde_json::to_string(value).unwrap_or_else(|_| "<unserializable>".to_string());
    if text.len() > SUMMARY_LIMIT {
        let cut = (0..=SUMMARY_LIMIT)
            .rev()
            .find(|idx| text.is_char_boundary(*idx))
            .unwrap_or(0);
        text.truncate(cut);
        text.push_str("..");
    }
    text
}

/// Result of comparing a current record against a desired one: the set of
/// differing material fields plus the merged record. The merged record is
/// the current record with exactly the differing fields replaced by their
/// desired values; if no field differs it is identical to the current
/// record and applying it would be a strict no-op.
#[derive(Debug, Clone)]
pub struct MaterialDiff<K> {
    merged: K,
    changes: Vec<FieldChange>,
}

impl<K> MaterialDiff<K> {
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn into_merged(self) -> K {
        self.merged
    }

    pub fn into_parts(self) -> (K, Vec<FieldChange>) {
        (self.merged, self.changes)
    }
}

/// A record kind with an explicit list of material fields.
///
/// `compare` must be a pure function of its two arguments. Sequence-valued
/// fields are compared positionally: a length mismatch replaces the whole
/// sequence, equal lengths compare element-by-element by index. Reordering
/// by the synthesizer is out of contract and will surface as a spurious
/// diff; stable ordering is the synthesizer's responsibility.
pub trait Materialized: Clone {
    fn compare(current: &Self, desired: &Self) -> MaterialDiff<Self>;
}

/// Collects field replacements while building the merged record.
#[derive(Default)]
struct DiffBuilder {
    changes: Vec<FieldChange>,
}

impl DiffBuilder {
    /// Replaces `current` with `desired` when they differ structurally,
    /// recording the change. Replacement is atomic: the full desired value
    /// is carried, never a partial patch inside the field.
    fn replace<T>(&mut self, field: impl Into<String>, current: &mut T, desired: &T)
    where
        T: PartialEq + Clone + Serialize,
    {
        if current != desired {
            let field = field.into();
            self.changes.push(FieldChange::new(field, current, desired));
            *current = desired.clone();
        }
    }

    /// Same as `replace` but only map keys appear in the summaries. Used
    /// for sensitive payloads (credentials, tokens).
    fn replace_redacted<T, F>(
        &mut self,
        field: impl Into<String>,
        current: &mut T,
        desired: &T,
        describe: F,
    ) where
        T: PartialEq + Clone,
        F: Fn(&T) -> String,
    {
        if current != desired {
            self.changes.push(FieldChange::redacted(
                field.into(),
                describe(current),
                describe(desired),
            ));
            *current = desired.clone();
        }
    }

    fn finish<K>(self, merged: K) -> MaterialDiff<K> {
        MaterialDiff {
            merged,
            changes: self.changes,
        }
    }
}

fn key_summary<V>(map: &Option<std::collections::BTreeMap<String, V>>) -> String {
    match map {
        None => "<absent>".to_string(),
        Some(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("<redacted; keys: [{}]>", keys.join(", "))
        }
    }
}

/// Merges material pod-template differences from `desired` into a clone of
/// `current`. Material fields: scheduling affinity, scheduler name, the
/// template's labels and annotations, and per-indexed-container image,
/// ports, volume mounts and resource requirements.
fn merge_pod_template(
    builder: &mut DiffBuilder,
    current: &mut corev1::PodTemplateSpec,
    desired: &corev1::PodTemplateSpec,
) {
    let desired_meta = desired.metadata.clone().unwrap_or_default();
    let current_meta = current.metadata.get_or_insert_with(Default::default);
    builder.replace("labels", &mut current_meta.labels, &desired_meta.labels);
    builder.replace(
        "annotations",
        &mut current_meta.annotations,
        &desired_meta.annotations,
    );

    let (current_spec, desired_spec) = match (current.spec.as_mut(), desired.spec.as_ref()) {
        (Some(current_spec), Some(desired_spec)) => (current_spec, desired_spec),
        _ => return,
    };

    builder.replace(
        "affinity",
        &mut current_spec.affinity,
        &desired_spec.affinity,
    );
    builder.replace(
        "schedulerName",
        &mut current_spec.scheduler_name,
        &desired_spec.scheduler_name,
    );

    // Containers are matched by position; the synthesizer emits the same
    // role's containers in a stable order, so a length mismatch means the
    // container set itself changed and is replaced wholesale.
    if current_spec.containers.len() != desired_spec.containers.len() {
        builder.replace(
            "containers",
            &mut current_spec.containers,
            &desired_spec.containers,
        );
        return;
    }
    for (idx, (current_container, desired_container)) in current_spec
        .containers
        .iter_mut()
        .zip(desired_spec.containers.iter())
        .enumerate()
    {
        builder.replace(
            format!("containers[{idx}].image"),
            &mut current_container.image,
            &desired_container.image,
        );
        builder.replace(
            format!("containers[{idx}].ports"),
            &mut current_container.ports,
            &desired_container.ports,
        );
        builder.replace(
            format!("containers[{idx}].volumeMounts"),
            &mut current_container.volume_mounts,
            &desired_container.volume_mounts,
        );
        builder.replace(
            format!("containers[{idx}].resources"),
            &mut current_container.resources,
            &desired_container.resources,
        );
    }
}

impl Materialized for appsv1::Deployment {
    fn compare(current: &Self, desired: &Self) -> MaterialDiff<Self> {
        let mut merged = current.clone();
        let mut builder = DiffBuilder::default();
        if let (Some(merged_spec), Some(desired_spec)) =
            (merged.spec.as_mut(), desired.spec.as_ref())
        {
            merge_pod_template(&mut builder, &mut merged_spec.template, &desired_spec.template);
        }
        builder.finish(merged)
    }
}

impl Materialized for corev1::Service {
    fn compare(current: &Self, desired: &Self) -> MaterialDiff<Self> {
        let mut merged = current.clone();
        let mut builder = DiffBuilder::default();
        builder.replace(
            "labels",
            &mut merged.metadata.labels,
            &desired.metadata.labels,
        );
        builder.replace(
            "annotations",
            &mut merged.metadata.annotations,
            &desired.metadata.annotations,
        );
        if let (Some(merged_spec), Some(desired_spec)) =
            (merged.spec.as_mut(), desired.spec.as_ref())
        {
            builder.replace("ports", &mut merged_spec.ports, &desired_spec.ports);
            builder.replace(
                "selector",
                &mut merged_spec.selector,
                &desired_spec.selector,
            );
        }
        builder.finish(merged)
    }
}

impl Materialized for corev1::ConfigMap {
    fn compare(current: &Self, desired: &Self) -> MaterialDiff<Self> {
        let mut merged = current.clone();
        let mut builder = DiffBuilder::default();
        builder.replace(
            "labels",
            &mut merged.metadata.labels,
            &desired.metadata.labels,
        );
        builder.replace(
            "annotations",
            &mut merged.metadata.annotations,
            &desired.metadata.annotations,
        );
        builder.replace("data", &mut merged.data, &desired.data);
        builder.replace("binaryData", &mut merged.binary_data, &desired.binary_data);
        builder.finish(merged)
    }
}

impl Materialized for corev1::Secret {
    fn compare(current: &Self, desired: &Self) -> MaterialDiff<Self> {
        let mut merged = current.clone();
        let mut builder = DiffBuilder::default();
        builder.replace(
            "labels",
            &mut merged.metadata.labels,
            &desired.metadata.labels,
        );
        builder.replace(
            "annotations",
            &mut merged.metadata.annotations,
            &desired.metadata.annotations,
        );
        builder.replace_redacted("data", &mut merged.data, &desired.data, key_summary);
        builder.replace_redacted(
            "stringData",
            &mut merged.string_data,
            &desired.string_data,
            key_summary,
        );
        builder.finish(merged)
    }
}
