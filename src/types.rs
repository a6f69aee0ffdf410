use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ComputeCluster declares one master/worker compute cluster.
///
/// The spec carries only operator-facing knobs; everything else about the
/// deployed resources is derived by the synthesizer.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "grid.dev", version = "v1alpha1", kind = "ComputeCluster")]
#[kube(shortname = "cc", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ComputeClusterSpec {
    /// Number of worker replicas. The master always runs a single replica.
    pub replicas: i32,
    /// Container image for both roles; a default is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Alternative scheduler for all pods of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    /// Base affinity rules; the synthesizer appends an anti-affinity
    /// preference spreading replicas across hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub affinity: Option<corev1::Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResourcesSpec>,
}

/// Resource quotas for the compute containers, as Kubernetes quantity
/// strings. Unset fields fall back to the synthesizer defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResourcesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

// k8s-openapi types carry no JsonSchema impl; the CRD schema keeps the
// affinity block opaque and lets the API server validate it.
fn preserve_unknown_object(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_owned(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_round_trips_through_camel_case() {
        let json = serde_json::json!({
            "replicas": 3,
            "imagePullPolicy": "Always",
            "schedulerName": "custom-scheduler",
            "resources": { "cpuRequest": "0.5", "memoryLimit": "4Gi" }
        });
        let spec: ComputeClusterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(spec.scheduler_name.as_deref(), Some("custom-scheduler"));
        let resources = spec.resources.unwrap();
        assert_eq!(resources.cpu_request.as_deref(), Some("0.5"));
        assert_eq!(resources.memory_limit.as_deref(), Some("4Gi"));
    }

    #[test]
    fn crd_carries_group_and_kind() {
        let crd = ComputeCluster::crd();
        assert_eq!(crd.spec.group, "grid.dev");
        assert_eq!(crd.spec.names.kind, "ComputeCluster");
    }
}
