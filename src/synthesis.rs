//! Desired-record synthesis for the master and worker roles.
//!
//! Everything here is a deterministic function of the ComputeCluster
//! resource and the role: same inputs, same record. Port tables are
//! ordered lists so the comparator's positional policy always sees the
//! same sequence.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

use crate::types::{ComputeCluster, ComputeClusterSpec};

pub const DEFAULT_IMAGE: &str = "grid/compute:latest";

const COMPUTE_UID: i64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("invalid quantity {value:?} for {field}: {reason}")]
    InvalidQuantity {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

/// The two workload roles of a compute cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "compute-master",
            Role::Worker => "compute-worker",
        }
    }

    /// Named ports of the role, in the order they appear on the container.
    pub fn ports(&self) -> &'static [(&'static str, i32)] {
        match self {
            Role::Master => &[("cluster", 7077), ("masterwebui", 8009)],
            Role::Worker => &[("data", 7500), ("workerwebui", 7000)],
        }
    }

    /// The master serves HTTP on a different interface than the worker;
    /// probes target this port.
    pub fn web_ui_port(&self) -> i32 {
        match self {
            Role::Master => 8009,
            Role::Worker => 7000,
        }
    }

    fn name_suffix(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn deployment_name(cluster_name: &str, role: Role) -> String {
    format!("{cluster_name}-{}", role.name_suffix())
}

pub fn master_service_name(cluster_name: &str, headless: bool) -> String {
    if headless {
        format!("{cluster_name}-master-headless")
    } else {
        format!("{cluster_name}-master")
    }
}

pub fn settings_name(cluster_name: &str) -> String {
    format!("{cluster_name}-settings")
}

pub fn master_uri(cluster_name: &str) -> String {
    let port = Role::Master.ports()[0].1;
    format!("compute://{}:{port}", master_service_name(cluster_name, false))
}

/// Labels shared by all records of one cluster component. Also used as
/// the pod selector, so the set must stay stable across releases.
pub fn component_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "compute".to_string()),
        ("instance".to_string(), cluster_name.to_string()),
        ("component".to_string(), component.to_string()),
    ])
}

pub fn image(cr: &ComputeCluster) -> String {
    cr.spec
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
}

pub fn container_ports(role: Role) -> Vec<corev1::ContainerPort> {
    role.ports()
        .iter()
        .map(|(name, port)| corev1::ContainerPort {
            name: Some((*name).to_string()),
            container_port: *port,
            protocol: Some("TCP".to_string()),
            ..corev1::ContainerPort::default()
        })
        .collect()
}

pub fn service_ports(role: Role) -> Vec<corev1::ServicePort> {
    role.ports()
        .iter()
        .map(|(name, port)| corev1::ServicePort {
            name: Some((*name).to_string()),
            port: *port,
            ..corev1::ServicePort::default()
        })
        .collect()
}

pub fn environment(cr_name: &str, role: Role) -> Vec<corev1::EnvVar> {
    let role_var = corev1::EnvVar {
        name: "COMPUTE_ROLE".to_string(),
        value: Some(role.as_str().to_string()),
        ..corev1::EnvVar::default()
    };
    match role {
        Role::Master => vec![role_var],
        Role::Worker => vec![
            role_var,
            corev1::EnvVar {
                name: "COMPUTE_MASTER_HOSTNAME".to_string(),
                value: Some(master_service_name(cr_name, false)),
                ..corev1::EnvVar::default()
            },
            corev1::EnvVar {
                name: "COMPUTE_MASTER_PORT".to_string(),
                value: Some(Role::Master.ports()[0].1.to_string()),
                ..corev1::EnvVar::default()
            },
        ],
    }
}

/// Annotations telling a sidecar proxy to leave the cluster's own ports
/// alone.
pub fn proxy_annotations(ports: &[corev1::ContainerPort]) -> BTreeMap<String, String> {
    let list: Vec<String> = ports.iter().map(|p| p.container_port.to_string()).collect();
    BTreeMap::from([(
        "traffic.sidecar.istio.io/excludeInboundPorts".to_string(),
        list.join(","),
    )])
}

/// Resource quotas for the compute containers; unset CR fields fall back
/// to defaults. An unparsable quantity aborts synthesis for the pass and
/// names the offending field.
pub fn requirements(
    spec: &ComputeClusterSpec,
) -> Result<corev1::ResourceRequirements, SynthesisError> {
    let resources = spec.resources.clone().unwrap_or_default();
    let cpu_request = parse_quantity(resources.cpu_request.as_deref(), "0.1", "cpuRequest")?;
    let memory_request =
        parse_quantity(resources.memory_request.as_deref(), "512Mi", "memoryRequest")?;
    let cpu_limit = parse_quantity(resources.cpu_limit.as_deref(), "4", "cpuLimit")?;
    let memory_limit = parse_quantity(resources.memory_limit.as_deref(), "8Gi", "memoryLimit")?;

    Ok(corev1::ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), cpu_request),
            ("memory".to_string(), memory_request),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), cpu_limit),
            ("memory".to_string(), memory_limit),
        ])),
        ..corev1::ResourceRequirements::default()
    })
}

const QUANTITY_SUFFIXES: &[&str] = &[
    "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
];

fn parse_quantity(
    value: Option<&str>,
    default: &str,
    field: &'static str,
) -> Result<Quantity, SynthesisError> {
    let text = match value {
        Some(text) if !text.is_empty() => text,
        _ => default,
    };
    let invalid = |reason| SynthesisError::InvalidQuantity {
        field,
        value: text.to_string(),
        reason,
    };

    let number = QUANTITY_SUFFIXES
        .iter()
        .find_map(|suffix| text.strip_suffix(suffix))
        .unwrap_or(text);
    if number.is_empty() {
        return Err(invalid("no digits"));
    }
    let mut dots = 0;
    for c in number.chars() {
        match c {
            '0'..='9' => {}
            '.' => dots += 1,
            _ => return Err(invalid("not a number")),
        }
    }
    if dots > 1 || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid("malformed decimal"));
    }
    Ok(Quantity(text.to_string()))
}

/// Appends a preference to spread the role's pods across hosts to any
/// affinity rules the cluster spec already carries.
pub fn spread_affinity(
    base: Option<corev1::Affinity>,
    cluster_name: &str,
    role: Role,
) -> corev1::Affinity {
    let term = corev1::WeightedPodAffinityTerm {
        weight: 100,
        pod_affinity_term: corev1::PodAffinityTerm {
            label_selector: Some(metav1::LabelSelector {
                match_labels: Some(component_labels(cluster_name, role.as_str())),
                ..metav1::LabelSelector::default()
            }),
            topology_key: "kubernetes.io/hostname".to_string(),
            ..corev1::PodAffinityTerm::default()
        },
    };
    let mut affinity = base.unwrap_or_default();
    affinity
        .pod_anti_affinity
        .get_or_insert_with(Default::default)
        .preferred_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(term);
    affinity
}

fn http_probe(port: i32, initial_delay_seconds: i32) -> corev1::Probe {
    corev1::Probe {
        http_get: Some(corev1::HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(port),
            ..corev1::HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(10),
        period_seconds: Some(10),
        ..corev1::Probe::default()
    }
}

fn cluster_name(cr: &ComputeCluster) -> Result<&str, SynthesisError> {
    cr.metadata
        .name
        .as_deref()
        .ok_or(SynthesisError::MissingObjectKey(".metadata.name"))
}

fn cluster_namespace(cr: &ComputeCluster) -> Result<&str, SynthesisError> {
    cr.metadata
        .namespace
        .as_deref()
        .ok_or(SynthesisError::MissingObjectKey(".metadata.namespace"))
}

pub fn pod_template(
    cr: &ComputeCluster,
    role: Role,
) -> Result<corev1::PodTemplateSpec, SynthesisError> {
    let name = cluster_name(cr)?;
    let requirements = requirements(&cr.spec)?;
    let ports = container_ports(role);
    let annotations = proxy_annotations(&ports);
    let affinity = spread_affinity(cr.spec.affinity.clone(), name, role);
    let web_ui_port = role.web_ui_port();

    Ok(corev1::PodTemplateSpec {
        metadata: Some(metav1::ObjectMeta {
            labels: Some(component_labels(name, role.as_str())),
            annotations: Some(annotations),
            ..metav1::ObjectMeta::default()
        }),
        spec: Some(corev1::PodSpec {
            affinity: Some(affinity),
            scheduler_name: cr.spec.scheduler_name.clone(),
            security_context: Some(corev1::PodSecurityContext {
                run_as_user: Some(COMPUTE_UID),
                fs_group: Some(COMPUTE_UID),
                ..corev1::PodSecurityContext::default()
            }),
            containers: vec![corev1::Container {
                name: "compute".to_string(),
                image: Some(image(cr)),
                image_pull_policy: cr.spec.image_pull_policy.clone(),
                ports: Some(ports),
                env: Some(environment(name, role)),
                resources: Some(requirements),
                liveness_probe: Some(http_probe(web_ui_port, 30)),
                readiness_probe: Some(http_probe(web_ui_port, 5)),
                ..corev1::Container::default()
            }],
            ..corev1::PodSpec::default()
        }),
    })
}

/// The workload record for one role: a single-replica master or a
/// `spec.replicas`-sized worker pool.
pub fn deployment(cr: &ComputeCluster, role: Role) -> Result<appsv1::Deployment, SynthesisError> {
    let name = cluster_name(cr)?;
    let namespace = cluster_namespace(cr)?;
    let replicas = match role {
        Role::Master => 1,
        Role::Worker => cr.spec.replicas,
    };

    Ok(appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(deployment_name(name, role)),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(name, role.as_str())),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(replicas),
            selector: metav1::LabelSelector {
                match_labels: Some(component_labels(name, role.as_str())),
                ..metav1::LabelSelector::default()
            },
            template: pod_template(cr, role)?,
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    })
}

/// The master's network endpoint; the headless variant assigns stable
/// domain names to the master pod.
pub fn master_service(
    cr: &ComputeCluster,
    headless: bool,
) -> Result<corev1::Service, SynthesisError> {
    let name = cluster_name(cr)?;
    let namespace = cluster_namespace(cr)?;

    Ok(corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(master_service_name(name, headless)),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(name, "compute-master-service")),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            selector: Some(component_labels(name, Role::Master.as_str())),
            ports: Some(service_ports(Role::Master)),
            cluster_ip: headless.then(|| "None".to_string()),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    })
}

/// Cluster-wide settings consumed by both roles.
pub fn settings(cr: &ComputeCluster) -> Result<corev1::ConfigMap, SynthesisError> {
    let name = cluster_name(cr)?;
    let namespace = cluster_namespace(cr)?;

    Ok(corev1::ConfigMap {
        metadata: metav1::ObjectMeta {
            name: Some(settings_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(name, "compute-settings")),
            ..metav1::ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            ("master-uri".to_string(), master_uri(name)),
            ("worker-replicas".to_string(), cr.spec.replicas.to_string()),
        ])),
        ..corev1::ConfigMap::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ComputeResourcesSpec;
    use kube::core::ObjectMeta;

    fn cluster(replicas: i32) -> ComputeCluster {
        let mut cr = ComputeCluster::new(
            "example",
            ComputeClusterSpec {
                replicas,
                image: None,
                image_pull_policy: None,
                scheduler_name: None,
                affinity: None,
                resources: None,
            },
        );
        cr.metadata = ObjectMeta {
            name: Some("example".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            ..ObjectMeta::default()
        };
        cr
    }

    #[test]
    fn synthesis_is_deterministic() {
        let cr = cluster(3);
        assert_eq!(
            deployment(&cr, Role::Worker).unwrap(),
            deployment(&cr, Role::Worker).unwrap()
        );
        assert_eq!(
            master_service(&cr, true).unwrap(),
            master_service(&cr, true).unwrap()
        );
    }

    #[test]
    fn master_runs_one_replica_workers_scale() {
        let cr = cluster(5);
        let master = deployment(&cr, Role::Master).unwrap();
        let worker = deployment(&cr, Role::Worker).unwrap();
        assert_eq!(master.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(worker.spec.as_ref().unwrap().replicas, Some(5));
        assert_eq!(
            master.metadata.name.as_deref(),
            Some("example-master")
        );
        assert_eq!(
            worker.metadata.name.as_deref(),
            Some("example-worker")
        );
    }

    #[test]
    fn ports_keep_table_order() {
        let ports = container_ports(Role::Master);
        let names: Vec<&str> = ports.iter().map(|p| p.name.as_deref().unwrap()).collect();
        assert_eq!(names, vec!["cluster", "masterwebui"]);
    }

    #[test]
    fn probes_target_the_role_web_ui() {
        let cr = cluster(1);
        for (role, port) in [(Role::Master, 8009), (Role::Worker, 7000)] {
            let template = pod_template(&cr, role).unwrap();
            let probe = template.spec.unwrap().containers[0]
                .liveness_probe
                .clone()
                .unwrap();
            assert_eq!(probe.http_get.unwrap().port, IntOrString::Int(port));
        }
    }

    #[test]
    fn worker_env_points_at_the_master_service() {
        let env = environment("example", Role::Worker);
        let hostname = env
            .iter()
            .find(|v| v.name == "COMPUTE_MASTER_HOSTNAME")
            .unwrap();
        assert_eq!(hostname.value.as_deref(), Some("example-master"));
    }

    #[test]
    fn headless_service_has_no_cluster_ip() {
        let cr = cluster(1);
        let headless = master_service(&cr, true).unwrap();
        assert_eq!(
            headless.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("None")
        );
        assert_eq!(
            headless.metadata.name.as_deref(),
            Some("example-master-headless")
        );
        let regular = master_service(&cr, false).unwrap();
        assert_eq!(regular.spec.as_ref().unwrap().cluster_ip, None);
    }

    #[test]
    fn unparsable_quantity_names_the_field() {
        let mut cr = cluster(1);
        cr.spec.resources = Some(ComputeResourcesSpec {
            cpu_request: Some("abc".to_string()),
            ..ComputeResourcesSpec::default()
        });
        let err = requirements(&cr.spec).unwrap_err();
        assert!(err.to_string().contains("cpuRequest"));
        assert!(matches!(
            err,
            SynthesisError::InvalidQuantity {
                field: "cpuRequest",
                ..
            }
        ));
    }

    #[test]
    fn quantity_grammar_accepts_the_defaults() {
        for (value, ok) in [
            ("0.1", true),
            ("512Mi", true),
            ("4", true),
            ("8Gi", true),
            ("2000m", true),
            ("", true), // falls back to the default
            ("Mi", false),
            ("1.2.3", false),
            ("4x", false),
            (".5", false),
        ] {
            let parsed = parse_quantity(Some(value), "1", "cpuLimit");
            assert_eq!(parsed.is_ok(), ok, "value {value:?}");
        }
    }

    #[test]
    fn spread_preference_is_appended_not_replacing() {
        let base = corev1::Affinity {
            node_affinity: Some(corev1::NodeAffinity::default()),
            ..corev1::Affinity::default()
        };
        let affinity = spread_affinity(Some(base), "example", Role::Worker);
        assert!(affinity.node_affinity.is_some());
        let terms = affinity
            .pod_anti_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].pod_affinity_term.topology_key, "kubernetes.io/hostname");
    }

    #[test]
    fn settings_reflect_the_worker_count() {
        let cr = cluster(4);
        let settings = settings(&cr).unwrap();
        let data = settings.data.unwrap();
        assert_eq!(
            data.get("master-uri").map(String::as_str),
            Some("compute://example-master:7077")
        );
        assert_eq!(data.get("worker-replicas").map(String::as_str), Some("4"));
    }
}
