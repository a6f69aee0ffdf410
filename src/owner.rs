//! Owner links from managed records back to their ComputeCluster.
//!
//! The link is a weak back-reference: it never marks the cluster as a
//! controller of the record and the engine never deletes anything itself.
//! Cascading cleanup is the external garbage collector's job.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::synthesis::SynthesisError;
use crate::types::ComputeCluster;

/// Builds the owner link for records produced from `cr`. Fails when the
/// custom resource has not been persisted yet (no uid assigned).
pub fn link_for(cr: &ComputeCluster) -> Result<OwnerReference, SynthesisError> {
    cr.owner_ref(&())
        .ok_or(SynthesisError::MissingObjectKey(".metadata.uid"))
}

/// Appends `owner` to the record's owner links unless a link with the same
/// uid is already present. Existing unrelated links are never removed, so
/// a co-owned record keeps all of its owners.
pub fn link<K: Resource>(mut record: K, owner: &OwnerReference) -> K {
    let references = record
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new);
    if !references.iter().any(|existing| existing.uid == owner.uid) {
        references.push(owner.clone());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "grid.dev/v1alpha1".to_string(),
            kind: "ComputeCluster".to_string(),
            name: "example".to_string(),
            uid: uid.to_string(),
            ..OwnerReference::default()
        }
    }

    #[test]
    fn linking_twice_is_idempotent() {
        let record = ConfigMap::default();
        let linked = link(record, &owner("uid-1"));
        let linked = link(linked, &owner("uid-1"));
        assert_eq!(linked.metadata.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn unrelated_links_are_preserved() {
        let record = ConfigMap {
            metadata: ObjectMeta {
                owner_references: Some(vec![owner("uid-other")]),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let linked = link(record, &owner("uid-1"));
        let references = linked.metadata.owner_references.unwrap();
        assert_eq!(references.len(), 2);
        assert!(references.iter().any(|r| r.uid == "uid-other"));
    }

    #[test]
    fn link_is_not_a_controller_reference() {
        let linked = link(ConfigMap::default(), &owner("uid-1"));
        let references = linked.metadata.owner_references.unwrap();
        assert_eq!(references[0].controller, None);
    }
}
