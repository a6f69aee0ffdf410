//! Read/create/update primitives for externally stored records.
//!
//! The engine operates entirely through the [`RecordAccessor`] contract;
//! the backing store is a collaborator. Two backends are provided: one
//! over the Kubernetes API and a deterministic in-process one for tests.

pub mod mem;

use std::fmt;

use anyhow::Context as _;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::PostParams;
use kube::core::ErrorResponse;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Identity of one managed record: enough to read it back from the store
/// and to key observability events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl RecordIdentity {
    pub fn namespaced<K>(namespace: impl Into<String>, name: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        RecordIdentity {
            namespace: namespace.into(),
            name: name.into(),
            kind: K::kind(&()).into_owned(),
        }
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Result of a create: the stored record, or the signal that a concurrent
/// creator got there first.
#[derive(Debug)]
pub enum CreateOutcome<K> {
    Created(K),
    AlreadyExists,
}

/// Result of an update: the stored record, or the signal that the carried
/// version token went stale.
#[derive(Debug)]
pub enum UpdateOutcome<K> {
    Updated(K),
    Conflict,
}

/// Storage primitives for one record kind. Infrastructure failures are
/// returned as plain errors with their original cause attached; the
/// expected signals (not found, already exists, version conflict) are
/// part of the `Ok` shape and never surface as errors.
#[async_trait]
pub trait RecordAccessor<K>: Send + Sync {
    async fn read(&self, identity: &RecordIdentity) -> anyhow::Result<Option<K>>;

    async fn create(&self, record: &K) -> anyhow::Result<CreateOutcome<K>>;

    /// The record must carry the version token of the revision it was
    /// derived from; the store rejects stale tokens with
    /// [`UpdateOutcome::Conflict`] instead of overwriting.
    async fn update(&self, record: &K) -> anyhow::Result<UpdateOutcome<K>>;
}

/// Accessor over the Kubernetes API for a namespaced resource type.
pub struct KubeAccessor<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
{
    api: Api<K>,
}

impl<K> KubeAccessor<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug,
{
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        KubeAccessor {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn error_reason(err: &kube::Error) -> Option<&str> {
    match err {
        kube::Error::Api(ErrorResponse { reason, .. }) => Some(reason.as_str()),
        _ => None,
    }
}

#[async_trait]
impl<K> RecordAccessor<K> for KubeAccessor<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync,
{
    async fn read(&self, identity: &RecordIdentity) -> anyhow::Result<Option<K>> {
        self.api
            .get_opt(&identity.name)
            .await
            .with_context(|| format!("reading {identity}"))
    }

    async fn create(&self, record: &K) -> anyhow::Result<CreateOutcome<K>> {
        match self.api.create(&PostParams::default(), record).await {
            Ok(stored) => Ok(CreateOutcome::Created(stored)),
            Err(err) if error_reason(&err) == Some("AlreadyExists") => {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(err) => Err(anyhow::Error::new(err)).with_context(|| {
                format!("creating {}", K::kind(&()))
            }),
        }
    }

    async fn update(&self, record: &K) -> anyhow::Result<UpdateOutcome<K>> {
        let name = record
            .meta()
            .name
            .as_deref()
            .context("record misses .metadata.name")?;
        match self.api.replace(name, &PostParams::default(), record).await {
            Ok(stored) => Ok(UpdateOutcome::Updated(stored)),
            Err(err) if error_reason(&err) == Some("Conflict") => Ok(UpdateOutcome::Conflict),
            Err(err) => Err(anyhow::Error::new(err))
                .with_context(|| format!("updating {} {}", K::kind(&()), name)),
        }
    }
}
