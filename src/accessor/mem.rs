//! Deterministic in-process record store.
//!
//! Behaves like the real API server for the operations the engine uses:
//! version tokens are assigned on create, bumped on update, and stale
//! tokens are rejected. Transport failures can be injected to exercise
//! the error paths. Intended for tests and simulation, in the spirit of
//! an executable model of the API server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use kube::Resource;

use super::{CreateOutcome, RecordAccessor, RecordIdentity, UpdateOutcome};

pub struct MemoryAccessor<K> {
    store: Mutex<Inner<K>>,
    writes: AtomicU64,
    fail_next: Mutex<Option<String>>,
}

struct Inner<K> {
    records: BTreeMap<String, K>,
    revision: u64,
}

impl<K> Default for MemoryAccessor<K> {
    fn default() -> Self {
        MemoryAccessor {
            store: Mutex::new(Inner {
                records: BTreeMap::new(),
                revision: 0,
            }),
            writes: AtomicU64::new(0),
            fail_next: Mutex::new(None),
        }
    }
}

fn key_of(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl<K: Resource + Clone> MemoryAccessor<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write operations (create or update) issued so far,
    /// whether or not they succeeded.
    pub fn writes_issued(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next accessor call fail with a transport error.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().expect("lock poisoned") = Some(message.to_string());
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.store
            .lock()
            .expect("lock poisoned")
            .records
            .get(&key_of(namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().expect("lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self) -> Option<String> {
        self.fail_next.lock().expect("lock poisoned").take()
    }

    fn record_key(record: &K) -> anyhow::Result<String> {
        let meta = record.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("record misses .metadata.name"))?;
        Ok(key_of(meta.namespace.as_deref().unwrap_or(""), name))
    }
}

#[async_trait]
impl<K> RecordAccessor<K> for MemoryAccessor<K>
where
    K: Resource + Clone + Send + Sync,
{
    async fn read(&self, identity: &RecordIdentity) -> anyhow::Result<Option<K>> {
        if let Some(message) = self.take_failure() {
            bail!("record store unavailable: {message}");
        }
        Ok(self.get(&identity.namespace, &identity.name))
    }

    async fn create(&self, record: &K) -> anyhow::Result<CreateOutcome<K>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.take_failure() {
            bail!("record store unavailable: {message}");
        }
        let key = Self::record_key(record)?;
        let mut inner = self.store.lock().expect("lock poisoned");
        if inner.records.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.revision += 1;
        let mut stored = record.clone();
        stored.meta_mut().resource_version = Some(inner.revision.to_string());
        inner.records.insert(key, stored.clone());
        Ok(CreateOutcome::Created(stored))
    }

    async fn update(&self, record: &K) -> anyhow::Result<UpdateOutcome<K>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.take_failure() {
            bail!("record store unavailable: {message}");
        }
        let key = Self::record_key(record)?;
        let mut inner = self.store.lock().expect("lock poisoned");
        let stored_version = match inner.records.get(&key) {
            Some(existing) => existing.meta().resource_version.clone(),
            None => bail!("updating a record that does not exist: {key}"),
        };
        if record.meta().resource_version != stored_version {
            return Ok(UpdateOutcome::Conflict);
        }
        inner.revision += 1;
        let mut stored = record.clone();
        stored.meta_mut().resource_version = Some(inner.revision.to_string());
        inner.records.insert(key, stored.clone());
        Ok(UpdateOutcome::Updated(stored))
    }
}
