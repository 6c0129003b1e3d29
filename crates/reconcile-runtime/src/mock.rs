//! In-memory test doubles
//!
//! `MockStore` stands in for the API server, `RecordingEventRecorder` and
//! `RecordingErrorSink` keep what was reported so tests can assert on it.

use crate::error::StoreError;
use crate::events::{EventRecorder, EventSeverity, RecordedEvent};
use crate::key::ObjectKey;
use crate::sink::ErrorSink;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Store operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// [`ObjectStore::get`]
    Get,
    /// [`ObjectStore::create`]
    Create,
    /// [`ObjectStore::update`]
    Update,
    /// [`ObjectStore::update_status`]
    UpdateStatus,
}

/// One recorded store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    /// Operation called
    pub verb: Verb,
    /// Object it was called for
    pub key: ObjectKey,
}

/// Mock object store for testing
///
/// Objects live in memory. Every call through [`ObjectStore`] is recorded;
/// failures can be injected per verb with [`fail_next`](Self::fail_next).
/// Writes bump the resource version and a stale resource version on
/// `update`/`update_status` fails with `Conflict`, like the API server.
pub struct MockStore<K> {
    objects: Arc<Mutex<HashMap<ObjectKey, K>>>,
    calls: Arc<Mutex<Vec<StoreCall>>>,
    failures: Arc<Mutex<HashMap<Verb, VecDeque<StoreError>>>>,
    next_version: Arc<Mutex<u64>>,
}

impl<K> Clone for MockStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            calls: Arc::clone(&self.calls),
            failures: Arc::clone(&self.failures),
            next_version: Arc::clone(&self.next_version),
        }
    }
}

impl<K> Default for MockStore<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            next_version: Arc::new(Mutex::new(1)),
        }
    }
}

impl<K> MockStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object to the mock store (for test setup, not recorded)
    ///
    /// Missing uid and resource version are filled in.
    pub fn insert(&self, mut obj: K) -> K {
        self.stamp(&mut obj);
        let key = ObjectKey::from_resource(&obj);
        self.objects.lock().unwrap().insert(key, obj.clone());
        obj
    }

    /// Current stored state of an object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Make the next call of `verb` fail with `error`
    pub fn fail_next(&self, verb: Verb, error: StoreError) {
        self.failures
            .lock()
            .unwrap()
            .entry(verb)
            .or_default()
            .push_back(error);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of one verb
    pub fn calls_for(&self, verb: Verb) -> Vec<StoreCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.verb == verb)
            .cloned()
            .collect()
    }

    /// Forgets the calls recorded so far.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, verb: Verb, key: ObjectKey) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(StoreCall {
            verb,
            key,
        });
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&verb)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn bump_version(&self, obj: &mut K) {
        let mut next = self.next_version.lock().unwrap();
        obj.meta_mut().resource_version = Some(next.to_string());
        *next += 1;
    }

    fn stamp(&self, obj: &mut K) {
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        }
        match obj
            .meta()
            .resource_version
            .as_deref()
            .map(str::parse::<u64>)
        {
            None => self.bump_version(obj),
            // Later writes must get a newer version than a seeded one
            Some(Ok(seeded)) => {
                let mut next = self.next_version.lock().unwrap();
                *next = (*next).max(seeded + 1);
            }
            Some(Err(_)) => {}
        }
    }

    fn stored(&self, key: &ObjectKey, incoming: &K) -> Result<K, StoreError> {
        let objects = self.objects.lock().unwrap();
        let stored = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("{key} not found")))?;
        if let Some(version) = incoming.meta().resource_version.as_deref() {
            if stored.meta().resource_version.as_deref() != Some(version) {
                return Err(StoreError::Conflict(format!(
                    "the object {key} has been modified; please apply your changes to the latest version and try again"
                )));
            }
        }
        Ok(stored.clone())
    }
}

/// `base` with its top-level `field` taken from `source`.
fn with_field<K: Serialize + DeserializeOwned>(
    base: &K,
    source: &K,
    field: &str,
) -> Result<K, StoreError> {
    let mut value = serde_json::to_value(base)?;
    let replacement = serde_json::to_value(source)?.get(field).cloned();
    if let Some(map) = value.as_object_mut() {
        match replacement {
            Some(v) => {
                map.insert(field.to_string(), v);
            }
            None => {
                map.remove(field);
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K> ObjectStore<K> for MockStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        let key = ObjectKey::new(namespace, name);
        self.record(Verb::Get, key.clone())?;
        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{key} not found")))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::from_resource(obj);
        self.record(Verb::Create, key.clone())?;
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = None;
        self.stamp(&mut created);
        self.objects.lock().unwrap().insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::from_resource(obj);
        self.record(Verb::Update, key.clone())?;
        let stored = self.stored(&key, obj)?;
        // Status is owned by the status subresource
        let mut updated = with_field(obj, &stored, "status")?;
        updated.meta_mut().uid = stored.meta().uid.clone();
        self.bump_version(&mut updated);
        self.objects.lock().unwrap().insert(key, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::from_resource(obj);
        self.record(Verb::UpdateStatus, key.clone())?;
        let stored = self.stored(&key, obj)?;
        let mut updated = with_field(&stored, obj, "status")?;
        self.bump_version(&mut updated);
        self.objects.lock().unwrap().insert(key, updated.clone());
        Ok(updated)
    }
}

/// Keeps recorded events in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingEventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventRecorder {
    /// Recorder with no events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventRecorder for RecordingEventRecorder {
    fn record(&self, subject: &ObjectReference, severity: EventSeverity, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            subject: subject.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// One reported error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    /// Kind whose pass failed
    pub kind: String,
    /// Key of the failed pass
    pub key: ObjectKey,
    /// Error with its context chain
    pub message: String,
}

/// Keeps reported errors in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingErrorSink {
    reports: Arc<Mutex<Vec<ReportedError>>>,
}

impl RecordingErrorSink {
    /// Sink with no reports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports so far, in order.
    pub fn reports(&self) -> Vec<ReportedError> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, kind: &str, key: &ObjectKey, error: &anyhow::Error) {
        self.reports.lock().unwrap().push(ReportedError {
            kind: kind.to_string(),
            key: key.clone(),
            message: format!("{error:#}"),
        });
    }
}
