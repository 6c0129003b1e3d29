//! Object cache.
//!
//! An eventually consistent, read-only mirror of one kind, fed by watch
//! events. Readers always receive owned clones: the shared snapshots never
//! leave the cache, so a reconciler can mutate what it gets back without
//! corrupting state other workers see.
//!
//! Besides the primary `namespace/name` map the cache keeps:
//! - an owner index (controller reference -> dependents)
//! - tombstones for deleted keys, so removal handlers can still see the
//!   object's last known state

use crate::key::{ObjectKey, OwnerKey};
use crate::owner::controller_key;
use kube::Resource;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::debug;

/// Change notification accepted by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<K> {
    /// Object added or updated
    Applied(K),
    /// Object deleted; carries its last known state
    Deleted(K),
}

impl<K: Resource> CacheEvent<K> {
    /// Key of the object the event is about.
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => ObjectKey::from_resource(obj),
        }
    }
}

struct CacheState<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    tombstones: HashMap<ObjectKey, Arc<K>>,
    owners: HashMap<OwnerKey, BTreeSet<ObjectKey>>,
}

impl<K> Default for CacheState<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            tombstones: HashMap::new(),
            owners: HashMap::new(),
        }
    }
}

impl<K: Resource> CacheState<K> {
    fn insert(&mut self, key: ObjectKey, obj: Arc<K>) {
        self.tombstones.remove(&key);
        if let Some(previous) = self.objects.insert(key.clone(), Arc::clone(&obj)) {
            self.unindex(&key, &previous);
        }
        if let Some(owner) = controller_key(obj.as_ref()) {
            self.owners.entry(owner).or_default().insert(key);
        }
    }

    fn remove(&mut self, key: &ObjectKey, last_known: Arc<K>) {
        if let Some(previous) = self.objects.remove(key) {
            self.unindex(key, &previous);
        }
        self.tombstones.insert(key.clone(), last_known);
    }

    fn unindex(&mut self, key: &ObjectKey, obj: &K) {
        let Some(owner) = controller_key(obj) else {
            return;
        };
        if let Some(dependents) = self.owners.get_mut(&owner) {
            dependents.remove(key);
            if dependents.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }
}

/// Shared, clonable cache of one kind.
pub struct Cache<K> {
    state: Arc<RwLock<CacheState<K>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            synced: Arc::clone(&self.synced),
        }
    }
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            synced: Arc::new(synced),
        }
    }
}

impl<K> std::fmt::Debug for Cache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Cache")
            .field("objects", &state.objects.len())
            .field("tombstones", &state.tombstones.len())
            .field("synced", &*self.synced.borrow())
            .finish()
    }
}

impl<K> Cache<K>
where
    K: Resource + Clone,
{
    /// Empty, unsynced cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest observed object, `None` when not found.
    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.get_by_key(&ObjectKey::new(namespace, name))
    }

    /// Latest observed object for `key`.
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<K> {
        self.read().objects.get(key).map(|obj| obj.as_ref().clone())
    }

    /// True when `key` is currently present.
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().objects.contains_key(key)
    }

    /// All objects, sorted by key.
    pub fn list(&self) -> Vec<K> {
        let state = self.read();
        let mut entries: Vec<(&ObjectKey, &Arc<K>)> = state.objects.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(_, obj)| obj.as_ref().clone())
            .collect()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    /// True when no live objects are cached.
    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    /// Objects whose controller reference points at `owner`.
    pub fn list_by_controller(&self, owner: &OwnerKey) -> Vec<K> {
        let state = self.read();
        state
            .owners
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|key| state.objects.get(key))
            .map(|obj| obj.as_ref().clone())
            .collect()
    }

    /// Last known state of a deleted key.
    pub fn tombstone(&self, key: &ObjectKey) -> Option<K> {
        self.read().tombstones.get(key).map(|obj| obj.as_ref().clone())
    }

    /// Drop the tombstone of `key` once its removal has been handled.
    pub fn clear_tombstone(&self, key: &ObjectKey) {
        self.write().tombstones.remove(key);
    }

    /// Apply one watch event. Last applied wins per key.
    pub fn apply(&self, event: CacheEvent<K>) -> ObjectKey {
        let key = event.key();
        let mut state = self.write();
        match event {
            CacheEvent::Applied(obj) => {
                debug!("Cache apply {}", key);
                state.insert(key.clone(), Arc::new(obj));
            }
            CacheEvent::Deleted(obj) => {
                debug!("Cache delete {}", key);
                state.remove(&key, Arc::new(obj));
            }
        }
        key
    }

    /// Replace the whole content after a (re)list and mark the cache synced.
    ///
    /// Returns the keys whose state changed: new objects, objects with a
    /// different resource version, and objects that disappeared (those get
    /// tombstones).
    pub fn replace(&self, objects: Vec<K>) -> Vec<ObjectKey> {
        let mut changed = BTreeSet::new();
        {
            let mut state = self.write();
            let mut seen = BTreeSet::new();
            for obj in objects {
                let key = ObjectKey::from_resource(&obj);
                let unchanged = state.objects.get(&key).is_some_and(|existing| {
                    existing.meta().resource_version.is_some()
                        && existing.meta().resource_version == obj.meta().resource_version
                });
                if !unchanged {
                    changed.insert(key.clone());
                    state.insert(key.clone(), Arc::new(obj));
                }
                seen.insert(key);
            }

            let gone: Vec<(ObjectKey, Arc<K>)> = state
                .objects
                .iter()
                .filter(|(key, _)| !seen.contains(*key))
                .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
                .collect();
            for (key, last_known) in gone {
                state.remove(&key, last_known);
                changed.insert(key);
            }
        }
        self.synced.send_replace(true);
        changed.into_iter().collect()
    }

    /// True once the initial list has been applied.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the initial list. Returns `false` if the cache can no longer sync.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced.subscribe();
        rx.wait_for(|synced| *synced).await.is_ok()
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
