//! Observable key-value store with SET/MERGE semantics.
//!
//! [`MemoryStore`] keeps documents in a shared map, [`SledStore`] persists
//! them in sled as CBOR envelopes. Both notify subscribers after each change.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::onyx::{Collection, KeyPattern, OnyxKey, OnyxUpdate, apply_merge, strip_nulls};
use crate::types::TimeStamp;

pub type Callback = Arc<dyn Fn(&OnyxKey, Option<&Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &OnyxKey) -> anyhow::Result<Option<Value>>;

    /// All members of a collection, ordered by key.
    fn get_collection(&self, collection: Collection) -> anyhow::Result<Vec<(OnyxKey, Value)>>;

    /// Replaces the value. `None` removes the key.
    fn set(&self, key: &OnyxKey, value: Option<Value>) -> anyhow::Result<()>;

    /// Deep-merges `value` into whatever is stored. A `null` value removes the key.
    fn merge(&self, key: &OnyxKey, value: Value) -> anyhow::Result<()>;

    fn subscribe(&self, pattern: KeyPattern, callback: Callback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Applies a patch list in order.
    fn apply(&self, updates: &[OnyxUpdate]) -> anyhow::Result<()> {
        for update in updates {
            match update {
                OnyxUpdate::Set { key, value } => self.set(key, value.clone())?,
                OnyxUpdate::Merge { key, value } => self.merge(key, value.clone())?,
            }
        }
        Ok(())
    }
}

/// Typed reads on top of any store.
pub trait StoreExt {
    fn get_as<T: DeserializeOwned>(&self, key: &OnyxKey) -> anyhow::Result<Option<T>>;
    fn collection_as<T: DeserializeOwned>(&self, collection: Collection) -> anyhow::Result<Vec<T>>;
}

impl<S: KeyValueStore + ?Sized> StoreExt for S {
    fn get_as<T: DeserializeOwned>(&self, key: &OnyxKey) -> anyhow::Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(decode(key, value)?)),
            None => Ok(None),
        }
    }

    fn collection_as<T: DeserializeOwned>(&self, collection: Collection) -> anyhow::Result<Vec<T>> {
        self.get_collection(collection)?
            .into_iter()
            .map(|(key, value)| decode(&key, value))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(key: &OnyxKey, value: Value) -> anyhow::Result<T> {
    serde_json::from_value(value).map_err(|err| {
        StoreError::Codec {
            key: key.to_string(),
            reason: err.to_string(),
        }
        .into()
    })
}

/// Subscriber registry shared by the store implementations.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, KeyPattern, Callback)>>,
}

impl Subscribers {
    pub fn add(&self, pattern: KeyPattern, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries.write().push((id, pattern, callback));
        id
    }

    pub fn remove(&self, id: SubscriptionId) {
        self.entries.write().retain(|(existing, _, _)| *existing != id);
    }

    /// Callbacks run after the registry lock is released so they may read the store.
    pub fn notify(&self, key: &OnyxKey, value: Option<&Value>) {
        let matching: Vec<Callback> = self
            .entries
            .read()
            .iter()
            .filter(|(_, pattern, _)| pattern.matches(key))
            .map(|(_, _, callback)| callback.clone())
            .collect();
        for callback in matching {
            callback(key, value);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    subscribers: Arc<Subscribers>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &OnyxKey) -> anyhow::Result<Option<Value>> {
        Ok(self.data.read().get(&key.to_string()).cloned())
    }

    fn get_collection(&self, collection: Collection) -> anyhow::Result<Vec<(OnyxKey, Value)>> {
        let prefix = collection.prefix();
        let data = self.data.read();
        let mut members = Vec::new();
        for (name, value) in data.range(prefix.to_string()..) {
            if !name.starts_with(prefix) {
                break;
            }
            let key: OnyxKey = name.parse()?;
            if key.collection() == Some(collection) {
                members.push((key, value.clone()));
            }
        }
        Ok(members)
    }

    fn set(&self, key: &OnyxKey, value: Option<Value>) -> anyhow::Result<()> {
        let stored = value.filter(|v| !v.is_null()).map(strip_nulls);
        {
            let mut data = self.data.write();
            match &stored {
                Some(value) => data.insert(key.to_string(), value.clone()),
                None => data.remove(&key.to_string()),
            };
        }
        trace!(%key, "memory store set");
        self.subscribers.notify(key, stored.as_ref());
        Ok(())
    }

    fn merge(&self, key: &OnyxKey, value: Value) -> anyhow::Result<()> {
        let merged = {
            let mut data = self.data.write();
            let name = key.to_string();
            let merged = apply_merge(data.remove(&name), &value);
            if let Some(merged) = &merged {
                data.insert(name, merged.clone());
            }
            merged
        };
        trace!(%key, "memory store merge");
        self.subscribers.notify(key, merged.as_ref());
        Ok(())
    }

    fn subscribe(&self, pattern: KeyPattern, callback: Callback) -> SubscriptionId {
        self.subscribers.add(pattern, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id)
    }
}

/// Envelope written to sled for every document.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct StoredRecord {
    #[n(0)]
    pub json: String,
    #[n(1)]
    pub written_at: TimeStamp<Utc>,
}

impl StoredRecord {
    fn encode(value: &Value) -> anyhow::Result<Vec<u8>> {
        let record = StoredRecord {
            json: serde_json::to_string(value)?,
            written_at: TimeStamp::new(),
        };
        Ok(minicbor::to_vec(&record)?)
    }

    fn decode(key: &str, bytes: &[u8]) -> anyhow::Result<Value> {
        let record: StoredRecord = minicbor::decode(bytes).map_err(|err| StoreError::Codec {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        Ok(serde_json::from_str(&record.json)?)
    }
}

#[derive(Clone)]
pub struct SledStore {
    instance: Arc<sled::Db>,
    subscribers: Arc<Subscribers>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            instance,
            subscribers: Arc::new(Subscribers::default()),
        }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let db = sled::open(path).map_err(StoreError::from)?;
        debug!("opened sled store");
        Ok(Self::new(Arc::new(db)))
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.instance.flush().map_err(StoreError::from)?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &OnyxKey) -> anyhow::Result<Option<Value>> {
        let name = key.to_string();
        match self.instance.get(name.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(StoredRecord::decode(&name, &bytes)?)),
            None => Ok(None),
        }
    }

    fn get_collection(&self, collection: Collection) -> anyhow::Result<Vec<(OnyxKey, Value)>> {
        let mut members = Vec::new();
        for entry in self.instance.scan_prefix(collection.prefix().as_bytes()) {
            let (raw_key, bytes) = entry.map_err(StoreError::from)?;
            let name = String::from_utf8_lossy(&raw_key).into_owned();
            let key: OnyxKey = name.parse()?;
            if key.collection() != Some(collection) {
                continue;
            }
            members.push((key, StoredRecord::decode(&name, &bytes)?));
        }
        Ok(members)
    }

    fn set(&self, key: &OnyxKey, value: Option<Value>) -> anyhow::Result<()> {
        let name = key.to_string();
        let stored = value.filter(|v| !v.is_null()).map(strip_nulls);
        match &stored {
            Some(value) => {
                self.instance
                    .insert(name.as_bytes(), StoredRecord::encode(value)?)
                    .map_err(StoreError::from)?;
            }
            None => {
                self.instance.remove(name.as_bytes()).map_err(StoreError::from)?;
            }
        }
        self.subscribers.notify(key, stored.as_ref());
        Ok(())
    }

    fn merge(&self, key: &OnyxKey, value: Value) -> anyhow::Result<()> {
        let name = key.to_string();
        let mut failure: Option<anyhow::Error> = None;
        let mut merged: Option<Value> = None;

        // sled may re-run the closure on contention; the captures are overwritten each time
        self.instance
            .update_and_fetch(name.as_bytes(), |old| {
                let existing = match old.map(|bytes| StoredRecord::decode(&name, bytes)).transpose() {
                    Ok(existing) => existing,
                    Err(err) => {
                        failure = Some(err);
                        return old.map(|bytes| bytes.to_vec());
                    }
                };
                merged = apply_merge(existing, &value);
                match merged.as_ref().map(StoredRecord::encode).transpose() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        failure = Some(err);
                        old.map(|bytes| bytes.to_vec())
                    }
                }
            })
            .map_err(StoreError::from)?;

        if let Some(err) = failure {
            return Err(err);
        }
        self.subscribers.notify(key, merged.as_ref());
        Ok(())
    }

    fn subscribe(&self, pattern: KeyPattern, callback: Callback) -> SubscriptionId {
        self.subscribers.add(pattern, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id)
    }
}
