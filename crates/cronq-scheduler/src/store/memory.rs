use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cronq_core::PeriodTask;

use super::{decode_all, decode_one, TaskStore};
use crate::error::Result;

type Hashes = HashMap<String, BTreeMap<String, String>>;

/// Process-local store. Records are kept in their persisted JSON form so the
/// encoding is exercised exactly as with the shared backends.
///
/// Clones share the same backing map; [`MemoryTaskStore::for_hash`] opens
/// another group's hash on the same backing map.
#[derive(Clone)]
pub struct MemoryTaskStore {
    hashes: Arc<Mutex<Hashes>>,
    hash_key: String,
}

impl MemoryTaskStore {
    pub fn new(hash_key: impl Into<String>) -> Self {
        Self {
            hashes: Arc::new(Mutex::new(HashMap::new())),
            hash_key: hash_key.into(),
        }
    }

    pub fn for_hash(&self, hash_key: impl Into<String>) -> Self {
        Self {
            hashes: Arc::clone(&self.hashes),
            hash_key: hash_key.into(),
        }
    }

    /// Write a raw field value, bypassing encoding.
    pub fn put_raw(&self, uid: &str, raw: &str) {
        self.hashes()
            .entry(self.hash_key.clone())
            .or_default()
            .insert(uid.to_string(), raw.to_string());
    }

    fn hashes(&self) -> MutexGuard<'_, Hashes> {
        self.hashes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, task: &PeriodTask) -> Result<()> {
        let raw = task.to_json()?;
        self.hashes()
            .entry(self.hash_key.clone())
            .or_default()
            .insert(task.uid.clone(), raw);
        Ok(())
    }

    async fn save_batch(&self, tasks: &[PeriodTask]) -> Result<()> {
        let encoded = tasks
            .iter()
            .map(|t| Ok((t.uid.clone(), t.to_json()?)))
            .collect::<Result<Vec<_>>>()?;
        let mut hashes = self.hashes();
        let fields = hashes.entry(self.hash_key.clone()).or_default();
        fields.extend(encoded);
        Ok(())
    }

    async fn get(&self, uid: &str) -> Result<Option<PeriodTask>> {
        let raw = self
            .hashes()
            .get(&self.hash_key)
            .and_then(|fields| fields.get(uid).cloned());
        raw.map(|r| decode_one(uid, &r)).transpose()
    }

    async fn delete(&self, uid: &str) -> Result<bool> {
        Ok(self
            .hashes()
            .get_mut(&self.hash_key)
            .and_then(|fields| fields.remove(uid))
            .is_some())
    }

    async fn list_all(&self) -> Result<Vec<PeriodTask>> {
        let raw: Vec<(String, String)> = self
            .hashes()
            .get(&self.hash_key)
            .map(|fields| fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(decode_all(&self.hash_key, raw))
    }
}
