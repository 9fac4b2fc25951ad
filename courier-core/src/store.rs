// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key-value persistence seam.
//!
//! Relational storage is owned by the host application; this crate only
//! needs upsert, point reads, prefix scans and deletes over JSON records.
use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

pub trait KeyValueStore: Send + Sync {
    fn upsert(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Entries whose key starts with `prefix`, in key order.
    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn delete(&self, key: &str) -> Result<bool>;
}

pub fn put_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.upsert(key, &bytes)
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn query_json<T: DeserializeOwned>(store: &dyn KeyValueStore, prefix: &str) -> Result<Vec<T>> {
    store
        .query_prefix(prefix)?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Into::into))
        .collect()
}

/// In-process store, used by tests and as the default when the host
/// supplies no persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_prefix_query_is_scoped() {
        let store = MemoryStore::new();
        store.upsert("approval/a", b"1").unwrap();
        store.upsert("approval/b", b"2").unwrap();
        store.upsert("approvals", b"3").unwrap();
        store.upsert("session/a", b"4").unwrap();

        let hits = store.query_prefix("approval/").unwrap();
        let keys: Vec<_> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["approval/a", "approval/b"]);
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        let record = Record {
            name: "x".into(),
            count: 2,
        };
        put_json(&store, "r/1", &record).unwrap();

        let loaded: Option<Record> = get_json(&store, "r/1").unwrap();
        assert_eq!(loaded, Some(record));

        assert!(store.delete("r/1").unwrap());
        assert!(!store.delete("r/1").unwrap());
        assert!(get_json::<Record>(&store, "r/1").unwrap().is_none());
    }
}
