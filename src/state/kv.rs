//! Hash/list key-value backend.
//!
//! The contract mirrors the primitives the stores need: hash fields holding
//! JSON strings, capped lists holding JSON log entries, and per-key TTLs.
//! The in-memory implementation serializes every mutation behind one lock
//! and expires keys lazily on access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<()>;

    /// Append to a list, trimming the oldest entries beyond `max_len`.
    async fn list_push(&self, key: &str, value: String, max_len: usize) -> Result<()>;
    /// Last `limit` entries, oldest first.
    async fn list_tail(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug)]
enum KvValue {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct KvEntry {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_hash<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, String>) -> R,
    ) -> R {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(|e| e.expired()).unwrap_or(false) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            KvValue::Hash(map) => f(map),
            KvValue::List(_) => {
                entry.value = KvValue::Hash(HashMap::new());
                match &mut entry.value {
                    KvValue::Hash(map) => f(map),
                    KvValue::List(_) => unreachable!(),
                }
            }
        }
    }

    fn with_list<R>(&self, key: &str, f: impl FnOnce(&mut VecDeque<String>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(|e| e.expired()).unwrap_or(false) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            KvValue::List(list) => f(list),
            KvValue::Hash(_) => {
                entry.value = KvValue::List(VecDeque::new());
                match &mut entry.value {
                    KvValue::List(list) => f(list),
                    KvValue::Hash(_) => unreachable!(),
                }
            }
        }
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.with_hash(key, |map| {
            for (field, value) in fields {
                map.insert(field, value);
            }
        });
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.with_hash(key, |map| map.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.with_hash(key, |map| map.clone()))
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        self.with_hash(key, |map| {
            map.remove(field);
        });
        Ok(())
    }

    async fn list_push(&self, key: &str, value: String, max_len: usize) -> Result<()> {
        self.with_list(key, |list| {
            list.push_back(value);
            while list.len() > max_len {
                list.pop_front();
            }
        });
        Ok(())
    }

    async fn list_tail(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self.with_list(key, |list| {
            let skip = list.len().saturating_sub(limit);
            list.iter().skip(skip).cloned().collect()
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_set_and_get() {
        let kv = MemoryKv::new();
        kv.hash_set("k", vec![("a".into(), "1".into())]).await.unwrap();
        assert_eq!(kv.hash_get("k", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.hash_get("k", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_push_trims_oldest() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.list_push("log", format!("{i}"), 3).await.unwrap();
        }
        let tail = kv.list_tail("log", 10).await.unwrap();
        assert_eq!(tail, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn expired_key_reads_empty() {
        let kv = MemoryKv::new();
        kv.hash_set("k", vec![("a".into(), "1".into())]).await.unwrap();
        kv.expire("k", Duration::from_millis(0)).await.unwrap();
        assert!(kv.hash_get_all("k").await.unwrap().is_empty());
    }
}
