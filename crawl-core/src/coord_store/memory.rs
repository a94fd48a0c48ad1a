//! A [`CoordStore`] backed by ordinary concurrent collections. Exists purely
//! for deterministic tests (the end-to-end scenarios in spec §8) and
//! single-process trials; it does not share state across processes, so it is
//! never a production deployment target.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use tokio::sync::Mutex;

use super::{CoordStore, PipelineOp};
use crate::error::CoordError;

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Tables {
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, StringEntry>,
    counters: HashMap<String, i64>,
    zsets: HashMap<String, Vec<(String, f64)>>,
}

/// An in-memory [`CoordStore`]. Clone-cheap: internally an `Arc<Mutex<_>>`, so
/// every clone sees the same state (the way a real Redis connection pool
/// would).
#[derive(Clone, Default)]
pub struct InMemoryCoordStore {
    tables: std::sync::Arc<Mutex<Tables>>,
}

impl InMemoryCoordStore {
    pub fn new() -> Self {
        InMemoryCoordStore::default()
    }

    fn is_live(entry: &StringEntry) -> bool {
        match entry.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// Matches a single-level `*`-glob (the only shape this core ever scans with,
/// e.g. `"node:*"`).
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[async_trait]
impl CoordStore for InMemoryCoordStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CoordError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<u64, CoordError> {
        let tables = self.tables.lock().await;
        Ok(tables.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut tables = self.tables.lock().await;
        let Some(set) = tables.sets.get_mut(key) else {
            return Ok(None);
        };
        let chosen = set.iter().choose(&mut rand::thread_rng()).cloned();
        if let Some(ref member) = chosen {
            set.remove(member);
        }
        Ok(chosen)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), CoordError> {
        let mut tables = self.tables.lock().await;
        tables
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut tables = self.tables.lock().await;
        let live = tables.strings.get(key).map(Self::is_live).unwrap_or(false);
        if !live {
            tables.strings.remove(key);
            return Ok(None);
        }
        Ok(tables.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut tables = self.tables.lock().await;
        tables.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CoordError> {
        let mut tables = self.tables.lock().await;
        tables.strings.remove(key);
        tables.sets.remove(key);
        tables.lists.remove(key);
        tables.counters.remove(key);
        tables.zsets.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordError> {
        let mut tables = self.tables.lock().await;
        let counter = tables.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, CoordError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .zsets
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CoordError> {
        let tables = self.tables.lock().await;
        let mut keys: Vec<String> = Vec::new();
        keys.extend(tables.strings.keys().filter(|k| glob_match(pattern, k)).cloned());
        keys.extend(tables.sets.keys().filter(|k| glob_match(pattern, k)).cloned());
        keys.extend(tables.lists.keys().filter(|k| glob_match(pattern, k)).cloned());
        keys.extend(tables.counters.keys().filter(|k| glob_match(pattern, k)).cloned());
        keys.extend(tables.zsets.keys().filter(|k| glob_match(pattern, k)).cloned());
        Ok(keys)
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), CoordError> {
        let mut tables = self.tables.lock().await;
        for op in ops {
            match op {
                PipelineOp::SAdd { key, member } => {
                    tables.sets.entry(key).or_default().insert(member);
                }
                PipelineOp::SRem { key, member } => {
                    if let Some(set) = tables.sets.get_mut(&key) {
                        set.remove(&member);
                    }
                }
                PipelineOp::LPush { key, value } => {
                    tables.lists.entry(key).or_default().push_back(value);
                }
                PipelineOp::Set { key, value, ttl } => {
                    tables.strings.insert(
                        key,
                        StringEntry {
                            value,
                            expires_at: ttl.map(|d| Instant::now() + d),
                        },
                    );
                }
                PipelineOp::Del { key } => {
                    tables.strings.remove(&key);
                    tables.sets.remove(&key);
                    tables.lists.remove(&key);
                    tables.counters.remove(&key);
                    tables.zsets.remove(&key);
                }
                PipelineOp::Incr { key } => {
                    let counter = tables.counters.entry(key).or_insert(0);
                    *counter += 1;
                }
            }
        }
        Ok(())
    }
}

/// Only used by tests wanting to seed a `check` sorted set directly (the real
/// `check` set is read-only to this core and populated by an external
/// collaborator per §6).
#[cfg(any(test, feature = "test-util"))]
impl InMemoryCoordStore {
    pub async fn zadd_for_test(&self, key: &str, member: &str, score: f64) {
        let mut tables = self.tables.lock().await;
        tables
            .zsets
            .entry(key.to_string())
            .or_default()
            .push((member.to_string(), score));
    }
}
