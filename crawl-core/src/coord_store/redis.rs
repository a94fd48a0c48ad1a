//! The production [`CoordStore`]: every primitive mapped directly onto Redis
//! commands over an async, auto-reconnecting connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CoordStore, PipelineOp};
use crate::error::CoordError;

/// A [`CoordStore`] backed by Redis. Cheap to clone: [`ConnectionManager`]
/// already multiplexes over a single connection and transparently
/// reconnects, so workers and the Pass Controller can each hold a clone.
#[derive(Clone)]
pub struct RedisCoordStore {
    conn: ConnectionManager,
}

impl RedisCoordStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1/0`) and selects `db`.
    pub async fn connect(url: &str, db: i64) -> Result<Self, CoordError> {
        let client = redis::Client::open(url).map_err(|e| CoordError::Unreachable(e.to_string()))?;
        let mut conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        if db != 0 {
            redis::cmd("SELECT")
                .arg(db)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        }
        Ok(RedisCoordStore { conn })
    }
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(key, member)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .srem(key, member)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn scard(&self, key: &str) -> Result<u64, CoordError> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut conn = self.conn.clone();
        conn.spop(key).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(key, value)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut conn = self.conn.clone();
        conn.lpop(key, None).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1) as usize)
                    .await
                    .map_err(|e| CoordError::Unreachable(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(key, value)
                    .await
                    .map_err(|e| CoordError::Unreachable(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(|e| CoordError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, CoordError> {
        let mut conn = self.conn.clone();
        conn.zrangebyscore(key, min, max)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CoordError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))?;
        while let Some(key) = futures::StreamExt::next(&mut iter).await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), CoordError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                PipelineOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                PipelineOp::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                PipelineOp::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                PipelineOp::Set { key, value, ttl } => match ttl {
                    Some(ttl) => {
                        pipe.set_ex(key, value, ttl.as_secs().max(1) as usize).ignore();
                    }
                    None => {
                        pipe.set(key, value).ignore();
                    }
                },
                PipelineOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                PipelineOp::Incr { key } => {
                    pipe.incr(key, 1).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async(&mut conn)
            .await
            .map_err(|e| CoordError::Unreachable(e.to_string()))
    }
}
