//! The CoordStore Adapter (CS): the only part of this core that knows the
//! shared key-value store's key layout. Everything else — Worker Pool, Pass
//! Controller, PeerCache — programs against the [`CoordStore`] trait and the
//! key-naming helpers below, never against a concrete store API.
//!
//! Two backends ship: [`redis::RedisCoordStore`] (production, since the
//! source system assumes a Redis-shaped coordination store) and
//! [`memory::InMemoryCoordStore`] (deterministic, single-process, tests only).

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::error::CoordError;

/// One mutation queued for pipelined, multi-key execution. A successful
/// handshake publishes several of these together so that, from the
/// publishing worker's point of view, they become visible as a unit (§4.2);
/// the store itself need not be transactional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    LPush { key: String, value: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Incr { key: String },
}

/// The set/list/string/counter/sorted-set primitives the coordinator needs,
/// plus key-pattern scan and pipelined multi-op execution. Semantic names
/// only — no method here leaks a store-specific command name.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, CoordError>;
    async fn scard(&self, key: &str) -> Result<u64, CoordError>;
    /// Pops and returns an arbitrary member of the set, or `None` if empty.
    async fn spop(&self, key: &str) -> Result<Option<String>, CoordError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), CoordError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError>;
    async fn del(&self, key: &str) -> Result<(), CoordError>;

    /// Atomically increments the integer counter at `key` (creating it at 1
    /// if absent) and returns the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64, CoordError>;

    /// Members of the sorted set at `key` with score in `[min, max]`.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, CoordError>;

    /// Enumerates keys matching a `*`-glob pattern (e.g. `"node:*"`).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CoordError>;

    /// Executes a batch of mutations together. Coordination-write errors are
    /// logged by the caller and do not abort the batch (§7): a backend may
    /// choose to apply ops best-effort rather than all-or-nothing.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), CoordError>;
}

/// The claim key that serializes discovery of `endpoint` within a pass.
pub fn node_key(endpoint: &Endpoint) -> String {
    format!("node:{}", endpoint.dash_key())
}

/// The handshake-height key for `endpoint`, TTL `max_age`.
pub fn height_key(endpoint: &Endpoint) -> String {
    format!("height:{}", endpoint.dash_key())
}

/// The version-tuple key, keyed by address-port only (not services) — this
/// mirrors the source system exactly: the rewritten services value lives in
/// `height:*`/`node:*`, but `version:*` stays keyed off the pre-handshake
/// address and port.
pub fn version_key(endpoint: &Endpoint) -> String {
    format!("version:{}-{}", endpoint.address, endpoint.port)
}

/// The PeerCache key for `endpoint`, keyed by address-port only (a cached
/// `getaddr` reply doesn't depend on which services bitmask we guessed).
pub fn peer_cache_key(endpoint: &Endpoint) -> String {
    format!("peer:{}-{}", endpoint.address, endpoint.port)
}

/// The pass-scoped CIDR counter key for a compiled `<network>/<prefix>` string.
pub fn cidr_key(network_prefix: &str) -> String {
    format!("crawl:cidr:{network_prefix}")
}

pub const PENDING: &str = "pending";
pub const REACHABLE: &str = "reachable";
pub const MEMPOOL_PENDING: &str = "mempool_pending";
pub const CHECK: &str = "check";
pub const EXCLUDE_IPV4_NETWORKS: &str = "exclude-ipv4-networks";
pub const EXCLUDE_IPV6_NETWORKS: &str = "exclude-ipv6-networks";
pub const MASTER_STATE: &str = "crawl:master:state";
pub const ELAPSED: &str = "elapsed";
pub const NODES: &str = "nodes";
pub const HEIGHT: &str = "height";

pub const NODE_PATTERN: &str = "node:*";
pub const HEIGHT_PATTERN: &str = "height:*";
pub const VERSION_PATTERN: &str = "version:*";
pub const PEER_PATTERN: &str = "peer:*";
pub const CIDR_PATTERN: &str = "crawl:cidr:*";

pub const RUN_STATE_RUNNING: &str = "running";
pub const RUN_STATE_STARTING: &str = "starting";
