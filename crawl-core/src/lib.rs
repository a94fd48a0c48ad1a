//! The distributed crawl coordinator core: the exclusion filter, the
//! coordination-store adapter, the per-node peering cache, the worker pool,
//! and the pass controller. Everything outside this crate that the
//! coordinator depends on — the wire-level peer protocol, the coordination
//! store's transport, DNS and HTTP fetching — is expressed as a trait at the
//! boundary (`PeerClient`, `CoordStore`, `SeedResolver`, `BogonFetcher`) and
//! injected by the binary crate that wires a deployment together.

pub mod config;
pub mod coord_store;
pub mod endpoint;
pub mod error;
pub mod exclusion;
pub mod node_record;
pub mod pass_controller;
pub mod peer_cache;
pub mod peer_client;
pub mod worker;

pub use config::{CrawlConfig, Role, TorProxy};
pub use endpoint::{Address, Endpoint};
pub use error::{ConfigError, CoordError, CoreError, DecodeError, SessionError};
pub use exclusion::{ExclusionFilter, ExclusionRuleSet};
pub use pass_controller::PassController;
pub use worker::Worker;
