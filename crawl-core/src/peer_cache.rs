//! The PeerCache (PC): per-destination memoization of `getaddr` replies with
//! jittered TTL, so revisiting the same node within a pass doesn't re-issue
//! the gossip round-trip (§4.3).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::CrawlConfig;
use crate::coord_store::{self, CoordStore};
use crate::endpoint::{Address, Endpoint};
use crate::error::CoordError;
use crate::exclusion::ExclusionFilter;
use crate::node_record::PeeringSample;
use crate::peer_client::{AddrKind, PeerClient};

/// A `getaddr` reply above this size is treated as flooding and rejected
/// outright rather than truncated (§4.3, §9 open question — spec follows the
/// source: reject, don't clip).
const MAX_ACCEPTED_PEERS: usize = 1000;

const POLL_CADENCE: Duration = Duration::from_millis(300);

const STORE_ENCODING_VERSION: &str = "v1";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CachedPeer {
    address: Address,
    port: u16,
    services: u64,
    timestamp: i64,
}

pub struct PeerCache {
    store: Arc<dyn CoordStore>,
    filter: ExclusionFilter,
    config: Arc<CrawlConfig>,
}

impl PeerCache {
    pub fn new(store: Arc<dyn CoordStore>, filter: ExclusionFilter, config: Arc<CrawlConfig>) -> Self {
        PeerCache { store, filter, config }
    }

    /// Looks up the cached peering sample for `target`. On a miss, issues one
    /// `getaddr` over `client` (the already-open connection to `target`),
    /// post-processes the reply, and stores it under a jittered TTL.
    pub async fn get(
        &self,
        target: &Endpoint,
        client: &mut dyn PeerClient,
    ) -> Result<PeeringSample, CoordError> {
        let key = coord_store::peer_cache_key(target);

        if let Some(raw) = self.store.get(&key).await? {
            match decode_cached(&raw) {
                Ok(sample) => {
                    debug!(%target, count = sample.len(), "peer cache hit");
                    return Ok(sample);
                }
                Err(_) => {
                    warn!(%target, "peer cache value malformed, refetching");
                }
            }
        }

        let sample = self.fetch(target, client).await;

        let ttl = if sample.is_empty() {
            Duration::from_secs(self.config.addr_ttl_secs / 2)
        } else {
            let jitter_pct: u64 = rand::thread_rng().gen_range(0..=u64::from(self.config.addr_ttl_var_pct));
            let jitter = self.config.addr_ttl_secs * jitter_pct / 100;
            Duration::from_secs(self.config.addr_ttl_secs + jitter)
        };

        let encoded = encode_cached(&sample, Utc::now().timestamp());
        if let Err(e) = self.store.set(&key, &encoded, Some(ttl)).await {
            warn!(%target, error = %e, "failed to cache peer sample");
        }

        Ok(sample)
    }

    async fn fetch(&self, target: &Endpoint, client: &mut dyn PeerClient) -> PeeringSample {
        if let Err(e) = client.getaddr().await {
            debug!(%target, error = %e, "getaddr failed");
            return PeeringSample::default();
        }

        let mut accepted = Vec::new();
        let polls = self.config.socket_timeout_secs.max(1);
        for _ in 0..polls {
            tokio::time::sleep(POLL_CADENCE).await;
            match client.get_messages(&[AddrKind::Addr, AddrKind::AddrV2]).await {
                Ok(frames) => {
                    if frames.iter().any(|f| f.count > 1) {
                        accepted = frames;
                        break;
                    }
                    // count <= 1 frames are self-ads; keep polling.
                }
                Err(e) => {
                    debug!(%target, error = %e, "get_messages failed");
                    break;
                }
            }
        }

        let now = Utc::now().timestamp();
        let mut seen: HashSet<CachedPeer> = HashSet::new();
        for frame in &accepted {
            if frame.count <= 1 {
                continue;
            }
            for entry in &frame.addr_list {
                let age = now - entry.timestamp.timestamp();
                if age < 0 || age > self.config.max_age_secs {
                    continue;
                }
                let address = entry
                    .ipv4
                    .map(Address::V4)
                    .or_else(|| entry.ipv6.map(Address::V6))
                    .or_else(|| entry.onion.clone().map(Address::Onion));
                let Some(address) = address else {
                    continue;
                };
                if self.filter.is_excluded(&address) {
                    continue;
                }
                let port = if entry.port == 0 { self.config.port } else { entry.port };
                seen.insert(CachedPeer {
                    address,
                    port,
                    services: entry.services,
                    timestamp: entry.timestamp.timestamp(),
                });
            }
        }

        if seen.len() > MAX_ACCEPTED_PEERS {
            warn!(%target, count = seen.len(), "peers rejected: exceeded flood threshold");
            return PeeringSample::default();
        }

        let mut peers: Vec<CachedPeer> = seen.into_iter().collect();
        peers.truncate(self.config.peers_per_node);
        PeeringSample {
            peers: peers
                .into_iter()
                .map(|p| Endpoint::new(p.address, p.port, p.services))
                .collect(),
        }
    }
}

/// Encodes the cached `(address, port, services, timestamp)` tuples behind a
/// versioned envelope, per the explicit-encoding mandate in §3/§9.
fn encode_cached(sample: &PeeringSample, timestamp: i64) -> String {
    let tuples: Vec<(String, u16, u64, i64)> = sample
        .peers
        .iter()
        .map(|e| (e.address.to_string(), e.port, e.services, timestamp))
        .collect();
    let json = serde_json::to_string(&tuples).expect("tuples of primitives always serialize");
    format!("{STORE_ENCODING_VERSION}:{json}")
}

fn decode_cached(raw: &str) -> Result<PeeringSample, CoordError> {
    let rest = raw
        .strip_prefix(&format!("{STORE_ENCODING_VERSION}:"))
        .ok_or_else(|| CoordError::Decode(crate::error::DecodeError::BadEnvelope(raw.to_string())))?;
    let tuples: Vec<(String, u16, u64, i64)> = serde_json::from_str(rest)
        .map_err(|_| CoordError::Decode(crate::error::DecodeError::BadEnvelope(raw.to_string())))?;
    let peers = tuples
        .into_iter()
        .map(|(address, port, services, _timestamp)| {
            address
                .parse()
                .map(|address| Endpoint::new(address, port, services))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(CoordError::Decode)?;
    Ok(PeeringSample { peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord_store::memory::InMemoryCoordStore;
    use crate::exclusion::{ExclusionFilter, ExclusionRuleSet};
    use crate::peer_client::fake::{FakePeerClientFactory, ScriptedPeer};
    use crate::peer_client::{HandshakeInfo, PeerClientFactory};
    use std::net::Ipv4Addr;

    fn test_config() -> Arc<CrawlConfig> {
        Arc::new(test_crawl_config())
    }

    fn test_crawl_config() -> CrawlConfig {
        use crate::config::Role;
        CrawlConfig {
            role: Role::Master,
            logfile: "/tmp/crawl.log".to_string(),
            debug: false,
            magic_number: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            db: 0,
            seeders: vec![],
            workers: 2,
            max_nodes: 1,
            source_address: "0.0.0.0".to_string(),
            protocol_version: 70016,
            user_agent: "/test:0.1/".to_string(),
            services: 0,
            relay: false,
            socket_timeout_secs: 1,
            cron_delay_secs: 1,
            snapshot_delay_secs: 1,
            addr_ttl_secs: 100,
            addr_ttl_var_pct: 10,
            max_age_secs: 10_800,
            peers_per_node: 8,
            ipv6: false,
            ipv6_prefix: 128,
            nodes_per_ipv6_prefix: 1,
            exclude_ipv4_networks: vec![],
            exclude_ipv6_networks: vec![],
            exclude_ipv4_bogons_from_urls: vec![],
            exclude_ipv6_bogons_from_urls: vec![],
            exclude_ipv4_networks_from_url: None,
            exclude_ipv6_networks_from_url: None,
            onion: false,
            tor_proxies: vec![],
            onion_nodes: vec![],
            include_checked: false,
            crawl_dir: "/tmp".to_string(),
        }
    }

    fn gossiped(addr: Ipv4Addr, port: u16, services: u64) -> crate::peer_client::GossipedAddr {
        crate::peer_client::GossipedAddr {
            ipv4: Some(addr),
            ipv6: None,
            onion: None,
            port,
            services,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn single_entry_addr_reply_is_discarded_as_self_ad() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        let config = test_config();
        let cache = PeerCache::new(store, filter, config);

        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        factory
            .script(
                &target,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".into(),
                        services: 9,
                        height: 1,
                    }),
                    addr_batches: vec![vec![gossiped("5.6.7.8".parse().unwrap(), 8333, 9)]].into(),
                    ..Default::default()
                },
            )
            .await;
        let mut client = factory.connect(&target, None, Duration::from_secs(1)).await.unwrap();
        client.handshake().await.unwrap();

        let sample = cache.get(&target, client.as_mut()).await.unwrap();
        assert!(sample.is_empty());
    }

    #[tokio::test]
    async fn two_entry_addr_reply_is_accepted_and_cached() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        let config = test_config();
        let cache = PeerCache::new(store.clone(), filter, config);

        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        factory
            .script(
                &target,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".into(),
                        services: 9,
                        height: 1,
                    }),
                    addr_batches: vec![vec![
                        gossiped("5.6.7.8".parse().unwrap(), 8333, 9),
                        gossiped("9.10.11.12".parse().unwrap(), 8333, 9),
                    ]]
                    .into(),
                    ..Default::default()
                },
            )
            .await;
        let mut client = factory.connect(&target, None, Duration::from_secs(1)).await.unwrap();
        client.handshake().await.unwrap();

        let sample = cache.get(&target, client.as_mut()).await.unwrap();
        assert_eq!(sample.len(), 2);

        let key = coord_store::peer_cache_key(&target);
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn future_dated_entry_is_dropped() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        let config = test_config();
        let cache = PeerCache::new(store, filter, config);

        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        let mut future_entry = gossiped("5.6.7.8".parse().unwrap(), 8333, 9);
        future_entry.timestamp = Utc::now() + chrono::Duration::seconds(3600);
        let mut present_entry = gossiped("9.10.11.12".parse().unwrap(), 8333, 9);
        present_entry.timestamp = Utc::now();
        factory
            .script(
                &target,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".into(),
                        services: 9,
                        height: 1,
                    }),
                    addr_batches: vec![vec![future_entry, present_entry]].into(),
                    ..Default::default()
                },
            )
            .await;
        let mut client = factory.connect(&target, None, Duration::from_secs(1)).await.unwrap();
        client.handshake().await.unwrap();

        let sample = cache.get(&target, client.as_mut()).await.unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample.peers[0].address, Address::V4("9.10.11.12".parse().unwrap()));
    }

    #[test]
    fn encode_decode_round_trips() {
        let sample = PeeringSample {
            peers: vec![Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9)],
        };
        let encoded = encode_cached(&sample, 12345);
        let decoded = decode_cached(&encoded).unwrap();
        assert_eq!(decoded, sample);
    }
}
