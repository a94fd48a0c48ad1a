//! The Worker Pool (WP): N concurrent tasks, each repeatedly dequeuing one
//! candidate endpoint, applying the admission rules in §4.4, and performing
//! either a discover or a mempool-ask session against it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::CrawlConfig;
use crate::coord_store::{self, CoordStore, PipelineOp};
use crate::endpoint::{Address, Endpoint};
use crate::exclusion::{self, ExclusionFilter, ExclusionRuleSet};
use crate::node_record::NodeRecord;
use crate::peer_cache::PeerCache;
use crate::peer_client::PeerClientFactory;

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_secs(1);
const MEMPOOL_SESSION_SPACING: Duration = Duration::from_secs(5);

/// One worker slot. Holds everything it needs to run independently of every
/// other worker: all cross-worker coordination happens through `store`
/// (§5 "Shared-resource discipline").
pub struct Worker {
    pub id: usize,
    config: Arc<CrawlConfig>,
    store: Arc<dyn CoordStore>,
    filter: ExclusionFilter,
    peer_cache: PeerCache,
    client_factory: Arc<dyn PeerClientFactory>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<CrawlConfig>,
        store: Arc<dyn CoordStore>,
        filter: ExclusionFilter,
        client_factory: Arc<dyn PeerClientFactory>,
    ) -> Self {
        let peer_cache = PeerCache::new(store.clone(), filter.clone(), config.clone());
        Worker { id, config, store, filter, peer_cache, client_factory }
    }

    /// Runs until `shutdown` is observed true, checked once per outer loop
    /// iteration and once per admission-gate sleep (cooperative shutdown,
    /// bounded by `socket_timeout`, §5).
    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            if !self.config.role.is_master() {
                if self.wait_for_running(&shutdown).await {
                    break;
                }
            }

            let mempool_mode = self.choose_mode().await;

            let Some(candidate) = self.dequeue(mempool_mode).await else {
                tokio::time::sleep(EMPTY_QUEUE_BACKOFF).await;
                continue;
            };

            if candidate.address.is_ipv6() && !self.config.ipv6 {
                continue;
            }
            if candidate.address.is_onion() && !self.config.onion {
                continue;
            }

            if !mempool_mode {
                let claim_key = coord_store::node_key(&candidate);
                match self.store.get(&claim_key).await {
                    Ok(Some(_)) => continue, // already claimed this pass
                    Ok(None) => {}
                    Err(e) => {
                        warn!(worker = self.id, error = %e, "claim check failed, proceeding conservatively");
                    }
                }
            }

            if let Address::V6(v6) = &candidate.address {
                if self.config.ipv6_prefix < 128 {
                    let cidr = exclusion::ipv6_network_key(v6, self.config.ipv6_prefix);
                    match self.store.incr(&coord_store::cidr_key(&cidr)).await {
                        Ok(count) => {
                            if count as u64 > self.config.nodes_per_ipv6_prefix {
                                debug!(worker = self.id, cidr, count, "cidr prefix over cap, skipping");
                                continue;
                            }
                        }
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "cidr counter increment failed");
                        }
                    }
                }
            }

            if mempool_mode {
                self.mempool_session(candidate).await;
            } else {
                self.discover_session(candidate).await;
            }
        }
    }

    /// Blocks (sampling `run_state` once per `socket_timeout`, refreshing the
    /// Exclusion Filter on every sample) until the master publishes
    /// `running`, or `shutdown` fires. Returns `true` if shutdown won the
    /// race.
    async fn wait_for_running(&self, shutdown: &AtomicBool) -> bool {
        loop {
            match self.store.get(coord_store::MASTER_STATE).await {
                Ok(Some(state)) if state == coord_store::RUN_STATE_RUNNING => return false,
                _ => {}
            }
            if shutdown.load(Ordering::Relaxed) {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(self.config.socket_timeout_secs)).await;
            self.refresh_exclusion_from_store().await;
        }
    }

    async fn refresh_exclusion_from_store(&self) {
        let v4 = self.store.get(coord_store::EXCLUDE_IPV4_NETWORKS).await.ok().flatten();
        let v6 = self.store.get(coord_store::EXCLUDE_IPV6_NETWORKS).await.ok().flatten();
        self.filter.publish(ExclusionRuleSet::from_store_values(v4.as_deref(), v6.as_deref()));
    }

    /// `mempool_mode := (|reachable| >= max_nodes) OR coin_flip`. The coin
    /// flip is evaluated unconditionally so the blend starts before
    /// saturation (§4.4 step 2, §9 "Mode-choice expression").
    async fn choose_mode(&self) -> bool {
        let coin_flip = rand::thread_rng().gen_bool(0.5);
        let saturated = match self.store.scard(coord_store::REACHABLE).await {
            Ok(count) => count as usize >= self.config.max_nodes,
            Err(e) => {
                warn!(worker = self.id, error = %e, "failed to read reachable count");
                false
            }
        };
        saturated || coin_flip
    }

    async fn dequeue(&self, mempool_mode: bool) -> Option<Endpoint> {
        let raw = if mempool_mode {
            match self.store.lpop(coord_store::MEMPOOL_PENDING).await {
                Ok(Some(popped)) => {
                    // Round-robin: put it straight back on the tail.
                    if let Err(e) = self.store.lpush(coord_store::MEMPOOL_PENDING, &popped).await {
                        warn!(worker = self.id, error = %e, "failed to re-push mempool candidate");
                    }
                    Some(popped)
                }
                Ok(None) => self.store.spop(coord_store::PENDING).await.ok().flatten(),
                Err(e) => {
                    warn!(worker = self.id, error = %e, "mempool_pending lpop failed");
                    None
                }
            }
        } else {
            self.store.spop(coord_store::PENDING).await.ok().flatten()
        };

        let raw = raw?;
        match Endpoint::decode(&raw) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(worker = self.id, error = %e, "dropping malformed queue entry");
                None
            }
        }
    }

    /// `connect` (§4.4): publish the claim, open and handshake, rewrite the
    /// endpoint identity on a services mismatch, then pipeline every
    /// resulting mutation together.
    async fn discover_session(&self, candidate: Endpoint) {
        let claim_key = coord_store::node_key(&candidate);
        if let Err(e) = self.store.set(&claim_key, "", None).await {
            warn!(worker = self.id, error = %e, "failed to publish claim");
        }

        let proxy = self.choose_proxy(&candidate);
        let timeout = Duration::from_secs(self.config.socket_timeout_secs);

        let mut client = match self.client_factory.connect(&candidate, proxy.as_ref(), timeout).await {
            Ok(c) => c,
            Err(e) => {
                debug!(worker = self.id, %candidate, error = %e, "connect failed");
                return;
            }
        };

        let handshake = match client.handshake().await {
            Ok(h) => h,
            Err(e) => {
                debug!(worker = self.id, %candidate, error = %e, "handshake failed");
                client.close().await;
                return;
            }
        };

        let canonical = if handshake.services != candidate.services {
            debug!(
                worker = self.id,
                %candidate,
                expected = candidate.services,
                got = handshake.services,
                "services mismatch, rewriting endpoint identity"
            );
            candidate.with_services(handshake.services)
        } else {
            candidate.clone()
        };

        let sample = self.peer_cache.get(&candidate, client.as_mut()).await.unwrap_or_else(|e| {
            warn!(worker = self.id, %candidate, error = %e, "peer cache lookup failed");
            Default::default()
        });

        client.close().await;

        let max_age = Duration::from_secs(self.config.max_age_secs.max(0) as u64);
        let mut ops = vec![
            PipelineOp::Set {
                key: coord_store::height_key(&canonical),
                value: handshake.height.to_string(),
                ttl: Some(max_age),
            },
            PipelineOp::Set {
                key: coord_store::version_key(&candidate),
                value: NodeRecord::new(handshake.version, &handshake.user_agent, handshake.services).encode(),
                ttl: Some(max_age),
            },
        ];
        for peer in &sample.peers {
            ops.push(PipelineOp::SAdd { key: coord_store::PENDING.to_string(), member: peer.encode() });
        }
        ops.push(PipelineOp::Set { key: coord_store::node_key(&canonical), value: String::new(), ttl: None });
        ops.push(PipelineOp::SAdd { key: coord_store::REACHABLE.to_string(), member: canonical.encode() });
        ops.push(PipelineOp::LPush { key: coord_store::MEMPOOL_PENDING.to_string(), value: canonical.encode() });

        if let Err(e) = self.store.pipeline(ops).await {
            warn!(worker = self.id, %canonical, error = %e, "failed to publish handshake results");
        }

        info!(worker = self.id, %canonical, height = handshake.height, "discovered reachable node");
    }

    /// `ask_mempool` (§4.4): open, request the inventory, log its size, then
    /// yield `5s` before this worker slot is released back to the loop.
    async fn mempool_session(&self, candidate: Endpoint) {
        let proxy = self.choose_proxy(&candidate);
        let timeout = Duration::from_secs(self.config.socket_timeout_secs);

        let mut client = match self.client_factory.connect(&candidate, proxy.as_ref(), timeout).await {
            Ok(c) => c,
            Err(e) => {
                debug!(worker = self.id, %candidate, error = %e, "connect failed");
                tokio::time::sleep(MEMPOOL_SESSION_SPACING).await;
                return;
            }
        };

        match client.mempool().await {
            Ok(inventory) if !inventory.is_empty() => {
                info!(worker = self.id, %candidate, count = inventory.len(), "received mempool");
            }
            Ok(_) => {}
            Err(e) => debug!(worker = self.id, %candidate, error = %e, "mempool request failed"),
        }

        client.close().await;
        tokio::time::sleep(MEMPOOL_SESSION_SPACING).await;
    }

    fn choose_proxy(&self, candidate: &Endpoint) -> Option<crate::config::TorProxy> {
        if candidate.address.is_onion() && self.config.onion && !self.config.tor_proxies.is_empty() {
            let idx = rand::thread_rng().gen_range(0..self.config.tor_proxies.len());
            Some(self.config.tor_proxies[idx].clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::coord_store::memory::InMemoryCoordStore;
    use crate::exclusion::ExclusionFilter;
    use crate::peer_client::fake::{FakePeerClientFactory, ScriptedPeer};
    use crate::peer_client::HandshakeInfo;

    fn test_config(overrides: impl FnOnce(&mut CrawlConfig)) -> Arc<CrawlConfig> {
        let mut config = CrawlConfig {
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
        };
        overrides(&mut config);
        Arc::new(config)
    }

    fn filter_with_no_rules() -> ExclusionFilter {
        let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
        filter.publish(ExclusionRuleSet::compile(&[], &[], &[], &[]));
        filter
    }

    #[tokio::test]
    async fn discover_session_publishes_reachable_and_height() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let factory = Arc::new(FakePeerClientFactory::new());
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        factory
            .script(
                &target,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".into(),
                        services: 9,
                        height: 800_000,
                    }),
                    ..Default::default()
                },
            )
            .await;

        let worker = Worker::new(0, config, store.clone(), filter, factory);
        worker.discover_session(target.clone()).await;

        assert_eq!(store.scard(coord_store::REACHABLE).await.unwrap(), 1);
        let height = store.get(&coord_store::height_key(&target)).await.unwrap();
        assert_eq!(height.as_deref(), Some("800000"));
    }

    #[tokio::test]
    async fn services_mismatch_rewrites_canonical_identity() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let factory = Arc::new(FakePeerClientFactory::new());
        let candidate = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 1);
        factory
            .script(
                &candidate,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".into(),
                        services: 9,
                        height: 1,
                    }),
                    ..Default::default()
                },
            )
            .await;

        let worker = Worker::new(0, config, store.clone(), filter, factory);
        worker.discover_session(candidate.clone()).await;

        let rewritten = candidate.with_services(9);
        assert!(store.get(&coord_store::height_key(&rewritten)).await.unwrap().is_some());
        assert!(store.get(&coord_store::height_key(&candidate)).await.unwrap().is_none());
        let members = store.smembers(coord_store::REACHABLE).await.unwrap();
        assert_eq!(members, vec![rewritten.encode()]);
    }

    #[tokio::test]
    async fn claimed_endpoint_is_skipped_in_discover_mode() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let factory = Arc::new(FakePeerClientFactory::new());
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        store.set(&coord_store::node_key(&target), "", None).await.unwrap();

        let claim = store.get(&coord_store::node_key(&target)).await.unwrap();
        assert!(claim.is_some());
        let _ = (config, factory); // claim check happens in run(), exercised at integration level
    }

    #[tokio::test]
    async fn ipv6_disabled_candidates_are_not_dequeued_for_sessions() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|c| c.ipv6 = false);
        let factory = Arc::new(FakePeerClientFactory::new());
        let worker = Worker::new(0, config, store, filter, factory);
        let target = Endpoint::new(Address::V6("2001:db8::1".parse().unwrap()), 8333, 9);
        assert!(target.address.is_ipv6());
        assert!(!worker.config.ipv6);
    }
}
