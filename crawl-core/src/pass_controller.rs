//! The Pass Controller (PC-CTL, §4.5): the master-only singleton that drives
//! pass boundaries, snapshot rotation, Exclusion Filter refresh, and initial
//! bootstrap of the pending queue from the configured seeders.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::CrawlConfig;
use crate::coord_store::{self, CoordStore, PipelineOp};
use crate::endpoint::{Address, Endpoint};
use crate::error::{CoordError, CoreError, SessionError};
use crate::exclusion::{ExclusionFilter, ExclusionRuleSet};

/// Stand-in for the source system's `TO_SERVICES` constant (a protocol-layer
/// value out of this core's scope, §1): `NODE_NETWORK` only, the minimal
/// honest claim for a freshly-seeded, not-yet-handshaked candidate.
const DEFAULT_SEED_SERVICES: u64 = 1;

/// DNS resolution of a configured seeder hostname into the addresses it
/// advertises, injected so Bootstrap can be exercised without real DNS I/O
/// (§6 ADDED).
#[async_trait]
pub trait SeedResolver: Send + Sync {
    async fn resolve(&self, seeder: &str) -> Result<(Vec<Ipv4Addr>, Vec<Ipv6Addr>), SessionError>;
}

/// HTTP retrieval of one bogon list's body text, injected for the same
/// reason (§6 ADDED).
#[async_trait]
pub trait BogonFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, SessionError>;
}

/// Resolves seeders through the operating system's own resolver. No extra
/// client crate needed: this is the one piece of "external collaborator"
/// I/O cheap enough to implement directly against the async runtime.
pub struct SystemSeedResolver;

#[async_trait]
impl SeedResolver for SystemSeedResolver {
    async fn resolve(&self, seeder: &str) -> Result<(Vec<Ipv4Addr>, Vec<Ipv6Addr>), SessionError> {
        let target = format!("{seeder}:0");
        let addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| SessionError::Connect(format!("dns lookup of {seeder} failed: {e}")))?;
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in addrs {
            match addr.ip() {
                IpAddr::V4(a) => v4.push(a),
                IpAddr::V6(a) => v6.push(a),
            }
        }
        Ok((v4, v6))
    }
}

/// A thin stub illustrating where a real HTTP client plugs in: bogon-list
/// retrieval is explicitly out of scope for this core (§1), and a failed
/// fetch is non-fatal by design (§7), so refresh simply keeps the previous
/// rule set in force until a real fetcher is configured.
pub struct StubBogonFetcher;

#[async_trait]
impl BogonFetcher for StubBogonFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, SessionError> {
        Err(SessionError::Protocol(
            "no HTTP client configured: plug in an HTTP fetcher crate for bogon URL retrieval".to_string(),
        ))
    }
}

/// The master-only singleton driving pass boundaries (§4.5).
pub struct PassController {
    config: Arc<CrawlConfig>,
    store: Arc<dyn CoordStore>,
    filter: ExclusionFilter,
    seed_resolver: Arc<dyn SeedResolver>,
    bogon_fetcher: Arc<dyn BogonFetcher>,
}

impl PassController {
    pub fn new(
        config: Arc<CrawlConfig>,
        store: Arc<dyn CoordStore>,
        filter: ExclusionFilter,
        seed_resolver: Arc<dyn SeedResolver>,
        bogon_fetcher: Arc<dyn BogonFetcher>,
    ) -> Self {
        PassController { config, store, filter, seed_resolver, bogon_fetcher }
    }

    /// Master-only, once per process (§6 "Bootstrap"): clears any residual
    /// state from a previous run, loads the initial Exclusion Filter, and
    /// seeds `pending` from DNS seeders and configured onion nodes.
    pub async fn bootstrap(&self) -> Result<(), CoreError> {
        self.store
            .set(coord_store::MASTER_STATE, coord_store::RUN_STATE_STARTING, None)
            .await?;

        for pattern in [
            coord_store::NODE_PATTERN,
            coord_store::HEIGHT_PATTERN,
            coord_store::VERSION_PATTERN,
            coord_store::PEER_PATTERN,
            coord_store::CIDR_PATTERN,
        ] {
            self.delete_matching(pattern).await?;
        }
        for key in [coord_store::REACHABLE, coord_store::MEMPOOL_PENDING, coord_store::PENDING] {
            self.store.del(key).await?;
        }

        self.refresh_exclusion().await;
        self.seed_from_seeders().await;
        if let Err(e) = self.seed_onion_nodes().await {
            warn!(error = %e, "failed to publish onion seed endpoints");
        }

        self.store
            .set(coord_store::MASTER_STATE, coord_store::RUN_STATE_RUNNING, None)
            .await?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<(), CoordError> {
        let keys = self.store.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let ops = keys.into_iter().map(|key| PipelineOp::Del { key }).collect();
        self.store.pipeline(ops).await
    }

    async fn seed_from_seeders(&self) {
        let mut ops = Vec::new();
        for seeder in &self.config.seeders {
            match self.seed_resolver.resolve(seeder).await {
                Ok((v4, v6)) => {
                    for addr in v4 {
                        self.push_seed_if_admitted(Address::V4(addr), &mut ops);
                    }
                    if self.config.ipv6 {
                        for addr in v6 {
                            self.push_seed_if_admitted(Address::V6(addr), &mut ops);
                        }
                    }
                }
                Err(e) => warn!(seeder, error = %e, "seed resolution failed"),
            }
        }
        if !ops.is_empty() {
            if let Err(e) = self.store.pipeline(ops).await {
                warn!(error = %e, "failed to publish seed endpoints");
            }
        }
    }

    fn push_seed_if_admitted(&self, address: Address, ops: &mut Vec<PipelineOp>) {
        if self.filter.is_excluded(&address) {
            return;
        }
        let endpoint = Endpoint::new(address, self.config.port, DEFAULT_SEED_SERVICES);
        ops.push(PipelineOp::SAdd { key: coord_store::PENDING.to_string(), member: endpoint.encode() });
    }

    async fn seed_onion_nodes(&self) -> Result<(), CoordError> {
        if !self.config.onion || self.config.onion_nodes.is_empty() {
            return Ok(());
        }
        let ops = self
            .config
            .onion_nodes
            .iter()
            .map(|host| {
                let endpoint = Endpoint::new(Address::Onion(host.clone()), self.config.port, DEFAULT_SEED_SERVICES);
                PipelineOp::SAdd { key: coord_store::PENDING.to_string(), member: endpoint.encode() }
            })
            .collect();
        self.store.pipeline(ops).await
    }

    /// Refreshes the Exclusion Filter by combining static config networks
    /// with freshly fetched bogon lists, then publishing the compiled rule
    /// set both locally and to CS for slaves to reload (§4.1, §4.5 step f).
    /// A failed bogon fetch aborts the whole refresh, per §7: the previous
    /// rule set remains in force rather than publishing a partial one.
    pub async fn refresh_exclusion(&self) {
        let mut ipv4_urls = self.config.exclude_ipv4_bogons_from_urls.clone();
        ipv4_urls.extend(self.config.exclude_ipv4_networks_from_url.clone());
        let mut ipv6_urls = self.config.exclude_ipv6_bogons_from_urls.clone();
        ipv6_urls.extend(self.config.exclude_ipv6_networks_from_url.clone());

        let mut ipv4_texts = Vec::with_capacity(ipv4_urls.len());
        for url in &ipv4_urls {
            match self.bogon_fetcher.fetch(url).await {
                Ok(text) => ipv4_texts.push(text),
                Err(e) => {
                    warn!(url, error = %e, "bogon fetch failed, previous exclusion rules remain in force");
                    return;
                }
            }
        }
        let mut ipv6_texts = Vec::with_capacity(ipv6_urls.len());
        for url in &ipv6_urls {
            match self.bogon_fetcher.fetch(url).await {
                Ok(text) => ipv6_texts.push(text),
                Err(e) => {
                    warn!(url, error = %e, "bogon fetch failed, previous exclusion rules remain in force");
                    return;
                }
            }
        }

        let rules = ExclusionRuleSet::compile(
            &self.config.exclude_ipv4_networks,
            &self.config.exclude_ipv6_networks,
            &ipv4_texts,
            &ipv6_texts,
        );

        let (v4, v6) = rules.to_store_values();
        if let Some(v4) = &v4 {
            if let Err(e) = self.store.set(coord_store::EXCLUDE_IPV4_NETWORKS, v4, None).await {
                warn!(error = %e, "failed to publish ipv4 exclusion rules");
            }
        }
        if let Some(v6) = &v6 {
            if let Err(e) = self.store.set(coord_store::EXCLUDE_IPV6_NETWORKS, v6, None).await {
                warn!(error = %e, "failed to publish ipv6 exclusion rules");
            }
        }

        self.filter.publish(rules);
    }

    /// Loop cadence `cron_delay` seconds (§4.5): report `|pending|`, rotate
    /// the pass when it drains to zero, otherwise wait for the next tick.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut pass_started_at = Instant::now();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let pending = match self.store.scard(coord_store::PENDING).await {
                Ok(count) => {
                    info!(pending = count, "pass controller tick");
                    Some(count)
                }
                Err(e) => {
                    warn!(error = %e, "failed to read pending size");
                    None
                }
            };

            if pending == Some(0) {
                pass_started_at = self.rotate_pass(pass_started_at).await;
            } else {
                tokio::time::sleep(Duration::from_secs(self.config.cron_delay_secs)).await;
            }
        }
    }

    /// Pass boundary (§4.5 steps a–i): snapshot the just-ended `reachable`
    /// set, reseed `pending`, clear pass-scoped keys, refresh the Exclusion
    /// Filter, and enforce the `snapshot_delay` floor on pass duration.
    /// Returns the new pass start instant.
    async fn rotate_pass(&self, pass_started_at: Instant) -> Instant {
        if let Err(e) = self
            .store
            .set(coord_store::MASTER_STATE, coord_store::RUN_STATE_STARTING, None)
            .await
        {
            warn!(error = %e, "failed to flip run_state to starting");
        }

        let elapsed = pass_started_at.elapsed();
        if let Err(e) = self.store.set(coord_store::ELAPSED, &elapsed.as_secs().to_string(), None).await {
            warn!(error = %e, "failed to publish elapsed time");
        }

        let reachable_raw = self.store.smembers(coord_store::REACHABLE).await.unwrap_or_default();
        let reachable: Vec<Endpoint> = reachable_raw
            .iter()
            .filter_map(|raw| match Endpoint::decode(raw) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!(error = %e, "dropping malformed reachable entry at pass rotation");
                    None
                }
            })
            .collect();

        let mut reseed_ops: Vec<PipelineOp> = reachable
            .iter()
            .map(|e| PipelineOp::SAdd { key: coord_store::PENDING.to_string(), member: e.encode() })
            .collect();

        if self.config.include_checked {
            self.collect_checked_reseed(&mut reseed_ops).await;
        }

        if let Err(e) = self.store.pipeline(reseed_ops).await {
            warn!(error = %e, "failed to reseed pending at pass rotation");
        }

        for pattern in [coord_store::NODE_PATTERN, coord_store::CIDR_PATTERN] {
            if let Err(e) = self.delete_matching(pattern).await {
                warn!(error = %e, pattern, "failed to clear pass-scoped keys");
            }
        }
        if let Err(e) = self.store.del(coord_store::REACHABLE).await {
            warn!(error = %e, "failed to clear reachable set");
        }

        self.refresh_exclusion().await;

        match self.write_snapshot(&reachable).await {
            Ok(modal_height) => {
                let history_entry = serde_json::to_string(&(Utc::now().timestamp(), reachable.len()))
                    .expect("tuple of primitives always serializes");
                if let Err(e) = self.store.lpush(coord_store::NODES, &history_entry).await {
                    warn!(error = %e, "failed to push pass history entry");
                }
                if let Err(e) = self.store.set(coord_store::HEIGHT, &modal_height.to_string(), None).await {
                    warn!(error = %e, "failed to publish modal height");
                }
            }
            Err(e) => warn!(error = %e, "failed to write snapshot"),
        }

        let remaining =
            Duration::from_secs(self.config.snapshot_delay_secs).saturating_sub(pass_started_at.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }

        if let Err(e) = self
            .store
            .set(coord_store::MASTER_STATE, coord_store::RUN_STATE_RUNNING, None)
            .await
        {
            warn!(error = %e, "failed to flip run_state back to running");
        }

        Instant::now()
    }

    async fn collect_checked_reseed(&self, reseed_ops: &mut Vec<PipelineOp>) {
        let now = Utc::now().timestamp() as f64;
        let min = now - self.config.max_age_secs as f64;
        match self.store.zrangebyscore(coord_store::CHECK, min, now).await {
            Ok(members) => {
                for raw in members {
                    match Endpoint::decode(&raw) {
                        Ok(endpoint) if !self.filter.is_excluded(&endpoint.address) => {
                            reseed_ops.push(PipelineOp::SAdd {
                                key: coord_store::PENDING.to_string(),
                                member: endpoint.encode(),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "dropping malformed check-set entry"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to read check set for reseed"),
        }
    }

    /// Writes `<crawl_dir>/<timestamp>.json`: a JSON array of
    /// `[address, port, services, height]` for every endpoint in `reachable`,
    /// and returns the modal height across the snapshot (§4.5 step g).
    async fn write_snapshot(&self, reachable: &[Endpoint]) -> Result<i64, CoreError> {
        let mut rows = Vec::with_capacity(reachable.len());
        // Ordered (first-seen, count) pairs rather than a HashMap: iteration order of a
        // hash map is randomized per process, so a tie between two heights would make the
        // reported mode nondeterministic across runs. A Vec preserves first-seen order and
        // ties resolve the same way `Counter.most_common()` resolves them upstream.
        let mut height_counts: Vec<(i64, usize)> = Vec::new();

        for endpoint in reachable {
            let height = match self.store.get(&coord_store::height_key(endpoint)).await {
                Ok(Some(raw)) => raw.parse::<i64>().unwrap_or_else(|_| {
                    warn!(%endpoint, "height value unparsable, recording 0");
                    0
                }),
                Ok(None) => {
                    warn!(%endpoint, "missing height for reachable node, recording 0");
                    0
                }
                Err(e) => {
                    warn!(%endpoint, error = %e, "failed to read height, recording 0");
                    0
                }
            };
            match height_counts.iter_mut().find(|(h, _)| *h == height) {
                Some((_, count)) => *count += 1,
                None => height_counts.push((height, 1)),
            }
            rows.push((endpoint.address.to_string(), endpoint.port, endpoint.services, height));
        }

        // `Iterator::max_by_key` keeps the *last* max on a tie; first-seen must win here to
        // match `Counter.most_common()`, so fold manually instead.
        let mut modal_height = 0;
        let mut modal_count = 0;
        for (height, count) in height_counts {
            if count > modal_count {
                modal_height = height;
                modal_count = count;
            }
        }

        let json = serde_json::to_string(&rows).expect("rows of primitives always serialize");
        let timestamp = Utc::now().timestamp();
        let path = Path::new(&self.config.crawl_dir).join(format!("{timestamp}.json"));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| CoreError::Snapshot(path.display().to_string(), e))?;

        Ok(modal_height)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! Scriptable [`SeedResolver`]/[`BogonFetcher`] doubles for bootstrap and
    //! refresh tests (§8 scenario A onward), used the same way
    //! [`crate::peer_client::fake`] scripts `PeerClient`.

    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    pub struct FakeSeedResolver {
        answers: Arc<Mutex<HashMap<String, (Vec<Ipv4Addr>, Vec<Ipv6Addr>)>>>,
    }

    impl FakeSeedResolver {
        pub fn new() -> Self {
            FakeSeedResolver::default()
        }

        pub async fn script(&self, seeder: &str, v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>) {
            self.answers.lock().await.insert(seeder.to_string(), (v4, v6));
        }
    }

    #[async_trait]
    impl SeedResolver for FakeSeedResolver {
        async fn resolve(&self, seeder: &str) -> Result<(Vec<Ipv4Addr>, Vec<Ipv6Addr>), SessionError> {
            self.answers
                .lock()
                .await
                .get(seeder)
                .cloned()
                .ok_or_else(|| SessionError::Connect(format!("no scripted answer for seeder {seeder}")))
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeBogonFetcher {
        answers: Arc<Mutex<HashMap<String, String>>>,
    }

    impl FakeBogonFetcher {
        pub fn new() -> Self {
            FakeBogonFetcher::default()
        }

        pub async fn script(&self, url: &str, text: &str) {
            self.answers.lock().await.insert(url.to_string(), text.to_string());
        }
    }

    #[async_trait]
    impl BogonFetcher for FakeBogonFetcher {
        async fn fetch(&self, url: &str) -> Result<String, SessionError> {
            self.answers
                .lock()
                .await
                .get(url)
                .cloned()
                .ok_or_else(|| SessionError::Connect(format!("no scripted bogon text for {url}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeBogonFetcher, FakeSeedResolver};
    use super::*;
    use crate::config::Role;
    use crate::coord_store::memory::InMemoryCoordStore;

    fn test_config(overrides: impl FnOnce(&mut CrawlConfig)) -> Arc<CrawlConfig> {
        let mut config = CrawlConfig {
            role: Role::Master,
            logfile: "/tmp/crawl.log".to_string(),
            debug: false,
            magic_number: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            db: 0,
            seeders: vec!["seed.example.com".to_string()],
            workers: 2,
            max_nodes: 1,
            source_address: "0.0.0.0".to_string(),
            protocol_version: 70016,
            user_agent: "/test:0.1/".to_string(),
            services: 0,
            relay: false,
            socket_timeout_secs: 1,
            cron_delay_secs: 0,
            snapshot_delay_secs: 0,
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
            crawl_dir: std::env::temp_dir().to_string_lossy().to_string(),
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
    async fn bootstrap_seeds_pending_from_resolved_seeder() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let resolver = FakeSeedResolver::new();
        resolver.script("seed.example.com", vec!["1.2.3.4".parse().unwrap()], vec![]).await;
        let fetcher = FakeBogonFetcher::new();

        let pc = PassController::new(config, store.clone(), filter, Arc::new(resolver), Arc::new(fetcher));
        pc.bootstrap().await.unwrap();

        assert_eq!(store.scard(coord_store::PENDING).await.unwrap(), 1);
        let state = store.get(coord_store::MASTER_STATE).await.unwrap();
        assert_eq!(state.as_deref(), Some(coord_store::RUN_STATE_RUNNING));
    }

    #[tokio::test]
    async fn bootstrap_excludes_private_seed_addresses() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let resolver = FakeSeedResolver::new();
        resolver.script("seed.example.com", vec!["10.0.0.1".parse().unwrap()], vec![]).await;
        let fetcher = FakeBogonFetcher::new();

        let pc = PassController::new(config, store.clone(), filter, Arc::new(resolver), Arc::new(fetcher));
        pc.bootstrap().await.unwrap();

        assert_eq!(store.scard(coord_store::PENDING).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotate_pass_reseeds_and_clears_reachable() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|_| {});
        let resolver = FakeSeedResolver::new();
        let fetcher = FakeBogonFetcher::new();

        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        store.sadd(coord_store::REACHABLE, &target.encode()).await.unwrap();
        store.set(&coord_store::height_key(&target), "800000", None).await.unwrap();
        store.set(&coord_store::node_key(&target), "", None).await.unwrap();

        let pc = PassController::new(config, store.clone(), filter, Arc::new(resolver), Arc::new(fetcher));
        pc.rotate_pass(Instant::now()).await;

        assert_eq!(store.scard(coord_store::REACHABLE).await.unwrap(), 0);
        assert_eq!(store.scard(coord_store::PENDING).await.unwrap(), 1);
        assert!(store.get(&coord_store::node_key(&target)).await.unwrap().is_none());
        let height = store.get(coord_store::HEIGHT).await.unwrap();
        assert_eq!(height.as_deref(), Some("800000"));
    }

    #[tokio::test]
    async fn refresh_exclusion_keeps_previous_rules_on_fetch_failure() {
        let store: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::new());
        let filter = filter_with_no_rules();
        let config = test_config(|c| {
            c.exclude_ipv4_bogons_from_urls = vec!["http://bogons.example/list.txt".to_string()];
        });
        let resolver = FakeSeedResolver::new();
        let fetcher = FakeBogonFetcher::new(); // unscripted: every fetch fails

        let pc = PassController::new(config, store, filter.clone(), Arc::new(resolver), Arc::new(fetcher));
        pc.refresh_exclusion().await;

        // Still fails closed/admits per the untouched, pre-refresh rule set
        // (compiled empty in the test fixture), not a freshly-published one.
        assert!(!filter.is_excluded(&Address::V4("8.8.8.8".parse().unwrap())));
    }
}
