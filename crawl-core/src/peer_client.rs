//! The `PeerClient` capability (§6): the wire-level Bitcoin protocol codec is
//! explicitly out of scope for this core (§1), so this module ships only the
//! trait the Worker Pool and PeerCache program against, a thin connector
//! stub showing where a real codec crate plugs in, and (behind `test-util`)
//! a scriptable fake used by the scenario tests in spec §8.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TorProxy;
use crate::endpoint::Endpoint;
use crate::error::SessionError;

/// The handshake-reported facts returned by a successful `handshake()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub version: u32,
    pub user_agent: String,
    pub services: u64,
    pub height: i64,
}

/// Which gossip message kinds `get_messages` should drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrKind {
    Addr,
    AddrV2,
}

/// One peer entry gossiped back inside an `addr`/`addrv2` reply, before
/// post-processing (PeerCache) strips the timestamp and resolves the address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipedAddr {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub onion: Option<String>,
    pub port: u16,
    pub services: u64,
    pub timestamp: DateTime<Utc>,
}

/// One buffered inbound `addr`/`addrv2` frame.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AddrFrame {
    pub count: usize,
    pub addr_list: Vec<GossipedAddr>,
}

/// An open, handshaken-or-handshaking session with one peer. Every method
/// here is a suspension point (§5): network I/O the runtime multiplexes.
#[async_trait]
pub trait PeerClient: Send {
    /// Exchanges version/verack. Fails with [`SessionError::Handshake`] on
    /// protocol mismatch, refusal, or timeout.
    async fn handshake(&mut self) -> Result<HandshakeInfo, SessionError>;

    /// Sends `getaddr`; returns immediately without waiting for a reply.
    async fn getaddr(&mut self) -> Result<(), SessionError>;

    /// Drains buffered inbound frames matching `kinds`.
    async fn get_messages(&mut self, kinds: &[AddrKind]) -> Result<Vec<AddrFrame>, SessionError>;

    /// Sends a mempool request and collects the inventory reply (a list of
    /// opaque transaction identifiers; this core never persists them, §4.4).
    async fn mempool(&mut self) -> Result<Vec<Vec<u8>>, SessionError>;

    /// Idempotent; safe to call more than once or after a failed open.
    async fn close(&mut self);
}

/// Builds an open [`PeerClient`] for a target endpoint, optionally through a
/// SOCKS5 proxy (used for onion targets). This is the `open()` half of the
/// spec's `PeerClient` contract (§6): the rest of the session lives on the
/// returned client.
#[async_trait]
pub trait PeerClientFactory: Send + Sync {
    async fn connect(
        &self,
        target: &Endpoint,
        proxy: Option<&TorProxy>,
        timeout: Duration,
    ) -> Result<Box<dyn PeerClient>, SessionError>;
}

/// A thin connector stub illustrating where a real Bitcoin-family wire codec
/// plugs in. It opens a raw TCP (or SOCKS5-tunnelled) connection to prove the
/// address and timeout are wired correctly, then fails the handshake: this
/// core ships no wire codec (§1), so there is nothing further it can
/// legitimately do with the socket.
pub struct StubPeerClientFactory;

struct StubPeerClient;

#[async_trait]
impl PeerClient for StubPeerClient {
    async fn handshake(&mut self) -> Result<HandshakeInfo, SessionError> {
        Err(SessionError::Protocol(
            "no wire codec configured: plug in a Bitcoin-family protocol codec crate".to_string(),
        ))
    }

    async fn getaddr(&mut self) -> Result<(), SessionError> {
        Err(SessionError::Protocol("no wire codec configured".to_string()))
    }

    async fn get_messages(&mut self, _kinds: &[AddrKind]) -> Result<Vec<AddrFrame>, SessionError> {
        Ok(Vec::new())
    }

    async fn mempool(&mut self) -> Result<Vec<Vec<u8>>, SessionError> {
        Err(SessionError::Protocol("no wire codec configured".to_string()))
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl PeerClientFactory for StubPeerClientFactory {
    async fn connect(
        &self,
        target: &Endpoint,
        _proxy: Option<&TorProxy>,
        timeout: Duration,
    ) -> Result<Box<dyn PeerClient>, SessionError> {
        if target.address.is_onion() {
            // A real implementation dials the configured SOCKS5 proxy here.
            return Err(SessionError::Connect(
                "onion dialing requires a SOCKS5-capable codec, none configured".to_string(),
            ));
        }
        let addr = format!("{}:{}", target.address, target.port);
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Timeout(timeout))?
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        Ok(Box::new(StubPeerClient))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! A deterministic, scriptable [`PeerClient`]/[`PeerClientFactory`] pair
    //! used by the scenario tests in spec §8. Each target endpoint gets a
    //! [`ScriptedPeer`] describing how it behaves; connecting to an
    //! unscripted endpoint fails closed.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    /// The scripted behavior of one peer, keyed by the factory on the
    /// target's `dash_key()`.
    #[derive(Clone, Debug, Default)]
    pub struct ScriptedPeer {
        pub handshake: Option<HandshakeInfo>,
        /// Each call to `get_messages` pops the next batch, if any.
        pub addr_batches: VecDeque<Vec<GossipedAddr>>,
        pub mempool: Vec<Vec<u8>>,
        pub connect_fails: bool,
    }

    #[derive(Clone, Default)]
    pub struct FakePeerClientFactory {
        peers: Arc<Mutex<HashMap<String, ScriptedPeer>>>,
        /// Every endpoint ever connected to, in connect order — lets tests
        /// assert on dial counts (e.g. "exactly one getaddr per TTL window").
        pub dial_log: Arc<Mutex<Vec<String>>>,
    }

    impl FakePeerClientFactory {
        pub fn new() -> Self {
            FakePeerClientFactory::default()
        }

        pub async fn script(&self, target: &Endpoint, peer: ScriptedPeer) {
            self.peers.lock().await.insert(target.dash_key(), peer);
        }

        pub async fn dial_count(&self, target: &Endpoint) -> usize {
            self.dial_log
                .lock()
                .await
                .iter()
                .filter(|k| *k == &target.dash_key())
                .count()
        }
    }

    pub struct FakePeerClient {
        script: ScriptedPeer,
    }

    #[async_trait]
    impl PeerClient for FakePeerClient {
        async fn handshake(&mut self) -> Result<HandshakeInfo, SessionError> {
            self.script
                .handshake
                .clone()
                .ok_or_else(|| SessionError::Handshake("scripted failure".to_string()))
        }

        async fn getaddr(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn get_messages(&mut self, _kinds: &[AddrKind]) -> Result<Vec<AddrFrame>, SessionError> {
            match self.script.addr_batches.pop_front() {
                Some(addr_list) => Ok(vec![AddrFrame { count: addr_list.len(), addr_list }]),
                None => Ok(Vec::new()),
            }
        }

        async fn mempool(&mut self) -> Result<Vec<Vec<u8>>, SessionError> {
            Ok(self.script.mempool.clone())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl PeerClientFactory for FakePeerClientFactory {
        async fn connect(
            &self,
            target: &Endpoint,
            _proxy: Option<&TorProxy>,
            _timeout: Duration,
        ) -> Result<Box<dyn PeerClient>, SessionError> {
            self.dial_log.lock().await.push(target.dash_key());
            let peers = self.peers.lock().await;
            let script = peers
                .get(&target.dash_key())
                .cloned()
                .unwrap_or_default();
            if script.connect_fails {
                return Err(SessionError::Connect("scripted connect failure".to_string()));
            }
            Ok(Box::new(FakePeerClient { script }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::endpoint::Address;

    #[tokio::test]
    async fn fake_factory_returns_scripted_handshake() {
        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("1.2.3.4".parse().unwrap()), 8333, 9);
        factory
            .script(
                &target,
                ScriptedPeer {
                    handshake: Some(HandshakeInfo {
                        version: 70016,
                        user_agent: "a".to_string(),
                        services: 9,
                        height: 800_000,
                    }),
                    ..Default::default()
                },
            )
            .await;
        let mut client = factory.connect(&target, None, Duration::from_secs(5)).await.unwrap();
        let info = client.handshake().await.unwrap();
        assert_eq!(info.height, 800_000);
        assert_eq!(factory.dial_count(&target).await, 1);
    }

    #[tokio::test]
    async fn unscripted_target_fails_handshake_not_connect() {
        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("9.9.9.9".parse().unwrap()), 8333, 1);
        let mut client = factory.connect(&target, None, Duration::from_secs(5)).await.unwrap();
        assert!(client.handshake().await.is_err());
    }

    #[tokio::test]
    async fn scripted_connect_failure_is_reported() {
        let factory = FakePeerClientFactory::new();
        let target = Endpoint::new(Address::V4("9.9.9.9".parse().unwrap()), 8333, 1);
        factory
            .script(&target, ScriptedPeer { connect_fails: true, ..Default::default() })
            .await;
        assert!(factory.connect(&target, None, Duration::from_secs(5)).await.is_err());
    }
}
