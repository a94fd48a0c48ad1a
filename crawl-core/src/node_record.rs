//! Per-pass handshake metadata and the cached `getaddr` replies it feeds.
//!
//! Grounded on `zebra-network`'s `MetaAddr` (the teacher's address-with-metadata
//! type): we keep the same "created on success, carries handshake-reported
//! fields, has a narrow well-defined lifetime" shape, but narrow it to exactly
//! the fields the crawl coordinator needs instead of the full peer-liveness
//! state machine `MetaAddr` implements (that machinery belongs to the
//! out-of-scope wire codec / connection pool, not this coordinator).

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::DecodeError;

/// The `version:*` value encoding version, same scheme as [`Endpoint::encode`].
const ENCODING_VERSION: &str = "v1";

/// The handshake-reported facts about a peer, recorded once a worker
/// completes a successful handshake within the current pass.
///
/// Created by the Worker Pool on handshake success; mutated only by the
/// worker that created it; destroyed at the next pass boundary by the Pass
/// Controller (by deleting the `height:*`/`version:*` keys, which this
/// record's fields mirror in the coordination store).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub protocol_version: u32,
    pub user_agent: String,
    pub advertised_services: u64,
}

impl NodeRecord {
    pub fn new(protocol_version: u32, user_agent: impl Into<String>, advertised_services: u64) -> Self {
        NodeRecord {
            protocol_version,
            user_agent: user_agent.into(),
            advertised_services,
        }
    }

    /// Encodes this record as the `version:*` store value: a versioned,
    /// fixed-shape 3-tuple, the same envelope convention as
    /// [`Endpoint::encode`] rather than a free-form `repr()`.
    pub fn encode(&self) -> String {
        let tuple = (self.protocol_version, &self.user_agent, self.advertised_services);
        let json = serde_json::to_string(&tuple).expect("tuple of primitives always serializes");
        format!("{ENCODING_VERSION}:{json}")
    }

    /// Decodes a value produced by [`NodeRecord::encode`].
    pub fn decode(raw: &str) -> Result<NodeRecord, DecodeError> {
        let rest = raw
            .strip_prefix(&format!("{ENCODING_VERSION}:"))
            .ok_or_else(|| DecodeError::BadEnvelope(raw.to_string()))?;
        let (protocol_version, user_agent, advertised_services): (u32, String, u64) =
            serde_json::from_str(rest).map_err(|_| DecodeError::BadEnvelope(raw.to_string()))?;
        Ok(NodeRecord {
            protocol_version,
            user_agent,
            advertised_services,
        })
    }
}

/// The cached, post-processed output of one `getaddr` session against an
/// endpoint: a bounded, deduplicated set of peer triples.
///
/// Created on first successful fetch; expires from the coordination store by
/// TTL (see [`crate::peer_cache::PeerCache`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringSample {
    pub peers: Vec<Endpoint>,
}

impl PeeringSample {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_record_round_trips() {
        let record = NodeRecord::new(70016, "/crawler:0.1/", 13);
        let encoded = record.encode();
        assert!(encoded.starts_with("v1:"));
        assert_eq!(NodeRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn node_record_rejects_missing_version_prefix() {
        assert!(NodeRecord::decode("[70016,\"/crawler:0.1/\",13]").is_err());
    }

    #[test]
    fn node_record_rejects_truncated_tuple() {
        assert!(NodeRecord::decode("v1:[70016,\"/crawler:0.1/\"]").is_err());
    }
}
