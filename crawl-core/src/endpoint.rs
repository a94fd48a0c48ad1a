//! The `(address, port, services)` identity triple used across every queue and key.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// The store-value encoding version. Bumping this changes the prefix so that
/// old, differently-shaped values left over in the coordination store are
/// rejected instead of silently misparsed.
const ENCODING_VERSION: &str = "v1";

/// A peer address: IPv4, IPv6, or a Tor onion hostname.
///
/// Onion addresses are kept as their textual hostname; Bitcoin-family peers
/// never hand us a raw onion address in binary form over the wire, so there's
/// no canonical byte representation to parse into.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Onion(String),
}

impl Address {
    pub fn is_onion(&self) -> bool {
        matches!(self, Address::Onion(_))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::V6(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{a}"),
            Address::V6(a) => write!(f, "{a}"),
            Address::Onion(host) => write!(f, "{host}"),
        }
    }
}

impl FromStr for Address {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.ends_with(".onion") {
            return Ok(Address::Onion(s.to_string()));
        }
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(Address::V4(v4));
        }
        if let Ok(v6) = s.parse::<Ipv6Addr>() {
            return Ok(Address::V6(v6));
        }
        Err(DecodeError::BadAddress(s.to_string()))
    }
}

/// The canonical endpoint identity: `(address, port, services)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Address,
    pub port: u16,
    pub services: u64,
}

impl Endpoint {
    pub fn new(address: Address, port: u16, services: u64) -> Self {
        Endpoint {
            address,
            port,
            services,
        }
    }

    /// The `<address>-<port>-<services>` form used by `node:`, `height:` and
    /// `version:` keys (see the CoordStore key namespace).
    pub fn dash_key(&self) -> String {
        format!("{}-{}-{}", self.address, self.port, self.services)
    }

    /// Encodes this endpoint as a versioned, fixed-shape store value.
    ///
    /// This is the explicit replacement for the source system's practice of
    /// storing a set's `repr()` and decoding it with unrestricted evaluation:
    /// a 3-element JSON array behind a version prefix, so a decoder can
    /// reject anything that isn't exactly this shape.
    pub fn encode(&self) -> String {
        let tuple = (self.address.to_string(), self.port, self.services);
        let json = serde_json::to_string(&tuple).expect("tuple of primitives always serializes");
        format!("{ENCODING_VERSION}:{json}")
    }

    /// Decodes a value produced by [`Endpoint::encode`]. Rejects anything
    /// that isn't a well-formed, correctly-versioned 3-tuple rather than
    /// attempting to recover a partial result.
    pub fn decode(raw: &str) -> Result<Endpoint, DecodeError> {
        let rest = raw
            .strip_prefix(&format!("{ENCODING_VERSION}:"))
            .ok_or_else(|| DecodeError::BadEnvelope(raw.to_string()))?;
        let (address, port, services): (String, u16, u64) =
            serde_json::from_str(rest).map_err(|_| DecodeError::BadEnvelope(raw.to_string()))?;
        let address = address.parse()?;
        Ok(Endpoint {
            address,
            port,
            services,
        })
    }

    /// Returns a copy of this endpoint with its `services` field rewritten,
    /// used when a handshake reports a different services bitmask than the
    /// candidate carried (the "ghost" rewrite in the Worker Pool discover
    /// session).
    pub fn with_services(&self, services: u64) -> Endpoint {
        Endpoint {
            address: self.address.clone(),
            port: self.port,
            services,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dash_key())
    }
}
