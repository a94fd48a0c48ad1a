//! The three error kinds from the error-handling design: session, coordination,
//! and configuration/startup, plus the decode errors introduced by the explicit
//! endpoint encoding (§3/§9 of the spec).

use thiserror::Error;

/// A malformed or unparsable endpoint/value read back from the coordination
/// store. Never produced by a successful `encode()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("value is not a recognized versioned envelope: {0}")]
    BadEnvelope(String),

    #[error("address does not parse as ipv4, ipv6, or onion: {0}")]
    BadAddress(String),
}

/// Failures from a `PeerClient` session: connect, handshake, getaddr, or
/// mempool. These are always caught at the session boundary, logged at
/// debug, and cause the session to be abandoned without retry.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to peer failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failures talking to the coordination store. Reads degrade to "missing"
/// (conservative); writes are logged and the loop continues.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),

    #[error("failed to decode a value read from the coordination store: {0}")]
    Decode(#[from] DecodeError),
}

/// Fatal configuration or startup errors. The process aborts with a nonzero
/// exit code on these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required key `{0}` in [crawl] section")]
    MissingKey(String),

    #[error("key `{0}` has an invalid value: {1}")]
    InvalidValue(String, String),

    #[error("could not read config file {0}: {1}")]
    Unreadable(String, String),

    #[error("second CLI argument must be `master` or `slave`, got `{0}`")]
    BadRole(String),
}

/// The umbrella error type returned by the public core API. Call sites that
/// need to distinguish the three kinds can match on the variant; call sites
/// that just need to log-and-continue can use `Display`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to write snapshot {0}: {1}")]
    Snapshot(String, std::io::Error),
}
