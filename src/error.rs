//! Error taxonomy for the client core.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, RedisCoreError>`. The variants mirror the kinds
//! enumerated in the error-handling design: some are locally recovered by a
//! caller in this crate (`MOVED`/`ASK` retried once by the cluster router),
//! most simply propagate to the application.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RedisCoreError>;

/// The full error taxonomy surfaced by this crate.
#[derive(Error, Debug)]
pub enum RedisCoreError {
    /// The server returned a RESP `Error` frame (`-ERR ...`, `-MOVED ...`, `-ASK ...`, etc).
    #[error("{kind}")]
    Reply {
        /// Full textual error as returned by the server, including the leading code word.
        kind: ReplyErrorKind,
    },

    /// The decoder observed bytes that do not form valid RESP.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport failed to send or receive, or the peer closed the stream mid-frame.
    #[error("communication error with {peer:?}: {source}")]
    Communication {
        peer: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    /// A pool's capacity was exhausted and `wait_timeout` elapsed before a permit freed up.
    #[error("pool exhausted (max_connections reached, wait_timeout elapsed)")]
    PoolExhausted,

    /// At least one reply within a pipeline was an error; every positional result is kept.
    #[error("{} of {} pipelined commands failed", .results.iter().filter(|r| r.is_err()).count(), .results.len())]
    PipelinedErrors { results: Vec<Result<crate::resp::Value>> },

    /// An argument could not be encoded to bytes under the configured text encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Sentinel discovery could not find a usable sentinel endpoint.
    #[error("no sentinel endpoint answered for group {group:?}")]
    NoSentinelFound { group: String },

    /// Sentinel discovery found no replica endpoints for the group.
    #[error("no replica endpoint is known for group {group:?}")]
    NoReplicaFound { group: String },

    /// A requested named/explicit endpoint does not exist in the current topology.
    #[error("no such endpoint: {0}")]
    NoEndpointFound(String),

    /// A per-call receive timeout elapsed on a non-push read.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The RESP3 handshake was forced to version 3 but the server does not support it.
    #[error("server does not support RESP3 and resp_version=3 was forced")]
    Resp3Required,

    /// A cluster slot map covers fewer than all 16384 slots, or slots overlap.
    #[error("CLUSTER SLOTS reply has gaps or overlaps in slot coverage")]
    IncompleteSlotMap,
}

impl RedisCoreError {
    pub fn communication(peer: Option<SocketAddr>, source: std::io::Error) -> Self {
        RedisCoreError::Communication { peer, source }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RedisCoreError::Protocol(msg.into())
    }

    pub fn reply(text: impl Into<String>) -> Self {
        RedisCoreError::Reply { kind: ReplyErrorKind::parse(text.into()) }
    }

    /// True for the kinds the cluster router is allowed to retry automatically.
    pub fn as_redirect(&self) -> Option<Redirect> {
        match self {
            RedisCoreError::Reply { kind } => kind.as_redirect(),
            _ => None,
        }
    }
}

/// A parsed `MOVED`/`ASK` redirect extracted from a reply error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Moved { slot: u16, addr: String },
    Ask { slot: u16, addr: String },
}

/// The server's reply error, split into its leading code word and the rest of the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyErrorKind {
    pub code: String,
    pub text: String,
}

impl ReplyErrorKind {
    fn parse(text: String) -> Self {
        let code = text.split_whitespace().next().unwrap_or("").to_string();
        ReplyErrorKind { code, text }
    }

    fn as_redirect(&self) -> Option<Redirect> {
        let mut parts = self.text.split_whitespace();
        match parts.next()? {
            "MOVED" => {
                let slot: u16 = parts.next()?.parse().ok()?;
                let addr = parts.next()?.to_string();
                Some(Redirect::Moved { slot, addr })
            }
            "ASK" => {
                let slot: u16 = parts.next()?.parse().ok()?;
                let addr = parts.next()?.to_string();
                Some(Redirect::Ask { slot, addr })
            }
            _ => None,
        }
    }
}

impl fmt::Display for ReplyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<std::io::Error> for RedisCoreError {
    fn from(source: std::io::Error) -> Self {
        RedisCoreError::Communication { peer: None, source }
    }
}
