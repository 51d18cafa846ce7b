//! Core RESP2/RESP3 codec, connection state machine, per-endpoint pool, and
//! topology router (standalone, cluster, sentinel) for a Redis client.
//!
//! This crate is the engine room, not the convenience wrapper: there is no
//! default-configured `Client`, no URL parsing, and no command-specific
//! helpers. An embedder builds a [`command::CallOptions`]/[`router::Router`]
//! around it and layers its own ergonomics on top.
//!
//! # Layout
//!
//! - [`resp`]: the wire codec — [`resp::Decoder`] (incremental, stack-based)
//!   and [`resp::Encoder`].
//! - [`transport`]: byte-stream transport (TCP, Unix, or a wrapped stream).
//! - [`connection`]: one live session — handshake, calls, pipelines, push
//!   reads, `MULTI` discipline.
//! - [`pool`]: a bounded pool of connections to one endpoint.
//! - [`hashing`]: Redis Cluster hash-slot computation.
//! - [`router`]: the three topology strategies behind one façade.
//! - [`command`]: the argument list and per-call override types shared by
//!   the layers above.
//! - [`error`]: the full error taxonomy.

pub mod command;
pub mod connection;
pub mod error;
pub mod hashing;
pub mod pool;
pub mod resp;
pub mod router;
pub mod transport;

pub use command::{CallOptions, Command, EndpointSelector, Invocation, ReplyDecoding};
pub use connection::{ConnState, ConnectOptions, Connection, RespVersion};
pub use error::{RedisCoreError, Result};
pub use pool::{Pool, PoolConfig};
pub use router::{EndpointRole, Router};

/// Default TCP port for a standalone Redis endpoint.
pub const DEFAULT_PORT: u16 = 6379;
