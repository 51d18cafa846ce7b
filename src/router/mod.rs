//! Topology-mode façade over the three router variants: `call`,
//! `connection`, `endpoints`, `close` (§4.5).

pub mod cluster;
pub mod sentinel;
pub mod standalone;

use crate::command::{CallOptions, Command};
use crate::connection::Connection;
use crate::error::Result;
use crate::pool::Pool;
use crate::resp::Value;

/// The role an endpoint plays within its topology, as reported by
/// `endpoints()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Regular,
    Master,
    Replica,
    Sentinel,
}

/// One of the three connection-topology strategies behind a single façade.
/// Picking the variant is a connect-time decision (`pool_factory` in the
/// connect settings); callers that only ever talk to one topology can also
/// use the concrete `StandaloneRouter`/`ClusterRouter`/`SentinelRouter`
/// directly.
pub enum Router {
    Standalone(standalone::StandaloneRouter),
    Cluster(cluster::ClusterRouter),
    Sentinel(sentinel::SentinelRouter),
}

impl Router {
    pub async fn call(&self, cmd: &Command, options: &CallOptions) -> Result<Value> {
        match self {
            Router::Standalone(r) => r.call(cmd, options).await,
            Router::Cluster(r) => r.call(cmd, options).await,
            Router::Sentinel(r) => r.call(cmd, options).await,
        }
    }

    pub async fn call_pipeline(&self, cmds: &[Command], options: &CallOptions) -> Result<Vec<Value>> {
        match self {
            Router::Standalone(r) => r.call_pipeline(cmds, options).await,
            Router::Cluster(r) => r.call_pipeline(cmds, options).await,
            Router::Sentinel(r) => r.call_pipeline(cmds, options).await,
        }
    }

    /// Checks out a scoped connection plus the pool it must be returned to.
    /// `key` steers cluster routing (ignored by the other two topologies);
    /// `options.endpoint` steers sentinel routing.
    pub async fn connection(&self, key: Option<&[u8]>, options: &CallOptions) -> Result<(Pool, Connection)> {
        match self {
            Router::Standalone(r) => r.connection().await,
            Router::Cluster(r) => r.connection(key, options).await,
            Router::Sentinel(r) => r.take(&options.endpoint).await,
        }
    }

    pub async fn endpoints(&self) -> Vec<(String, EndpointRole)> {
        match self {
            Router::Standalone(r) => r.endpoints(),
            Router::Cluster(r) => r.endpoints().await,
            Router::Sentinel(r) => r.endpoints().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Router::Standalone(r) => r.close().await,
            Router::Cluster(r) => r.close().await,
            Router::Sentinel(r) => r.close().await,
        }
    }
}
