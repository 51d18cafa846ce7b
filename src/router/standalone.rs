//! Standalone-mode router: one pool, no topology discovery (§4.5.1).

use std::net::SocketAddr;

use crate::command::{CallOptions, Command};
use crate::connection::{ConnectOptions, Connection};
use crate::error::Result;
use crate::pool::{Pool, PoolConfig, TcpConnectionFactory};
use crate::resp::Value;
use crate::router::EndpointRole;
use crate::transport::TcpOptions;

pub struct StandaloneRouter {
    addr: SocketAddr,
    pool: Pool,
}

impl StandaloneRouter {
    pub fn new(addr: SocketAddr, connect_options: ConnectOptions, tcp_options: TcpOptions, pool_config: PoolConfig) -> Self {
        let pool = Pool::new(TcpConnectionFactory { addr, tcp_options, connect_options }, pool_config);
        StandaloneRouter { addr, pool }
    }

    pub async fn call(&self, cmd: &Command, options: &CallOptions) -> Result<Value> {
        let mut conn = self.pool.take().await?;
        let result = conn.call(cmd, options).await;
        self.pool.release(conn).await;
        result
    }

    pub async fn call_pipeline(&self, cmds: &[Command], options: &CallOptions) -> Result<Vec<Value>> {
        let mut conn = self.pool.take().await?;
        let result = conn.call_pipeline(cmds, options).await;
        self.pool.release(conn).await;
        result
    }

    /// Checks out a connection the caller must return via the paired
    /// `Pool::release` once their scope (e.g. a `MULTI`/`EXEC` block) ends.
    pub async fn connection(&self) -> Result<(Pool, Connection)> {
        let conn = self.pool.take().await?;
        Ok((self.pool.clone(), conn))
    }

    pub fn endpoints(&self) -> Vec<(String, EndpointRole)> {
        vec![(self.addr.to_string(), EndpointRole::Regular)]
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
