//! Sentinel-mode router: leader/replica/sentinel discovery and
//! reconciliation through a named monitoring group (§4.5.3).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::command::{CallOptions, Command, EndpointSelector};
use crate::connection::{ConnectOptions, Connection};
use crate::error::{RedisCoreError, Result};
use crate::pool::{Pool, PoolConfig, TcpConnectionFactory};
use crate::resp::{Value, ValueData};
use crate::router::EndpointRole;
use crate::transport::TcpOptions;
use tracing::debug;

struct SentinelState {
    sentinels: HashMap<String, Pool>,
    replicas: HashMap<String, Pool>,
    leader: Option<(String, Pool)>,
}

pub struct SentinelRouter {
    group: String,
    connect_options: ConnectOptions,
    sentinel_connect_options: ConnectOptions,
    tcp_options: TcpOptions,
    pool_config: PoolConfig,
    state: Arc<RwLock<SentinelState>>,
    refresh_needed: Arc<AtomicBool>,
}

fn make_pool(addr: SocketAddr, connect_options: &ConnectOptions, tcp_options: TcpOptions, pool_config: PoolConfig) -> Pool {
    Pool::new(TcpConnectionFactory { addr, tcp_options, connect_options: connect_options.clone() }, pool_config)
}

impl SentinelRouter {
    /// Seeds a pool per sentinel address and runs an initial discovery pass.
    pub async fn new(
        group: String,
        seed_sentinels: Vec<SocketAddr>,
        connect_options: ConnectOptions,
        sentinel_password: Option<String>,
        tcp_options: TcpOptions,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        let sentinel_connect_options = ConnectOptions { password: sentinel_password, username: None, ..connect_options.clone() };
        let mut sentinels = HashMap::new();
        for addr in &seed_sentinels {
            sentinels.insert(addr.to_string(), make_pool(*addr, &sentinel_connect_options, tcp_options, pool_config));
        }
        let router = SentinelRouter {
            group,
            connect_options,
            sentinel_connect_options,
            tcp_options,
            pool_config,
            state: Arc::new(RwLock::new(SentinelState { sentinels, replicas: HashMap::new(), leader: None })),
            refresh_needed: Arc::new(AtomicBool::new(false)),
        };
        router.refresh().await?;
        Ok(router)
    }

    fn mark_refresh_needed(&self) {
        self.refresh_needed.store(true, Ordering::Release);
    }

    async fn refresh_if_needed(&self) -> Result<()> {
        if self.refresh_needed.swap(false, Ordering::AcqRel) {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Tries each known sentinel in turn until one answers all three
    /// discovery commands; a transport error moves on to the next
    /// candidate, an empty/missing master reply is treated the same way
    /// (§4.5.3 Discovery).
    pub async fn refresh(&self) -> Result<()> {
        let candidates: Vec<(String, Pool)> = {
            let state = self.state.read().await;
            state.sentinels.iter().map(|(a, p)| (a.clone(), p.clone())).collect()
        };

        for (addr, pool) in &candidates {
            match self.discover_via(pool).await {
                Ok((leader_addr, sentinel_addrs, replica_addrs)) => {
                    debug!(group = %self.group, via = %addr, leader = %leader_addr, "sentinel discovery succeeded");
                    self.reconcile(addr, leader_addr, sentinel_addrs, replica_addrs).await;
                    return Ok(());
                }
                Err(RedisCoreError::Communication { .. }) => continue,
                Err(RedisCoreError::Reply { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(RedisCoreError::NoSentinelFound { group: self.group.clone() })
    }

    async fn discover_via(&self, pool: &Pool) -> Result<(String, Vec<String>, Vec<String>)> {
        let mut conn = pool.take().await?;

        let master = conn.call(&Command::new("SENTINEL").arg("MASTER").arg(self.group.clone()), &CallOptions::default()).await;
        let sentinels = conn.call(&Command::new("SENTINEL").arg("SENTINELS").arg(self.group.clone()), &CallOptions::default()).await;
        let replicas = conn.call(&Command::new("SENTINEL").arg("REPLICAS").arg(self.group.clone()), &CallOptions::default()).await;
        pool.release(conn).await;

        let leader_addr = parse_master_reply(&master?)?;
        let sentinel_addrs = parse_node_list(&sentinels?);
        let replica_addrs = parse_node_list(&replicas?);
        Ok((leader_addr, sentinel_addrs, replica_addrs))
    }

    /// Swaps in the freshly discovered endpoint sets, opening pools for new
    /// addresses and closing pools for addresses no longer reported. The
    /// sentinel that answered may not list itself; it is always kept
    /// (§4.5.3 Reconciliation).
    async fn reconcile(&self, answering_sentinel: &str, leader_addr: String, mut sentinel_addrs: Vec<String>, replica_addrs: Vec<String>) {
        if !sentinel_addrs.contains(&answering_sentinel.to_string()) {
            sentinel_addrs.push(answering_sentinel.to_string());
        }

        let mut state = self.state.write().await;

        let (new_sentinels, removed_sentinel_pools) = diff_pool_set(&state.sentinels, &sentinel_addrs, &self.sentinel_connect_options, self.tcp_options, self.pool_config);
        let (new_replicas, removed_replica_pools) = diff_pool_set(&state.replicas, &replica_addrs, &self.connect_options, self.tcp_options, self.pool_config);

        let new_leader = match &state.leader {
            Some((addr, pool)) if *addr == leader_addr => Some((addr.clone(), pool.clone())),
            _ => Some((leader_addr.clone(), make_pool(leader_addr.parse().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap()), &self.connect_options, self.tcp_options, self.pool_config))),
        };
        let removed_leader = match (&state.leader, &new_leader) {
            (Some((old_addr, old_pool)), Some((new_addr, _))) if old_addr != new_addr => Some(old_pool.clone()),
            _ => None,
        };

        state.sentinels = new_sentinels;
        state.replicas = new_replicas;
        state.leader = new_leader;
        drop(state);

        for pool in removed_sentinel_pools.into_iter().chain(removed_replica_pools).chain(removed_leader) {
            pool.close().await;
        }
    }

    pub async fn take(&self, selector: &EndpointSelector) -> Result<(Pool, Connection)> {
        self.refresh_if_needed().await?;
        let pool = self.pool_for_selector(selector).await?;
        let result = pool.take().await;
        if matches!(result, Err(RedisCoreError::Communication { .. })) {
            self.mark_refresh_needed();
        }
        Ok((pool.clone(), result?))
    }

    async fn pool_for_selector(&self, selector: &EndpointSelector) -> Result<Pool> {
        let state = self.state.read().await;
        match selector {
            EndpointSelector::Auto | EndpointSelector::Leader => {
                state.leader.as_ref().map(|(_, p)| p.clone()).ok_or_else(|| RedisCoreError::NoEndpointFound("no leader known".into()))
            }
            EndpointSelector::Replica => {
                let mut rng = rand::thread_rng();
                state
                    .replicas
                    .values()
                    .collect::<Vec<_>>()
                    .choose(&mut rng)
                    .map(|p| (*p).clone())
                    .ok_or_else(|| RedisCoreError::NoReplicaFound { group: self.group.clone() })
            }
            EndpointSelector::Sentinel => {
                let mut rng = rand::thread_rng();
                state
                    .sentinels
                    .values()
                    .collect::<Vec<_>>()
                    .choose(&mut rng)
                    .map(|p| (*p).clone())
                    .ok_or_else(|| RedisCoreError::NoSentinelFound { group: self.group.clone() })
            }
            EndpointSelector::Address(addr) => state
                .leader
                .iter()
                .filter(|(a, _)| a == addr)
                .map(|(_, p)| p.clone())
                .next()
                .or_else(|| state.replicas.get(addr).cloned())
                .or_else(|| state.sentinels.get(addr).cloned())
                .ok_or_else(|| RedisCoreError::NoEndpointFound(addr.clone())),
            EndpointSelector::Masters => Err(RedisCoreError::protocol("endpoint=masters is cluster-only")),
        }
    }

    pub async fn call(&self, cmd: &Command, options: &CallOptions) -> Result<Value> {
        self.refresh_if_needed().await?;
        let pool = self.pool_for_selector(&options.endpoint).await?;
        let mut conn = pool.take().await?;
        let result = conn.call(cmd, options).await;
        if matches!(result, Err(RedisCoreError::Communication { .. })) {
            self.mark_refresh_needed();
        }
        pool.release(conn).await;
        result
    }

    pub async fn call_pipeline(&self, cmds: &[Command], options: &CallOptions) -> Result<Vec<Value>> {
        self.refresh_if_needed().await?;
        let pool = self.pool_for_selector(&options.endpoint).await?;
        let mut conn = pool.take().await?;
        let result = conn.call_pipeline(cmds, options).await;
        if matches!(result, Err(RedisCoreError::Communication { .. })) {
            self.mark_refresh_needed();
        }
        pool.release(conn).await;
        result
    }

    pub async fn endpoints(&self) -> Vec<(String, EndpointRole)> {
        let state = self.state.read().await;
        let mut out: Vec<(String, EndpointRole)> = Vec::new();
        if let Some((addr, _)) = &state.leader {
            out.push((addr.clone(), EndpointRole::Master));
        }
        out.extend(state.replicas.keys().map(|a| (a.clone(), EndpointRole::Replica)));
        out.extend(state.sentinels.keys().map(|a| (a.clone(), EndpointRole::Sentinel)));
        out
    }

    pub async fn close(&self) {
        let mut state = self.state.write().await;
        let sentinels: Vec<Pool> = state.sentinels.drain().map(|(_, p)| p).collect();
        let replicas: Vec<Pool> = state.replicas.drain().map(|(_, p)| p).collect();
        let leader = state.leader.take().map(|(_, p)| p);
        drop(state);
        for pool in sentinels.into_iter().chain(replicas).chain(leader) {
            pool.close().await;
        }
    }
}

/// Diffs an existing address→pool map against a freshly discovered address
/// list: keeps pools for addresses still present, opens pools for new
/// addresses, and returns the pools for addresses no longer reported so the
/// caller can close them after releasing its lock.
fn diff_pool_set(
    existing: &HashMap<String, Pool>,
    wanted: &[String],
    connect_options: &ConnectOptions,
    tcp_options: TcpOptions,
    pool_config: PoolConfig,
) -> (HashMap<String, Pool>, Vec<Pool>) {
    let mut new_map = HashMap::new();
    for addr in wanted {
        let pool = existing.get(addr).cloned().unwrap_or_else(|| {
            let sock_addr: SocketAddr = addr.parse().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
            make_pool(sock_addr, connect_options, tcp_options, pool_config)
        });
        new_map.insert(addr.clone(), pool);
    }
    let removed = existing.iter().filter(|(a, _)| !wanted.contains(a)).map(|(_, p)| p.clone()).collect();
    (new_map, removed)
}

/// Parses a `SENTINEL MASTER <group>` reply (a flat key/value array) into
/// `ip:port`. An empty reply means the group is unknown to this sentinel.
fn parse_master_reply(reply: &Value) -> Result<String> {
    let kv = flat_kv(reply).ok_or_else(|| RedisCoreError::protocol("SENTINEL MASTER reply is not a flat array"))?;
    if kv.is_empty() {
        return Err(RedisCoreError::protocol("SENTINEL MASTER returned an empty reply"));
    }
    let ip = kv.get("ip").ok_or_else(|| RedisCoreError::protocol("SENTINEL MASTER reply missing ip"))?;
    let port = kv.get("port").ok_or_else(|| RedisCoreError::protocol("SENTINEL MASTER reply missing port"))?;
    Ok(format!("{ip}:{port}"))
}

/// Parses a `SENTINEL SENTINELS`/`SENTINEL REPLICAS` reply (an array of
/// flat key/value arrays) into a list of `ip:port` addresses.
fn parse_node_list(reply: &Value) -> Vec<String> {
    let ValueData::Array(Some(items)) = &reply.data else { return Vec::new() };
    items
        .iter()
        .filter_map(|item| {
            let kv = flat_kv(item)?;
            let ip = kv.get("ip")?;
            let port = kv.get("port")?;
            Some(format!("{ip}:{port}"))
        })
        .collect()
}

fn flat_kv(v: &Value) -> Option<HashMap<String, String>> {
    let ValueData::Array(Some(fields)) = &v.data else { return None };
    let mut map = HashMap::new();
    let mut iter = fields.iter();
    while let (Some(k), Some(val)) = (iter.next(), iter.next()) {
        if let (Some(k), Some(val)) = (value_to_text(k), value_to_text(val)) {
            map.insert(k, val);
        }
    }
    Some(map)
}

fn value_to_text(v: &Value) -> Option<String> {
    match &v.data {
        ValueData::BulkString(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
        ValueData::SimpleString(s) => Some(s.clone()),
        ValueData::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}
