//! Cluster-mode router: slot map, command-info cache, per-node pools, and
//! `MOVED`/`ASK` redirect handling (§4.5.2).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::command::{CallOptions, Command, EndpointSelector};
use crate::connection::{ConnectOptions, Connection};
use crate::error::{Redirect, RedisCoreError, Result};
use crate::hashing::{key_slot, SLOT_COUNT};
use crate::pool::{Pool, PoolConfig, TcpConnectionFactory};
use crate::resp::{Argument, Value, ValueData};
use crate::router::EndpointRole;
use crate::transport::TcpOptions;
use tracing::{debug, trace};

/// One contiguous slot range and the nodes that serve it.
#[derive(Debug, Clone)]
pub struct SlotMapEntry {
    pub start: u16,
    pub end: u16,
    pub master: String,
    pub replicas: Vec<String>,
}

/// An immutable snapshot of `CLUSTER SLOTS`, published as a fresh `Arc` on
/// every successful refresh (§9 "Slot map as immutable snapshot").
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    entries: Vec<SlotMapEntry>,
}

impl SlotMap {
    /// Parses a `CLUSTER SLOTS` reply. Rejects any map with coverage gaps or
    /// overlaps outright rather than returning a partial map (resolves Open
    /// Question c, §9).
    pub fn parse(reply: &Value) -> Result<SlotMap> {
        let ValueData::Array(Some(items)) = &reply.data else {
            return Err(RedisCoreError::protocol("CLUSTER SLOTS did not return an array"));
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let ValueData::Array(Some(fields)) = &item.data else {
                return Err(RedisCoreError::protocol("CLUSTER SLOTS entry is not an array"));
            };
            if fields.len() < 3 {
                return Err(RedisCoreError::protocol("CLUSTER SLOTS entry is too short"));
            }
            let start = slot_field(&fields[0])?;
            let end = slot_field(&fields[1])?;
            let master = node_address(&fields[2])?;
            let replicas = fields[3..].iter().filter_map(node_address_opt).collect();
            entries.push(SlotMapEntry { start, end, master, replicas });
        }
        entries.sort_by_key(|e| e.start);
        verify_full_coverage(&entries)?;
        Ok(SlotMap { entries })
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<&str> {
        self.entries.iter().find(|e| slot >= e.start && slot <= e.end).map(|e| e.master.as_str())
    }

    pub fn masters(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for e in &self.entries {
            if !seen.contains(&e.master) {
                seen.push(e.master.clone());
            }
        }
        seen
    }

    pub fn entries(&self) -> &[SlotMapEntry] {
        &self.entries
    }
}

fn verify_full_coverage(entries: &[SlotMapEntry]) -> Result<()> {
    let mut next_expected: u32 = 0;
    for e in entries {
        if e.start as u32 != next_expected {
            return Err(RedisCoreError::IncompleteSlotMap);
        }
        next_expected = e.end as u32 + 1;
    }
    if next_expected != SLOT_COUNT as u32 {
        return Err(RedisCoreError::IncompleteSlotMap);
    }
    Ok(())
}

fn slot_field(v: &Value) -> Result<u16> {
    match v.data {
        ValueData::Integer(i) if (0..SLOT_COUNT as i64).contains(&i) => Ok(i as u16),
        _ => Err(RedisCoreError::protocol("expected a slot integer")),
    }
}

fn node_address(v: &Value) -> Result<String> {
    node_address_opt(v).ok_or_else(|| RedisCoreError::protocol("malformed node descriptor"))
}

fn node_address_opt(v: &Value) -> Option<String> {
    let ValueData::Array(Some(fields)) = &v.data else { return None };
    let ValueData::BulkString(Some(ip)) = &fields.first()?.data else { return None };
    let ValueData::Integer(port) = fields.get(1)?.data else { return None };
    Some(format!("{}:{}", String::from_utf8_lossy(ip), port))
}

#[derive(Debug, Clone, Copy, Default)]
struct CommandInfo {
    first_key_index: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clustered {
    Unknown,
    No,
    Yes,
}

struct ClusterState {
    slot_map: Option<Arc<SlotMap>>,
    command_info: HashMap<String, CommandInfo>,
    pools: HashMap<String, Pool>,
    hint: Option<String>,
    clustered: Clustered,
}

pub struct ClusterRouter {
    state: Arc<RwLock<ClusterState>>,
    connect_options: ConnectOptions,
    tcp_options: TcpOptions,
    pool_config: PoolConfig,
}

fn make_pool(addr: SocketAddr, connect_options: &ConnectOptions, tcp_options: TcpOptions, pool_config: PoolConfig) -> Pool {
    Pool::new(TcpConnectionFactory { addr, tcp_options, connect_options: connect_options.clone() }, pool_config)
}

impl ClusterRouter {
    /// Builds pools for the seed addresses and runs an initial slot refresh.
    /// Seed addresses are only a bootstrap — once `CLUSTER SLOTS` succeeds,
    /// routing uses the discovered node addresses instead (§4.5.2).
    pub async fn new(
        seed_addrs: Vec<SocketAddr>,
        connect_options: ConnectOptions,
        tcp_options: TcpOptions,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        let mut pools = HashMap::new();
        for addr in &seed_addrs {
            pools.insert(addr.to_string(), make_pool(*addr, &connect_options, tcp_options, pool_config));
        }
        let router = ClusterRouter {
            state: Arc::new(RwLock::new(ClusterState {
                slot_map: None,
                command_info: HashMap::new(),
                pools,
                hint: None,
                clustered: Clustered::Unknown,
            })),
            connect_options,
            tcp_options,
            pool_config,
        };
        router.refresh_slots().await?;
        Ok(router)
    }

    async fn any_pool(&self) -> Result<Pool> {
        let state = self.state.read().await;
        if let Some(hint) = &state.hint {
            if let Some(p) = state.pools.get(hint) {
                return Ok(p.clone());
            }
        }
        state.pools.values().next().cloned().ok_or_else(|| RedisCoreError::NoEndpointFound("no cluster nodes known".into()))
    }

    /// Issues `CLUSTER SLOTS`, reconciles the pool map against the result,
    /// and publishes a fresh immutable slot map. A reply-level error marks
    /// the deployment non-clustered; a transport error invalidates the
    /// "last used" hint and propagates (§4.5.2 Slot refresh).
    pub async fn refresh_slots(&self) -> Result<()> {
        let pool = self.any_pool().await?;
        let mut conn = pool.take().await?;
        let reply = conn.call(&Command::new("CLUSTER").arg("SLOTS"), &CallOptions::default()).await;
        let peer = conn.peer_addr();
        pool.release(conn).await;

        let reply = match reply {
            Ok(v) => v,
            Err(RedisCoreError::Reply { .. }) => {
                self.state.write().await.clustered = Clustered::No;
                return Ok(());
            }
            Err(e) => {
                self.state.write().await.hint = None;
                return Err(e);
            }
        };

        // Parsed and validated before touching shared state: a gappy map
        // never displaces a good one (Open Question c).
        let new_map = SlotMap::parse(&reply)?;
        debug!(masters = new_map.masters().len(), "slot map refreshed");

        let mut wanted: Vec<String> = new_map.masters();
        for entry in new_map.entries() {
            for replica in &entry.replicas {
                if !wanted.contains(replica) {
                    wanted.push(replica.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        state.clustered = Clustered::Yes;
        for addr_str in &wanted {
            if !state.pools.contains_key(addr_str) {
                if let Ok(sock_addr) = addr_str.parse::<SocketAddr>() {
                    state.pools.insert(addr_str.clone(), make_pool(sock_addr, &self.connect_options, self.tcp_options, self.pool_config));
                }
            }
        }
        let stale: Vec<String> = state.pools.keys().filter(|k| !wanted.contains(k)).cloned().collect();
        let removed_pools: Vec<Pool> = stale.iter().filter_map(|k| state.pools.remove(k)).collect();
        state.slot_map = Some(Arc::new(new_map));
        if let Some(addr) = peer {
            state.hint = Some(addr.to_string());
        }
        drop(state);

        for pool in removed_pools {
            pool.close().await;
        }
        Ok(())
    }

    async fn pool_for_addr(&self, addr: &str) -> Result<Pool> {
        {
            let state = self.state.read().await;
            if let Some(p) = state.pools.get(addr) {
                return Ok(p.clone());
            }
        }
        let sock_addr: SocketAddr = addr.parse().map_err(|_| RedisCoreError::NoEndpointFound(addr.to_string()))?;
        let pool = make_pool(sock_addr, &self.connect_options, self.tcp_options, self.pool_config);
        self.state.write().await.pools.insert(addr.to_string(), pool.clone());
        Ok(pool)
    }

    async fn pool_for_key_bytes(&self, key: Option<Vec<u8>>, options: &CallOptions) -> Result<Pool> {
        if let EndpointSelector::Address(addr) = &options.endpoint {
            return self.pool_for_addr(addr).await;
        }
        let clustered = self.state.read().await.clustered;
        if clustered != Clustered::Yes {
            return self.any_pool().await;
        }
        let Some(key) = key else { return self.any_pool().await };
        let slot = key_slot(&key);
        let state = self.state.read().await;
        let map = state.slot_map.as_ref().ok_or(RedisCoreError::IncompleteSlotMap)?;
        let addr = map.master_for_slot(slot).ok_or(RedisCoreError::IncompleteSlotMap)?.to_string();
        state.pools.get(&addr).cloned().ok_or_else(|| RedisCoreError::NoEndpointFound(addr))
    }

    async fn pool_for_command(&self, cmds: &[Command], options: &CallOptions) -> Result<Pool> {
        if matches!(options.endpoint, EndpointSelector::Address(_)) {
            return self.pool_for_key_bytes(None, options).await;
        }
        let key = self.first_key(cmds).await?;
        self.pool_for_key_bytes(key, options).await
    }

    /// Finds the first command in the batch whose key can be determined,
    /// consulting (and lazily populating) the command-info cache (§4.5.2
    /// "Routing a command").
    async fn first_key(&self, cmds: &[Command]) -> Result<Option<Vec<u8>>> {
        for cmd in cmds {
            if let Some(key) = self.first_key_of(cmd).await? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn first_key_of(&self, cmd: &Command) -> Result<Option<Vec<u8>>> {
        let Some(name) = cmd.name_uppercase() else { return Ok(None) };
        let cached = { self.state.read().await.command_info.get(&name).copied() };
        let info = match cached {
            Some(i) => i,
            None => self.populate_command_info(&name).await?,
        };

        if info.first_key_index > 0 {
            let idx = info.first_key_index as usize;
            return Ok(cmd.args.get(idx).and_then(arg_bytes));
        }
        if info.first_key_index == 0 {
            return self.getkeys(cmd).await;
        }
        Ok(None)
    }

    async fn populate_command_info(&self, name: &str) -> Result<CommandInfo> {
        let pool = self.any_pool().await?;
        let mut conn = pool.take().await?;
        let reply = conn.call(&Command::new("COMMAND").arg("INFO").arg(name), &CallOptions::default()).await;
        pool.release(conn).await;

        let info = match reply {
            Ok(Value { data: ValueData::Array(Some(items)), .. }) => items.first().and_then(parse_command_info_entry).unwrap_or_default(),
            _ => CommandInfo::default(),
        };
        self.state.write().await.command_info.insert(name.to_string(), info);
        Ok(info)
    }

    /// `first_key_index == 0` means movable keys; ask the server directly.
    async fn getkeys(&self, cmd: &Command) -> Result<Option<Vec<u8>>> {
        let pool = match self.any_pool().await {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let mut conn = match pool.take().await {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        let mut getkeys = Command::new("COMMAND").arg("GETKEYS");
        getkeys.args.extend(cmd.args.iter().cloned());
        let reply = conn.call(&getkeys, &CallOptions::default()).await;
        pool.release(conn).await;

        match reply {
            Ok(Value { data: ValueData::Array(Some(items)), .. }) => Ok(items.into_iter().next().and_then(|v| v.into_bytes()).map(|b| b.to_vec())),
            _ => Ok(None),
        }
    }

    pub async fn call(&self, cmd: &Command, options: &CallOptions) -> Result<Value> {
        if matches!(options.endpoint, EndpointSelector::Masters) {
            return Err(RedisCoreError::protocol("endpoint=masters fans out; use call_fanout_masters"));
        }
        self.call_with_retry(std::slice::from_ref(cmd), options, true).await
    }

    /// Pipelines are never auto-retried on `MOVED` (resolves Open Question
    /// a, §9) — the caller sees the raw reply, redirect or not.
    pub async fn call_pipeline(&self, cmds: &[Command], options: &CallOptions) -> Result<Vec<Value>> {
        let pool = self.pool_for_command(cmds, options).await?;
        let mut conn = pool.take().await?;
        let result = conn.call_pipeline(cmds, options).await;
        pool.release(conn).await;
        result
    }

    fn call_with_retry<'a>(
        &'a self,
        cmds: &'a [Command],
        options: &'a CallOptions,
        allow_retry: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let cmd = &cmds[0];
            let pool = self.pool_for_command(cmds, options).await?;
            let mut conn = pool.take().await?;
            let result = conn.call(cmd, options).await;
            let moved = conn.take_moved();
            let ask = conn.take_ask();
            pool.release(conn).await;

            if allow_retry && matches!(options.endpoint, EndpointSelector::Auto) {
                if let Some(Redirect::Moved { slot, addr }) = moved {
                    trace!(slot, %addr, "MOVED, refreshing slot map and retrying once");
                    self.refresh_slots().await?;
                    return self.call_with_retry(cmds, options, false).await;
                }
                if let Some(Redirect::Ask { addr, .. }) = ask {
                    trace!(%addr, "ASK, retrying once against target node");
                    let pool = self.pool_for_addr(&addr).await?;
                    let mut asking_options = options.clone();
                    asking_options.asking = true;
                    let mut conn = pool.take().await?;
                    let retried = conn.call(cmd, &asking_options).await;
                    pool.release(conn).await;
                    return retried;
                }
            }
            result
        })
    }

    /// Invokes `cmd` against every known master, returning a per-address
    /// map of outcomes — a failure on one shard does not abort the others
    /// (§4.5.2 Fan-out).
    pub async fn call_fanout_masters(&self, cmd: &Command, options: &CallOptions) -> Result<HashMap<String, Result<Value>>> {
        let addrs = {
            let state = self.state.read().await;
            state.slot_map.as_ref().map(|m| m.masters()).unwrap_or_default()
        };
        let mut out = HashMap::new();
        for addr in addrs {
            let pool = self.pool_for_addr(&addr).await?;
            let conn = pool.take().await;
            let result = match conn {
                Ok(mut conn) => {
                    let r = conn.call(cmd, options).await;
                    pool.release(conn).await;
                    r
                }
                Err(e) => Err(e),
            };
            out.insert(addr, result);
        }
        Ok(out)
    }

    pub async fn connection(&self, key: Option<&[u8]>, options: &CallOptions) -> Result<(Pool, Connection)> {
        let pool = self.pool_for_key_bytes(key.map(|k| k.to_vec()), options).await?;
        let conn = pool.take().await?;
        Ok((pool, conn))
    }

    pub async fn endpoints(&self) -> Vec<(String, EndpointRole)> {
        let state = self.state.read().await;
        let masters: std::collections::HashSet<String> = state.slot_map.as_ref().map(|m| m.masters().into_iter().collect()).unwrap_or_default();
        state
            .pools
            .keys()
            .map(|addr| {
                let role = if masters.contains(addr) { EndpointRole::Master } else { EndpointRole::Replica };
                (addr.clone(), role)
            })
            .collect()
    }

    pub async fn close(&self) {
        let mut state = self.state.write().await;
        let pools: Vec<Pool> = state.pools.drain().map(|(_, p)| p).collect();
        drop(state);
        for pool in pools {
            pool.close().await;
        }
    }
}

fn parse_command_info_entry(v: &Value) -> Option<CommandInfo> {
    let ValueData::Array(Some(fields)) = &v.data else { return None };
    let ValueData::Integer(first_key) = fields.get(3)?.data else { return None };
    Some(CommandInfo { first_key_index: first_key })
}

fn arg_bytes(arg: &Argument) -> Option<Vec<u8>> {
    match arg {
        Argument::Bytes(b) => Some(b.to_vec()),
        Argument::Text(s) => Some(s.clone().into_bytes()),
        Argument::Int(i) => Some(i.to_string().into_bytes()),
        Argument::Float(f) => Some(f.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn node(ip: &str, port: i64) -> Value {
        Value::array(Some(vec![Value::bulk(Some(Bytes::from(ip.as_bytes().to_vec()))), Value::integer(port)]))
    }

    fn slots_entry(start: i64, end: i64, master: Value) -> Value {
        Value::array(Some(vec![Value::integer(start), Value::integer(end), master]))
    }

    #[test]
    fn full_coverage_parses() {
        let reply = Value::array(Some(vec![
            slots_entry(0, 8191, node("127.0.0.1", 7000)),
            slots_entry(8192, 16383, node("127.0.0.1", 7001)),
        ]));
        let map = SlotMap::parse(&reply).unwrap();
        assert_eq!(map.master_for_slot(0), Some("127.0.0.1:7000"));
        assert_eq!(map.master_for_slot(16383), Some("127.0.0.1:7001"));
        assert_eq!(map.masters().len(), 2);
    }

    #[test]
    fn gap_in_coverage_is_rejected() {
        let reply = Value::array(Some(vec![
            slots_entry(0, 100, node("127.0.0.1", 7000)),
            slots_entry(200, 16383, node("127.0.0.1", 7001)),
        ]));
        let err = SlotMap::parse(&reply).unwrap_err();
        assert!(matches!(err, RedisCoreError::IncompleteSlotMap));
    }

    #[test]
    fn overlap_in_coverage_is_rejected() {
        let reply = Value::array(Some(vec![
            slots_entry(0, 8191, node("127.0.0.1", 7000)),
            slots_entry(8000, 16383, node("127.0.0.1", 7001)),
        ]));
        let err = SlotMap::parse(&reply).unwrap_err();
        assert!(matches!(err, RedisCoreError::IncompleteSlotMap));
    }

    #[test]
    fn trailing_gap_is_rejected() {
        let reply = Value::array(Some(vec![slots_entry(0, 16000, node("127.0.0.1", 7000))]));
        let err = SlotMap::parse(&reply).unwrap_err();
        assert!(matches!(err, RedisCoreError::IncompleteSlotMap));
    }
}
