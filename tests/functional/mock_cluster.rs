//! In-memory cluster simulator for functional tests.
//!
//! [`SimCluster`] holds a set of simulated instances behind one mutex and
//! answers the cluster-control commands the library sends, with the same
//! reply shapes and the error cases that matter to the protocol (busy slots,
//! keys left behind on SETSLOT NODE, forgetting one's master, ...).
//!
//! Gossip is instantaneous: CLUSTER MEET merges membership across both
//! sides at once, and every node derives other members' slots from their
//! own claims. Hiding slots from one node's view makes that view diverge.
//!
//! Faults can be injected per key (for MIGRATE) or per command.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use valkey_clu::client::{Connector, Node, NodeAddr, NodeError, Reply, Transport};
use valkey_clu::cluster::{ClusterConfig, RetryPolicy, WaitPolicy};
use valkey_clu::slots::{compress_slots, split_slots};

/// Failure injected into a command or key transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `ASK <slot> <dst>`
    Ask,
    /// `MOVED <slot> <dst>`
    Moved,
    /// A non-redirect error reply.
    Error,
    /// A transport timeout.
    Timeout,
}

/// Apply the fault this many times.
pub const FOREVER: usize = usize::MAX;

/// One simulated instance.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub cluster_enabled: bool,
    pub known: BTreeSet<String>,
    pub owned: BTreeSet<u16>,
    pub migrating: BTreeMap<u16, String>,
    pub importing: BTreeMap<u16, String>,
    pub keys: BTreeMap<String, u16>,
    pub replicate: Option<String>,
    pub epoch: u64,
    pub hidden: BTreeSet<u16>,
}

impl SimNode {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_master(&self) -> bool {
        self.replicate.is_none()
    }
}

#[derive(Debug, Default)]
struct World {
    nodes: Vec<SimNode>,
    key_faults: BTreeMap<String, (Fault, usize)>,
    command_faults: Vec<(String, Fault, usize)>,
    log: Vec<(String, String)>,
    next_id: u64,
}

fn err(message: impl Into<String>) -> NodeError {
    NodeError::from_response(message)
}

fn fault_error(fault: Fault, slot: u16, target: &str) -> NodeError {
    match fault {
        Fault::Ask => err(format!("ASK {} {}", slot, target)),
        Fault::Moved => err(format!("MOVED {} {}", slot, target)),
        Fault::Error => err("IOERR error or timeout writing to target instance"),
        Fault::Timeout => NodeError::Timeout("timed out reading from socket".to_string()),
    }
}

fn arg<'a>(args: &'a [String], idx: usize) -> Result<&'a str, NodeError> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| err("ERR wrong number of arguments"))
}

fn slot_arg(args: &[String], idx: usize) -> Result<u16, NodeError> {
    arg(args, idx)?
        .parse()
        .map_err(|_| err("ERR Invalid or out of range slot"))
}

impl World {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn index_of(&self, host: &str, port: u16) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.host == host && n.port == port)
    }

    fn index_of_id(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Ids visible from `idx`, itself included.
    fn view_ids(&self, idx: usize) -> BTreeSet<String> {
        let me = &self.nodes[idx];
        let mut ids = me.known.clone();
        ids.insert(me.id.clone());
        ids
    }

    /// Slots of member `other` as seen from `idx`.
    fn slots_in_view(&self, idx: usize, other: usize) -> BTreeSet<u16> {
        let me = &self.nodes[idx];
        let member = &self.nodes[other];
        member.owned.difference(&me.hidden).copied().collect()
    }

    fn render_line(&self, idx: usize, other: usize) -> String {
        let member = &self.nodes[other];
        let mut flags = Vec::new();
        if idx == other {
            flags.push("myself");
        }
        flags.push(if member.is_master() { "master" } else { "slave" });

        let mut tokens: Vec<String> = compress_slots(&self.slots_in_view(idx, other))
            .iter()
            .map(ToString::to_string)
            .collect();
        if idx == other {
            tokens.extend(
                member
                    .migrating
                    .iter()
                    .map(|(slot, dst)| format!("[{}->-{}]", slot, dst)),
            );
            tokens.extend(
                member
                    .importing
                    .iter()
                    .map(|(slot, src)| format!("[{}-<-{}]", slot, src)),
            );
        }

        let line = format!(
            "{} {}@{} {} {} 0 0 {} connected",
            member.id,
            member.addr(),
            u32::from(member.port) + 10000,
            flags.join(","),
            member.replicate.as_deref().unwrap_or("-"),
            member.epoch,
        );
        if tokens.is_empty() {
            line
        } else {
            format!("{} {}", line, tokens.join(" "))
        }
    }

    fn members_in_view(&self, idx: usize) -> Vec<usize> {
        self.view_ids(idx)
            .iter()
            .filter_map(|id| self.index_of_id(id))
            .collect()
    }

    fn render_nodes(&self, idx: usize) -> String {
        let mut out = String::new();
        for other in self.members_in_view(idx) {
            out.push_str(&self.render_line(idx, other));
            out.push('\n');
        }
        out
    }

    fn take_command_fault(&mut self, name: &str) -> Option<Fault> {
        let entry = self
            .command_faults
            .iter_mut()
            .find(|(cmd, _, remaining)| cmd == name && *remaining > 0)?;
        if entry.2 != FOREVER {
            entry.2 -= 1;
        }
        Some(entry.1)
    }

    fn execute(
        &mut self,
        host: &str,
        port: u16,
        command: &str,
        args: &[String],
    ) -> Result<Reply, NodeError> {
        let idx = self
            .index_of(host, port)
            .ok_or_else(|| NodeError::Connection(format!("{}:{} unreachable", host, port)))?;

        let command = command.to_uppercase();
        let name = match (command.as_str(), args.first()) {
            ("CLUSTER", Some(sub)) => format!("CLUSTER {}", sub.to_uppercase()),
            _ => command.clone(),
        };
        let line = std::iter::once(command.clone())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.log.push((format!("{}:{}", host, port), line));

        if let Some(fault) = self.take_command_fault(&name) {
            return Err(fault_error(fault, 0, "0.0.0.0:0"));
        }

        match command.as_str() {
            "PING" => Ok(Reply::Text("PONG".to_string())),
            "INFO" => Ok(Reply::Text(format!(
                "# Cluster\r\ncluster_enabled:{}\r\n",
                u8::from(self.nodes[idx].cluster_enabled)
            ))),
            "SELECT" => Ok(Reply::ok()),
            "RANDOMKEY" => Ok(self.nodes[idx]
                .keys
                .keys()
                .next()
                .map_or(Reply::Nil, |k| Reply::Text(k.clone()))),
            "FLUSHALL" => {
                self.nodes[idx].keys.clear();
                Ok(Reply::ok())
            }
            "MIGRATE" => self.migrate(idx, args),
            "CLUSTER" => {
                let sub = arg(args, 0)?.to_uppercase();
                self.cluster(idx, &sub, &args[1..])
            }
            other => Err(err(format!("ERR unknown command '{}'", other))),
        }
    }

    fn migrate(&mut self, idx: usize, args: &[String]) -> Result<Reply, NodeError> {
        let host = arg(args, 0)?;
        let port: u16 = arg(args, 1)?
            .parse()
            .map_err(|_| err("ERR invalid port"))?;
        let key = arg(args, 2)?.to_string();
        let dst = self
            .index_of(host, port)
            .ok_or_else(|| err("IOERR error or timeout connecting to the client"))?;

        let Some(&slot) = self.nodes[idx].keys.get(&key) else {
            return Ok(Reply::Text("NOKEY".to_string()));
        };

        if let Some((fault, remaining)) = self.key_faults.get_mut(&key)
            && *remaining > 0
        {
            if *remaining != FOREVER {
                *remaining -= 1;
            }
            return Err(fault_error(*fault, slot, &format!("{}:{}", host, port)));
        }

        let target = &self.nodes[dst];
        if !target.owned.contains(&slot) && !target.importing.contains_key(&slot) {
            return Err(err(format!(
                "ERR Target instance replied with error: MOVED {} {}",
                slot,
                target.addr()
            )));
        }

        self.nodes[idx].keys.remove(&key);
        self.nodes[dst].keys.insert(key, slot);
        Ok(Reply::ok())
    }

    fn knows(&self, idx: usize, id: &str) -> bool {
        self.nodes[idx].id == id || self.nodes[idx].known.contains(id)
    }

    fn cluster(&mut self, idx: usize, sub: &str, args: &[String]) -> Result<Reply, NodeError> {
        match sub {
            "NODES" => Ok(Reply::Text(self.render_nodes(idx))),
            "INFO" => {
                let assigned: usize = self
                    .members_in_view(idx)
                    .into_iter()
                    .map(|other| self.slots_in_view(idx, other).len())
                    .sum();
                Ok(Reply::Text(format!(
                    "cluster_state:ok\r\ncluster_slots_assigned:{}\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\n",
                    assigned,
                    self.nodes[idx].known.len() + 1,
                    self.members_in_view(idx)
                        .into_iter()
                        .filter(|o| !self.nodes[*o].owned.is_empty())
                        .count(),
                )))
            }
            "SETSLOT" => {
                if !self.nodes[idx].is_master() {
                    return Err(err("ERR Please use SETSLOT only with masters."));
                }
                let slot = slot_arg(args, 0)?;
                let action = arg(args, 1)?.to_uppercase();
                let target = args.get(2).cloned();
                if let Some(id) = &target
                    && !self.knows(idx, id)
                {
                    return Err(err(format!("ERR I don't know about node {}", id)));
                }
                let me = &mut self.nodes[idx];
                match (action.as_str(), target) {
                    ("IMPORTING", Some(src)) => {
                        if me.owned.contains(&slot) {
                            return Err(err(format!(
                                "ERR I'm already the owner of hash slot {}",
                                slot
                            )));
                        }
                        me.importing.insert(slot, src);
                    }
                    ("MIGRATING", Some(dst)) => {
                        if !me.owned.contains(&slot) {
                            return Err(err(format!(
                                "ERR I'm not the owner of hash slot {}",
                                slot
                            )));
                        }
                        me.migrating.insert(slot, dst);
                    }
                    ("STABLE", None) => {
                        me.migrating.remove(&slot);
                        me.importing.remove(&slot);
                    }
                    ("NODE", Some(owner)) => {
                        if owner == me.id {
                            me.owned.insert(slot);
                        } else {
                            if me.keys.values().any(|s| *s == slot) {
                                return Err(err(format!(
                                    "ERR Can't assign hashslot {} to a different node while I still hold keys for this hash slot.",
                                    slot
                                )));
                            }
                            me.owned.remove(&slot);
                        }
                        me.migrating.remove(&slot);
                        me.importing.remove(&slot);
                    }
                    _ => return Err(err("ERR Invalid CLUSTER SETSLOT action or number of arguments")),
                }
                Ok(Reply::ok())
            }
            "ADDSLOTS" => {
                let slots = (0..args.len())
                    .map(|i| slot_arg(args, i))
                    .collect::<Result<Vec<_>, _>>()?;
                let members = self.members_in_view(idx);
                for slot in &slots {
                    if members.iter().any(|m| self.nodes[*m].owned.contains(slot)) {
                        return Err(err(format!("ERR Slot {} is already busy", slot)));
                    }
                }
                self.nodes[idx].owned.extend(slots);
                Ok(Reply::ok())
            }
            "GETKEYSINSLOT" => {
                let slot = slot_arg(args, 0)?;
                let count: usize = arg(args, 1)?
                    .parse()
                    .map_err(|_| err("ERR Invalid number of keys"))?;
                Ok(Reply::Array(
                    self.nodes[idx]
                        .keys
                        .iter()
                        .filter(|(_, s)| **s == slot)
                        .take(count)
                        .map(|(k, _)| Reply::Text(k.clone()))
                        .collect(),
                ))
            }
            "COUNTKEYSINSLOT" => {
                let slot = slot_arg(args, 0)?;
                let count = self.nodes[idx].keys.values().filter(|s| **s == slot).count();
                Ok(Reply::Integer(count as i64))
            }
            "SLAVES" => {
                let master = arg(args, 0)?;
                if !self.knows(idx, master) {
                    return Err(err(format!("ERR Unknown node {}", master)));
                }
                Ok(Reply::Array(
                    self.members_in_view(idx)
                        .into_iter()
                        .filter(|o| self.nodes[*o].replicate.as_deref() == Some(master))
                        .map(|o| Reply::Text(self.render_line(idx, o)))
                        .collect(),
                ))
            }
            "FORGET" => {
                let id = arg(args, 0)?;
                let me = &mut self.nodes[idx];
                if me.id == id {
                    return Err(err("ERR I tried hard but I can't forget myself..."));
                }
                if me.replicate.as_deref() == Some(id) {
                    return Err(err("ERR Can't forget my master!"));
                }
                if !me.known.remove(id) {
                    return Err(err(format!("ERR Unknown node {}", id)));
                }
                Ok(Reply::ok())
            }
            "MEET" => {
                let host = arg(args, 0)?;
                let port: u16 = arg(args, 1)?
                    .parse()
                    .map_err(|_| err("ERR Invalid TCP base port specified"))?;
                let other = self
                    .index_of(host, port)
                    .ok_or_else(|| err(format!("ERR Invalid node address specified: {}:{}", host, port)))?;
                let mut component = self.view_ids(idx);
                component.extend(self.view_ids(other));
                for node in &mut self.nodes {
                    if component.contains(&node.id) {
                        node.known = component.iter().filter(|id| **id != node.id).cloned().collect();
                    }
                }
                Ok(Reply::ok())
            }
            "REPLICATE" => {
                let master = arg(args, 0)?;
                if !self.knows(idx, master) {
                    return Err(err(format!("ERR Unknown node {}", master)));
                }
                let me = &mut self.nodes[idx];
                if !me.owned.is_empty() {
                    return Err(err(
                        "ERR To set a master the node must be empty and without assigned slots.",
                    ));
                }
                me.replicate = Some(master.to_string());
                Ok(Reply::ok())
            }
            "SET-CONFIG-EPOCH" => {
                let epoch = arg(args, 0)?
                    .parse()
                    .map_err(|_| err("ERR Invalid config epoch specified"))?;
                self.nodes[idx].epoch = epoch;
                Ok(Reply::ok())
            }
            "RESET" => {
                let hard = args
                    .first()
                    .is_some_and(|m| m.eq_ignore_ascii_case("HARD"));
                if self.nodes[idx].is_master() && !self.nodes[idx].keys.is_empty() {
                    return Err(err(
                        "ERR CLUSTER RESET can't be called with master nodes containing keys",
                    ));
                }
                let new_id = if hard { Some(self.new_id()) } else { None };
                let me = &mut self.nodes[idx];
                me.known.clear();
                me.owned.clear();
                me.migrating.clear();
                me.importing.clear();
                me.hidden.clear();
                me.replicate = None;
                me.keys.clear();
                if let Some(id) = new_id {
                    me.id = id;
                    me.epoch = 0;
                }
                Ok(Reply::ok())
            }
            other => Err(err(format!("ERR Unknown subcommand '{}'", other))),
        }
    }
}

/// Transport into the simulator for one instance.
pub struct SimTransport {
    world: Arc<Mutex<World>>,
    host: String,
    port: u16,
}

impl Transport for SimTransport {
    async fn call(&self, command: &str, args: Vec<String>) -> Result<Reply, NodeError> {
        let mut world = self.world.lock().unwrap();
        world.execute(&self.host, self.port, command, &args)
    }
}

/// Connector resolving addresses inside the simulator.
#[derive(Clone)]
pub struct SimConnector {
    world: Arc<Mutex<World>>,
}

impl Connector for SimConnector {
    type Transport = SimTransport;

    async fn connect(&self, addr: &NodeAddr) -> Result<Node<SimTransport>, NodeError> {
        let node = Node::new(
            addr.host.clone(),
            addr.port,
            SimTransport {
                world: Arc::clone(&self.world),
                host: addr.host.clone(),
                port: addr.port,
            },
        );
        node.ping().await?;
        Ok(node)
    }
}

/// Handle on a simulated set of instances.
#[derive(Clone, Default)]
pub struct SimCluster {
    world: Arc<Mutex<World>>,
}

impl SimCluster {
    /// Empty simulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` bare instances on `10.0.0.1:7000`, `10.0.0.2:7000`, ...
    pub fn bare(count: usize) -> Self {
        let sim = Self::new();
        for i in 0..count {
            sim.add_instance(&format!("10.0.0.{}", i + 1), 7000);
        }
        sim
    }

    /// `count` masters meshed together with `total` slots split evenly.
    pub fn with_masters(count: usize, total: u16) -> Self {
        let sim = Self::bare(count);
        sim.mesh();
        for (idx, range) in split_slots(total, count).into_iter().enumerate() {
            sim.assign(idx, range.iter());
        }
        sim
    }

    /// Add a bare, cluster-enabled instance; returns its index.
    pub fn add_instance(&self, host: &str, port: u16) -> usize {
        let mut world = self.world.lock().unwrap();
        let id = world.new_id();
        world.nodes.push(SimNode {
            id,
            host: host.to_string(),
            port,
            cluster_enabled: true,
            known: BTreeSet::new(),
            owned: BTreeSet::new(),
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
            keys: BTreeMap::new(),
            replicate: None,
            epoch: 0,
            hidden: BTreeSet::new(),
        });
        world.nodes.len() - 1
    }

    /// Make every instance know every other one.
    pub fn mesh(&self) {
        let mut world = self.world.lock().unwrap();
        let ids: BTreeSet<String> = world.nodes.iter().map(|n| n.id.clone()).collect();
        for node in &mut world.nodes {
            node.known = ids.iter().filter(|id| **id != node.id).cloned().collect();
        }
    }

    /// Give `slots` to instance `idx`.
    pub fn assign(&self, idx: usize, slots: impl IntoIterator<Item = u16>) {
        self.world.lock().unwrap().nodes[idx].owned.extend(slots);
    }

    /// Drop `slots` from instance `idx` without telling anyone.
    pub fn unassign(&self, idx: usize, slots: impl IntoIterator<Item = u16>) {
        let mut world = self.world.lock().unwrap();
        for slot in slots {
            world.nodes[idx].owned.remove(&slot);
        }
    }

    /// Store `count` keys in `slot` on instance `idx`.
    pub fn insert_keys(&self, idx: usize, slot: u16, count: usize) -> Vec<String> {
        let mut world = self.world.lock().unwrap();
        (0..count)
            .map(|i| {
                let key = format!("key:{}:{}", slot, i);
                world.nodes[idx].keys.insert(key.clone(), slot);
                key
            })
            .collect()
    }

    /// Keys held by instance `idx` in `slot`.
    pub fn keys_in_slot(&self, idx: usize, slot: u16) -> usize {
        self.world.lock().unwrap().nodes[idx]
            .keys
            .values()
            .filter(|s| **s == slot)
            .count()
    }

    /// Snapshot of instance `idx`.
    pub fn sim_node(&self, idx: usize) -> SimNode {
        self.world.lock().unwrap().nodes[idx].clone()
    }

    /// Node id of instance `idx`.
    pub fn id(&self, idx: usize) -> String {
        self.sim_node(idx).id
    }

    /// `host:port` of instance `idx`.
    pub fn addr(&self, idx: usize) -> String {
        self.sim_node(idx).addr()
    }

    /// Slots instance `idx` claims.
    pub fn owned(&self, idx: usize) -> BTreeSet<u16> {
        self.sim_node(idx).owned
    }

    /// Mark `slot` MIGRATING on `idx` towards `dst_id`.
    pub fn set_migrating(&self, idx: usize, slot: u16, dst_id: &str) {
        self.world.lock().unwrap().nodes[idx]
            .migrating
            .insert(slot, dst_id.to_string());
    }

    /// Mark `slot` IMPORTING on `idx` from `src_id`.
    pub fn set_importing(&self, idx: usize, slot: u16, src_id: &str) {
        self.world.lock().unwrap().nodes[idx]
            .importing
            .insert(slot, src_id.to_string());
    }

    /// Make instance `idx` see `slot` as unowned.
    pub fn hide_slot(&self, idx: usize, slot: u16) {
        self.world.lock().unwrap().nodes[idx].hidden.insert(slot);
    }

    /// Make instance `idx` a replica of `master_id`.
    pub fn set_replica_of(&self, idx: usize, master_id: &str) {
        self.world.lock().unwrap().nodes[idx].replicate = Some(master_id.to_string());
    }

    /// Toggle cluster mode on instance `idx`.
    pub fn set_cluster_enabled(&self, idx: usize, enabled: bool) {
        self.world.lock().unwrap().nodes[idx].cluster_enabled = enabled;
    }

    /// Fail MIGRATE of `key` with `fault`, `times` times.
    pub fn fault_key(&self, key: &str, fault: Fault, times: usize) {
        self.world
            .lock()
            .unwrap()
            .key_faults
            .insert(key.to_string(), (fault, times));
    }

    /// Fail `command` (e.g. `CLUSTER GETKEYSINSLOT`) with `fault`, `times` times.
    pub fn fault_command(&self, command: &str, fault: Fault, times: usize) {
        self.world
            .lock()
            .unwrap()
            .command_faults
            .push((command.to_string(), fault, times));
    }

    /// Every command sent so far as `(addr, line)`.
    pub fn log(&self) -> Vec<(String, String)> {
        self.world.lock().unwrap().log.clone()
    }

    /// Command lines sent so far that start with `prefix`.
    pub fn sent(&self, prefix: &str) -> Vec<(String, String)> {
        self.log()
            .into_iter()
            .filter(|(_, line)| line.starts_with(prefix))
            .collect()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.world.lock().unwrap().log.clear();
    }

    /// Connector into this simulator.
    pub fn connector(&self) -> SimConnector {
        SimConnector {
            world: Arc::clone(&self.world),
        }
    }

    /// Connected node for instance `idx`.
    pub fn node(&self, idx: usize) -> Node<SimTransport> {
        let node = self.sim_node(idx);
        Node::new(
            node.host.clone(),
            node.port,
            SimTransport {
                world: Arc::clone(&self.world),
                host: node.host,
                port: node.port,
            },
        )
    }

    /// Connected nodes for every instance.
    pub fn nodes(&self) -> Vec<Node<SimTransport>> {
        let count = self.world.lock().unwrap().nodes.len();
        (0..count).map(|idx| self.node(idx)).collect()
    }
}

/// Configuration that never sleeps for long.
pub fn test_config(total_slots: u16) -> ClusterConfig {
    ClusterConfig::default()
        .with_total_slots(total_slots)
        .with_retry(RetryPolicy::default().with_backoff(Duration::ZERO))
        .with_wait(WaitPolicy {
            poll_interval: Duration::from_millis(1),
            max_polls: 3,
        })
}
