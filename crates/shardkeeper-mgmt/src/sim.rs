//! In-memory simulation of a sharded cluster.
//!
//! Implements [`SessionFactory`], [`AdminSession`] and [`ServiceControl`] on
//! top of a shared state so reconciliation and upgrade campaigns can be run
//! without a database. Failures are injected per command name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CoordError, Result, FORBIDDEN_REMOVAL_ERR_CODE};
use crate::service::ServiceControl;
use crate::session::{AdminSession, SessionFactory, SessionTarget};
use crate::topology::{
    shard_name_from_host, ClusterMember, DatabaseInfo, MemberState, MemberStatus, RemovalInfo,
    ReplicaSetStatus, ShardEntry, ShardList, ShardRelation,
};

const SIM_PORT: u16 = 27017;
const SHARD_NOT_FOUND_CODE: i32 = 70;

#[derive(Debug, Clone)]
struct SimShard {
    host: String,
    draining: Option<bool>,
    removals_left: u32,
}

#[derive(Debug, Clone)]
struct SimMember {
    host: String,
    state: MemberState,
    health: u8,
    running: bool,
    lagging: bool,
    markers: BTreeMap<String, String>,
}

impl SimMember {
    fn new(host: &str, state: MemberState) -> Self {
        Self {
            host: host.to_string(),
            state,
            health: 1,
            running: true,
            lagging: false,
            markers: BTreeMap::new(),
        }
    }

    fn accepts_replication(&self) -> bool {
        self.running && self.health == 1 && !self.lagging
    }
}

#[derive(Debug)]
struct SimState {
    shards: BTreeMap<String, SimShard>,
    databases: Vec<DatabaseInfo>,
    members: Vec<SimMember>,
    removal_rounds: u32,
    elect_on_step_down: bool,
    failures: BTreeMap<String, VecDeque<CoordError>>,
    commands: Vec<String>,
    passwords: BTreeMap<String, String>,
    service_actions: Vec<String>,
    failing_installs: BTreeSet<String>,
    versions: BTreeMap<String, String>,
    keyfiles: BTreeMap<String, String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            shards: BTreeMap::new(),
            databases: Vec::new(),
            members: Vec::new(),
            removal_rounds: 1,
            elect_on_step_down: true,
            failures: BTreeMap::new(),
            commands: Vec::new(),
            passwords: BTreeMap::new(),
            service_actions: Vec::new(),
            failing_installs: BTreeSet::new(),
            versions: BTreeMap::new(),
            keyfiles: BTreeMap::new(),
        }
    }
}

impl SimState {
    fn record(&mut self, command: &str) -> Result<()> {
        self.commands.push(command.to_string());
        match self.failures.get_mut(command).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn primary_index(&self) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.state == MemberState::Primary)
    }

    fn member_mut(&mut self, host: &str) -> Option<&mut SimMember> {
        self.members.iter_mut().find(|m| m.host == host)
    }
}

/// Shared handle to a simulated cluster. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
    open_sessions: Arc<AtomicUsize>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A replica set whose first host is primary.
    pub fn replica_set(hosts: &[&str]) -> Self {
        let cluster = Self::new();
        {
            let mut state = cluster.lock();
            for (i, host) in hosts.iter().enumerate() {
                let member_state = if i == 0 {
                    MemberState::Primary
                } else {
                    MemberState::Secondary
                };
                state.members.push(SimMember::new(host, member_state));
            }
        }
        cluster
    }

    /// A router with the given shards registered and none draining.
    pub fn sharded(shards: &[&str]) -> Self {
        let cluster = Self::new();
        {
            let mut state = cluster.lock();
            for name in shards {
                let host = format!("{}/{}-0:{}", name, name, SIM_PORT);
                state.shards.insert(
                    name.to_string(),
                    SimShard {
                        host,
                        draining: None,
                        removals_left: 1,
                    },
                );
            }
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds replica-set members; the first becomes primary if there is none yet.
    pub fn with_members(self, hosts: &[&str]) -> Self {
        {
            let mut state = self.lock();
            for host in hosts {
                let member_state = if state.primary_index().is_none() {
                    MemberState::Primary
                } else {
                    MemberState::Secondary
                };
                state.members.push(SimMember::new(host, member_state));
            }
        }
        self
    }

    /// Number of remove commands needed before a shard disappears.
    pub fn with_removal_rounds(self, rounds: u32) -> Self {
        {
            let mut state = self.lock();
            state.removal_rounds = rounds.max(1);
            for shard in state.shards.values_mut() {
                shard.removals_left = rounds.max(1);
            }
        }
        self
    }

    pub fn with_database(self, name: &str, primary_shard: &str) -> Self {
        self.lock().databases.push(DatabaseInfo {
            name: name.to_string(),
            primary: primary_shard.to_string(),
            partitioned: false,
        });
        self
    }

    pub fn set_draining(&self, shard: &str, draining: Option<bool>) {
        if let Some(s) = self.lock().shards.get_mut(shard) {
            s.draining = draining;
        }
    }

    /// Queues a failure for the next invocation of `command`.
    pub fn fail_next(&self, command: &str, code: Option<i32>, msg: &str) {
        let err = CoordError::AdminCommand {
            command: command.to_string(),
            code,
            msg: msg.to_string(),
        };
        self.lock()
            .failures
            .entry(command.to_string())
            .or_default()
            .push_back(err);
    }

    /// A lagging member stops receiving replicated writes.
    pub fn set_lagging(&self, host: &str, lagging: bool) {
        if let Some(m) = self.lock().member_mut(host) {
            m.lagging = lagging;
        }
    }

    pub fn set_member_state(&self, host: &str, member_state: MemberState, health: u8) {
        if let Some(m) = self.lock().member_mut(host) {
            m.state = member_state;
            m.health = health;
        }
    }

    pub fn set_elect_on_step_down(&self, elect: bool) {
        self.lock().elect_on_step_down = elect;
    }

    pub fn fail_install(&self, host: &str) {
        self.lock().failing_installs.insert(host.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn command_count(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == command).count()
    }

    pub fn shard_names(&self) -> BTreeSet<String> {
        self.lock().shards.keys().cloned().collect()
    }

    pub fn primary(&self) -> Option<String> {
        let state = self.lock();
        state.primary_index().map(|i| state.members[i].host.clone())
    }

    /// Marker collections currently present on `host`.
    pub fn collections_on(&self, host: &str) -> Vec<String> {
        self.lock()
            .members
            .iter()
            .find(|m| m.host == host)
            .map(|m| m.markers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn password(&self, username: &str) -> Option<String> {
        self.lock().passwords.get(username).cloned()
    }

    pub fn service_actions(&self) -> Vec<String> {
        self.lock().service_actions.clone()
    }

    pub fn version_of(&self, host: &str) -> Option<String> {
        self.lock().versions.get(host).cloned()
    }

    pub fn keyfile_of(&self, host: &str) -> Option<String> {
        self.lock().keyfiles.get(host).cloned()
    }

    /// Sessions opened and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn router_session(&self) -> Box<dyn AdminSession> {
        self.session(SessionTarget::router(["router"]))
    }

    fn session(&self, target: SessionTarget) -> Box<dyn AdminSession> {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Box::new(SimSession {
            cluster: self.clone(),
            target,
        })
    }
}

#[async_trait]
impl SessionFactory for SimCluster {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn AdminSession>> {
        if let SessionTarget::Direct { host } = target {
            let state = self.lock();
            let reachable = state
                .members
                .iter()
                .any(|m| &m.host == host && m.running && m.health == 1);
            if !reachable {
                return Err(CoordError::admin(
                    "connect",
                    format!("connection refused by {}", host),
                ));
            }
        }
        Ok(self.session(target.clone()))
    }
}

struct SimSession {
    cluster: SimCluster,
    target: SessionTarget,
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.cluster.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AdminSession for SimSession {
    async fn list_shards(&self) -> Result<ShardList> {
        let mut state = self.cluster.lock();
        state.record("listShards")?;
        let shards = state
            .shards
            .iter()
            .map(|(name, s)| ShardEntry {
                id: name.clone(),
                host: s.host.clone(),
                draining: s.draining,
            })
            .collect();
        Ok(ShardList { shards })
    }

    async fn add_shard(&self, host_spec: &str) -> Result<()> {
        let mut state = self.cluster.lock();
        state.record("addShard")?;
        let name = shard_name_from_host(host_spec).to_string();
        let removals_left = state.removal_rounds;
        state.shards.entry(name).or_insert(SimShard {
            host: host_spec.to_string(),
            draining: None,
            removals_left,
        });
        Ok(())
    }

    async fn remove_shard(&self, shard_name: &str) -> Result<RemovalInfo> {
        let mut state = self.cluster.lock();
        state.record("removeShard")?;
        if !state.shards.contains_key(shard_name) {
            return Err(CoordError::admin_code(
                "removeShard",
                SHARD_NOT_FOUND_CODE,
                format!("shard {} does not exist", shard_name),
            ));
        }
        if state.shards.len() == 1 {
            return Err(CoordError::admin_code(
                "removeShard",
                FORBIDDEN_REMOVAL_ERR_CODE,
                "removing the last shard is not allowed",
            ));
        }

        let dbs_to_move: Vec<String> = state
            .databases
            .iter()
            .filter(|db| db.primary == shard_name)
            .map(|db| db.name.clone())
            .collect();
        let mut gone = false;
        let mut started = false;
        let mut remaining = 0;
        if let Some(shard) = state.shards.get_mut(shard_name) {
            started = shard.draining != Some(true);
            shard.draining = Some(true);
            shard.removals_left = shard.removals_left.saturating_sub(1);
            remaining = shard.removals_left;
            gone = remaining == 0;
        }
        if gone {
            state.shards.remove(shard_name);
        }

        let phase = if gone {
            "completed"
        } else if started {
            "started"
        } else {
            "ongoing"
        };
        Ok(RemovalInfo {
            state: phase.to_string(),
            remaining_chunks: (!gone).then_some(u64::from(remaining)),
            dbs_to_move,
        })
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let mut state = self.cluster.lock();
        state.record("listDatabases")?;
        Ok(state.databases.clone())
    }

    async fn replica_set_status(&self) -> Result<ReplicaSetStatus> {
        let mut state = self.cluster.lock();
        state.record("replSetGetStatus")?;
        let members = state
            .members
            .iter()
            .map(|m| MemberStatus {
                name: format!("{}:{}", m.host, SIM_PORT),
                state: m.state,
                health: m.health,
            })
            .collect();
        Ok(ReplicaSetStatus { members })
    }

    async fn step_down_primary(&self) -> Result<()> {
        let mut state = self.cluster.lock();
        state.record("replSetStepDown")?;
        let old = state
            .primary_index()
            .ok_or_else(|| CoordError::admin("replSetStepDown", "no primary"))?;
        let candidate = state
            .members
            .iter()
            .enumerate()
            .position(|(i, m)| i != old && m.running && m.health == 1);
        let elect = state.elect_on_step_down;

        let old_member = &mut state.members[old];
        old_member.state = if old_member.running {
            MemberState::Secondary
        } else {
            MemberState::Down
        };
        if let (true, Some(new)) = (elect, candidate) {
            state.members[new].state = MemberState::Primary;
        }
        Ok(())
    }

    async fn current_primary(&self) -> Result<Option<String>> {
        let mut state = self.cluster.lock();
        state.record("isMaster")?;
        Ok(state.primary_index().map(|i| state.members[i].host.clone()))
    }

    async fn set_user_password(&self, username: &str, password: &str) -> Result<()> {
        let mut state = self.cluster.lock();
        state.record("updateUser")?;
        state
            .passwords
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn insert_marker(&self, collection: &str, value: &str) -> Result<()> {
        let mut state = self.cluster.lock();
        state.record("insert")?;
        if matches!(self.target, SessionTarget::Direct { .. }) {
            return Err(CoordError::admin("insert", "not primary"));
        }
        let primary = state
            .primary_index()
            .filter(|&i| state.members[i].running)
            .ok_or_else(|| CoordError::admin("insert", "no primary available"))?;
        for (i, member) in state.members.iter_mut().enumerate() {
            if i == primary || member.accepts_replication() {
                member
                    .markers
                    .insert(collection.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    async fn find_marker(&self, collection: &str) -> Result<Option<String>> {
        let mut state = self.cluster.lock();
        state.record("find")?;
        let member = match &self.target {
            SessionTarget::Direct { host } => state.members.iter().find(|m| &m.host == host),
            _ => state.primary_index().map(|i| &state.members[i]),
        };
        Ok(member.and_then(|m| m.markers.get(collection).cloned()))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut state = self.cluster.lock();
        state.record("drop")?;
        for member in state.members.iter_mut() {
            member.markers.remove(collection);
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for SimCluster {
    async fn stop(&self, member: &ClusterMember) -> Result<()> {
        let mut state = self.lock();
        state.service_actions.push(format!("stop {}", member.id));
        if let Some(m) = state.member_mut(&member.host) {
            m.running = false;
            m.health = 0;
            // A stopped primary keeps its role until someone steps it down.
            if m.state != MemberState::Primary {
                m.state = MemberState::Down;
            }
        }
        Ok(())
    }

    async fn install(&self, member: &ClusterMember, version: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .service_actions
            .push(format!("install {} {}", member.id, version));
        if state.failing_installs.contains(&member.host) {
            return Err(CoordError::Service {
                action: "install".to_string(),
                msg: format!("package install failed on {}", member.host),
            });
        }
        state
            .versions
            .insert(member.host.clone(), version.to_string());
        Ok(())
    }

    async fn restart(&self, member: &ClusterMember) -> Result<()> {
        let mut state = self.lock();
        state.service_actions.push(format!("restart {}", member.id));
        let primary_markers = state
            .primary_index()
            .map(|i| state.members[i].markers.clone())
            .unwrap_or_default();
        if let Some(m) = state.member_mut(&member.host) {
            m.running = true;
            m.health = 1;
            if m.state != MemberState::Primary {
                m.state = MemberState::Secondary;
                m.markers = primary_markers;
            }
        }
        Ok(())
    }

    async fn read_keyfile(&self, member: &ClusterMember) -> Result<Option<String>> {
        Ok(self.lock().keyfiles.get(&member.host).cloned())
    }

    async fn write_keyfile(&self, member: &ClusterMember, contents: &str) -> Result<()> {
        let mut state = self.lock();
        state.service_actions.push(format!("keyfile {}", member.id));
        state
            .keyfiles
            .insert(member.host.clone(), contents.to_string());
        Ok(())
    }
}

/// A cluster description loadable from JSON, used by the `simulate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimScenario {
    /// Shards currently registered with the router.
    pub shards: Vec<String>,
    /// Desired shards, as relations of the config-server.
    pub relations: Vec<ShardRelation>,
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
    #[serde(default = "default_rounds")]
    pub removal_rounds: u32,
    /// Units of the local replica set. The first is primary.
    pub members: Vec<ClusterMember>,
}

fn default_rounds() -> u32 {
    1
}

impl SimScenario {
    pub fn build(&self) -> SimCluster {
        let names: Vec<&str> = self.shards.iter().map(String::as_str).collect();
        let hosts: Vec<&str> = self.members.iter().map(|m| m.host.as_str()).collect();
        let mut cluster = SimCluster::sharded(&names)
            .with_members(&hosts)
            .with_removal_rounds(self.removal_rounds);
        for db in &self.databases {
            cluster = cluster.with_database(&db.name, &db.primary);
        }
        cluster
    }
}
