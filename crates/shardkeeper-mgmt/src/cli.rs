use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::CoordinatorConfig;
use crate::peer::InMemoryPeerStore;
use crate::reconciler::{plan_shards, PassVerdict, ShardSetReconciler};
use crate::retry::RecordingSleeper;
use crate::role::{Authority, ClusterRole, ConfigServerRole, Mutation};
use crate::sim::SimScenario;
use crate::status::StatusReporter;
use crate::topology::{desired_shards, ClusterMember, ReplicaSetStatus, ShardList, ShardRelation};
use crate::upgrade::{order_members, Collaborators, UpgradeCoordinator};

#[derive(Parser)]
#[command(name = "sk-mgmt")]
#[command(about = "Shard membership and rolling upgrade coordinator", long_about = None)]
pub struct Cli {
    /// Coordinator configuration (.toml or .json).
    #[arg(short, long, env = "SK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Diff related shards against the router's shard list.
    ShardPlan {
        /// JSON list of shard relations.
        #[arg(long)]
        relations: PathBuf,
        /// JSON reply of the list-shards command.
        #[arg(long)]
        live: PathBuf,
        /// Relation being torn down.
        #[arg(long)]
        exclude: Option<u32>,
    },
    /// Print the upgrade order of a replica set.
    UpgradeOrder {
        /// JSON list of members ({"id", "host"}).
        #[arg(long)]
        members: PathBuf,
        /// JSON reply of the replica-set status command.
        #[arg(long)]
        status: PathBuf,
    },
    /// Run a reconciliation pass and an upgrade campaign against a simulated cluster.
    Simulate {
        scenario: PathBuf,
        #[arg(long)]
        exclude: Option<u32>,
    },
    ShowConfig,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    verdict: String,
    shards: BTreeSet<String>,
    upgraded: Vec<u32>,
    upgrade_error: Option<String>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

impl Cli {
    pub fn load_config(&self) -> Result<CoordinatorConfig> {
        match &self.config {
            Some(path) => CoordinatorConfig::from_file(path),
            None => Ok(CoordinatorConfig::default()),
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match &self.command {
            Command::ShardPlan {
                relations,
                live,
                exclude,
            } => self.shard_plan(&config, relations, live, *exclude),
            Command::UpgradeOrder { members, status } => self.upgrade_order(members, status),
            Command::Simulate { scenario, exclude } => self.simulate(&config, scenario, *exclude).await,
            Command::ShowConfig => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }

    fn shard_plan(
        &self,
        config: &CoordinatorConfig,
        relations: &Path,
        live: &Path,
        exclude: Option<u32>,
    ) -> Result<()> {
        let relations: Vec<ShardRelation> = read_json(relations)?;
        let live: ShardList = read_json(live)?;
        let desired = desired_shards(&relations, exclude, config.shard_port);
        let plan = plan_shards(&desired, &live.names());
        println!("{}", serde_json::to_string_pretty(&plan)?);
        Ok(())
    }

    fn upgrade_order(&self, members: &Path, status: &Path) -> Result<()> {
        let members: Vec<ClusterMember> = read_json(members)?;
        let status: ReplicaSetStatus = read_json(status)?;
        let primary = status.primary_host();
        if primary.is_none() {
            tracing::warn!("No primary in replica-set status, order is by member id only");
        }
        let order = order_members(&members, primary);
        println!("{}", serde_json::to_string(&order)?);
        Ok(())
    }

    async fn simulate(
        &self,
        config: &CoordinatorConfig,
        scenario: &Path,
        exclude: Option<u32>,
    ) -> Result<()> {
        let scenario: SimScenario = read_json(scenario)?;
        let cluster = scenario.build();
        let status = StatusReporter::default();
        let sleeper = RecordingSleeper::new();

        let config_server = ConfigServerRole {
            router_hosts: config.router_hosts.iter().cloned().collect(),
            shard_port: config.shard_port,
        };
        let reconciler = ShardSetReconciler::new(&config_server, &cluster, &status, Authority::Leader);
        let verdict = match reconciler.reconcile(&scenario.relations, exclude).await {
            PassVerdict::Done(changes) => format!("done: {}", serde_json::to_string(&changes)?),
            other => format!("{:?}", other),
        };

        let peers = InMemoryPeerStore::new();
        let role = ClusterRole::Replication;
        let deps = Collaborators {
            factory: &cluster,
            services: &cluster,
            peers: &peers,
            status: &status,
        };
        let mut coordinator = UpgradeCoordinator::new(
            &role,
            scenario.members.clone(),
            deps,
            Authority::Leader,
            config.upgrade_settings(),
        )
        .with_sleeper(&sleeper);
        let (upgraded, upgrade_error) = match coordinator.run_campaign().await {
            Ok(Mutation::Applied(ids)) => (ids, None),
            Ok(Mutation::Unauthorized) => (Vec::new(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let report = SimulationReport {
            verdict,
            shards: cluster.shard_names(),
            upgraded,
            upgrade_error,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
