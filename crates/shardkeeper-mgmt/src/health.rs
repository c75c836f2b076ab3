use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::role::ClusterRole;
use crate::session::{SessionFactory, SessionTarget};
use crate::status::UnitStatus;
use crate::topology::{MemberStatus, ReplicaSetStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Reachable but still syncing data.
    Degraded,
    Offline,
    Unknown,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Offline => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub host: String,
    pub status: HealthStatus,
}

impl MemberHealth {
    pub fn from_status(member: &MemberStatus) -> Self {
        let status = if !member.is_reachable() {
            HealthStatus::Offline
        } else if member.state.is_syncing() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            host: member.host().to_string(),
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub overall_status: HealthStatus,
    pub member_count: u32,
    pub healthy_members: u32,
    pub syncing_members: u32,
    pub offline_members: u32,
    /// Whether the local unit reported an active status.
    pub unit_active: bool,
    pub summary: String,
}

impl ClusterHealth {
    pub fn worst_status(members: &[MemberHealth]) -> HealthStatus {
        members
            .iter()
            .map(|m| m.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Healthy when no member is syncing, every member is reachable and the
    /// local unit is active.
    pub fn evaluate(status: &ReplicaSetStatus, unit_status: &UnitStatus) -> Self {
        let members: Vec<MemberHealth> = status.members.iter().map(MemberHealth::from_status).collect();
        let count = |s: HealthStatus| members.iter().filter(|m| m.status == s).count() as u32;

        let unit_active = unit_status.is_active();
        let mut overall_status = Self::worst_status(&members);
        if !unit_active && overall_status.is_ok() {
            overall_status = HealthStatus::Degraded;
        }

        let healthy_members = count(HealthStatus::Healthy);
        let summary = if unit_active {
            format!("{}/{} members healthy", healthy_members, members.len())
        } else {
            format!(
                "{}/{} members healthy, unit is {}",
                healthy_members,
                members.len(),
                unit_status
            )
        };

        Self {
            overall_status,
            member_count: members.len() as u32,
            healthy_members,
            syncing_members: count(HealthStatus::Degraded),
            offline_members: count(HealthStatus::Offline),
            unit_active,
            summary,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status.is_ok() && self.unit_active
    }
}

/// Queries the local replica set and evaluates it.
///
/// Shards cannot judge the whole cluster and always report unhealthy.
/// Config-servers check their own config replica set.
pub async fn check_cluster_health(
    role: &ClusterRole,
    factory: &dyn SessionFactory,
    unit_status: &UnitStatus,
) -> Result<bool> {
    if role.as_shard().is_some() {
        tracing::debug!("Cannot run full cluster health check on shards");
        return Ok(false);
    }

    let status = {
        let session = factory.connect(&SessionTarget::Local).await?;
        session.replica_set_status().await?
    };
    let health = ClusterHealth::evaluate(&status, unit_status);
    tracing::debug!("Cluster health: {:?} ({})", health.overall_status, health.summary);
    Ok(health.is_healthy())
}
