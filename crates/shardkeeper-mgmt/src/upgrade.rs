//! Rolling in-place upgrade of a replica set, one member at a time.
//!
//! The campaign order is persisted in peer data as the upgrade stack: the
//! front member is upgraded next and the primary is always last. A member
//! goes through stop, install, step-down when it holds the primary, restart
//! and a read/write check. Any failure halts the campaign until an operator
//! rolls back by hand and re-runs the pre-upgrade check. The halted member
//! is recorded in peer data so a fresh coordinator refuses to go on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{CoordError, Result};
use crate::health::check_cluster_health;
use crate::peer::{PeerData, PeerStore};
use crate::probe::ReadWriteProbe;
use crate::retry::{RetryConfig, RetryExecutor, Sleeper, TokioSleeper};
use crate::role::{Authority, ClusterRole, Mutation};
use crate::service::ServiceControl;
use crate::session::{SessionFactory, SessionTarget};
use crate::status::{StatusReporter, UnitStatus};
use crate::topology::ClusterMember;

static TOKIO_SLEEPER: TokioSleeper = TokioSleeper;

pub const ROLLBACK_INSTRUCTIONS: &str = "Unit failed to upgrade and requires manual rollback to previous stable version.
    1. Re-run the pre-upgrade check on the leader unit to enter 'recovery' state
    2. Reinstall the previously deployed version on the failed unit";

const PRE_UPGRADE_FAILED: &str = "Pre-upgrade check failed and cannot safely upgrade";
const POST_UPGRADE_FAILED: &str = "post-upgrade check failed and cannot safely upgrade";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignState {
    Idle,
    StackBuilt,
    MemberUpgrading(u32),
    MemberVerifying(u32),
    Failed(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeOutcome {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Result of handling a grant for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantResult {
    pub outcome: UpgradeOutcome,
    /// Member to grant next, when this unit advanced the stack.
    pub next: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeSettings {
    pub target_version: String,
    pub step_down: RetryConfig,
    pub post_upgrade: RetryConfig,
    pub probe_token_len: usize,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            target_version: String::new(),
            step_down: RetryConfig::new(30, Duration::from_secs(1)),
            post_upgrade: RetryConfig::new(20, Duration::from_secs(1)),
            probe_token_len: 16,
        }
    }
}

/// External systems the coordinator drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub factory: &'a dyn SessionFactory,
    pub services: &'a dyn ServiceControl,
    pub peers: &'a dyn PeerStore,
    pub status: &'a StatusReporter,
}

/// Upgrade order: non-primary members by ascending id, then the primary.
///
/// A member whose host matches `primary_host` is placed last exactly once.
pub fn order_members(members: &[ClusterMember], primary_host: Option<&str>) -> Vec<u32> {
    let mut primary = None;
    let mut others = BTreeSet::new();
    for member in members {
        if Some(member.host.as_str()) == primary_host {
            primary = Some(member.id);
        } else {
            others.insert(member.id);
        }
    }
    if let Some(id) = primary {
        others.remove(&id);
    }

    let mut order: Vec<u32> = others.into_iter().collect();
    order.extend(primary);
    order
}

pub struct UpgradeCoordinator<'a> {
    role: &'a ClusterRole,
    members: Vec<ClusterMember>,
    deps: Collaborators<'a>,
    authority: Authority,
    settings: UpgradeSettings,
    sleeper: &'a dyn Sleeper,
    state: CampaignState,
    outcomes: BTreeMap<u32, UpgradeOutcome>,
    last_failure: Option<CoordError>,
}

impl<'a> UpgradeCoordinator<'a> {
    pub fn new(
        role: &'a ClusterRole,
        members: Vec<ClusterMember>,
        deps: Collaborators<'a>,
        authority: Authority,
        settings: UpgradeSettings,
    ) -> Self {
        Self {
            role,
            members,
            deps,
            authority,
            settings,
            sleeper: &TOKIO_SLEEPER,
            state: CampaignState::Idle,
            outcomes: BTreeMap::new(),
            last_failure: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn outcome(&self, member_id: u32) -> Option<UpgradeOutcome> {
        self.outcomes.get(&member_id).copied()
    }

    /// The error that halted the campaign, if it is halted.
    pub fn last_failure(&self) -> Option<&CoordError> {
        self.last_failure.as_ref()
    }

    fn hosts(&self) -> BTreeSet<String> {
        self.members.iter().map(|m| m.host.clone()).collect()
    }

    fn probe(&self) -> ReadWriteProbe<'a> {
        ReadWriteProbe::new(self.deps.factory, self.settings.probe_token_len)
    }

    async fn current_primary(&self) -> Result<Option<String>> {
        let session = self.deps.factory.connect(&SessionTarget::Local).await?;
        session.current_primary().await
    }

    /// Member that halted the campaign, from this coordinator or a previous one.
    async fn halted_member(&self) -> Result<Option<u32>> {
        if let CampaignState::Failed(member_id) = self.state {
            return Ok(Some(member_id));
        }
        PeerData::new(self.deps.peers).upgrade_failed().await
    }

    /// Checks that an upgrade can start safely.
    ///
    /// Passing after a halted campaign enters recovery: the state returns to
    /// idle, and on the leader the persisted stack and halt marker are cleared.
    pub async fn preflight(&mut self) -> Result<()> {
        let not_ready = |cause: String, resolution: Option<&str>| CoordError::ClusterNotReady {
            message: PRE_UPGRADE_FAILED.to_string(),
            cause,
            resolution: resolution.map(str::to_string),
        };

        if !self.role.may_initiate_upgrade() {
            return Err(not_ready(
                "Cannot run pre-upgrade check on shards".to_string(),
                Some("Run this action on config-server."),
            ));
        }

        let halted = self.halted_member().await?;

        // A halted campaign's own blocked status does not count against recovery.
        let unit_status = match (halted, self.deps.status.current()) {
            (Some(_), UnitStatus::Blocked(_)) => UnitStatus::active(),
            (_, status) => status,
        };
        match check_cluster_health(self.role, self.deps.factory, &unit_status).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(not_ready(
                    "Cluster is not healthy".to_string(),
                    Some("Please check the unit status for information"),
                ))
            }
            Err(e) => return Err(not_ready(format!("Cluster is not healthy: {}", e), None)),
        }

        match self.probe().check(self.role, &self.hosts()).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(not_ready(
                    "Cluster cannot read/write - please check logs".to_string(),
                    None,
                ))
            }
            Err(e) => return Err(not_ready(format!("Cluster cannot read/write: {}", e), None)),
        }

        if let Some(member_id) = halted {
            tracing::info!("Pre-upgrade check passed after member {} failed, entering recovery", member_id);
            if self.authority.is_leader() {
                let peer_data = PeerData::new(self.deps.peers);
                peer_data.set_upgrade_stack(&[]).await?;
                peer_data.set_upgrade_failed(None).await?;
            }
            self.state = CampaignState::Idle;
            self.outcomes.clear();
            self.last_failure = None;
            self.deps.status.set(UnitStatus::active());
        }
        Ok(())
    }

    /// Computes the upgrade order from the live primary and persists it.
    ///
    /// Refused while a campaign is halted or a persisted stack is unfinished.
    pub async fn build_stack(&mut self) -> Result<Mutation<Vec<u32>>> {
        if !self.authority.is_leader() {
            return Ok(Mutation::Unauthorized);
        }
        if let Some(member_id) = self.halted_member().await? {
            return Err(CoordError::CampaignHalted { member_id });
        }
        if self.state != CampaignState::Idle {
            return Err(CoordError::NotReady(format!(
                "cannot build an upgrade stack while the campaign is {:?}",
                self.state
            )));
        }

        let peer_data = PeerData::new(self.deps.peers);
        let pending = peer_data.upgrade_stack().await?;
        if !pending.is_empty() {
            return Err(CoordError::NotReady(format!(
                "upgrade stack {:?} is still in progress",
                pending
            )));
        }

        let primary = self
            .current_primary()
            .await?
            .ok_or_else(|| CoordError::NotReady("no primary elected".to_string()))?;
        if !self.members.iter().any(|m| m.host == primary) {
            return Err(CoordError::NotReady(format!(
                "primary {} is not a known member",
                primary
            )));
        }
        let stack = order_members(&self.members, Some(&primary));
        tracing::info!("Upgrade stack built: {:?} (primary {} last)", stack, primary);

        peer_data.set_upgrade_stack(&stack).await?;
        self.outcomes = stack.iter().map(|id| (*id, UpgradeOutcome::Pending)).collect();
        self.state = CampaignState::StackBuilt;
        Ok(Mutation::Applied(stack))
    }

    pub async fn is_idle(&self) -> Result<bool> {
        Ok(PeerData::new(self.deps.peers).upgrade_stack().await?.is_empty())
    }

    /// Upgrades `member_id` if it is the next member in the stack.
    pub async fn advance_on_grant(&mut self, member_id: u32) -> Result<GrantResult> {
        if let Some(failed) = self.halted_member().await? {
            self.state = CampaignState::Failed(failed);
            return Err(CoordError::CampaignHalted { member_id: failed });
        }

        let stack = PeerData::new(self.deps.peers).upgrade_stack().await?;
        if stack.first() != Some(&member_id) {
            return Err(CoordError::NotReady(format!(
                "member {} is not next in the upgrade stack {:?}",
                member_id, stack
            )));
        }

        let outcome = self.upgrade_member(member_id).await?;
        let next = match outcome {
            UpgradeOutcome::Completed => self.on_member_completed(member_id).await?.applied().flatten(),
            _ => None,
        };
        Ok(GrantResult { outcome, next })
    }

    /// Runs every step for one member. Step failures halt the campaign and
    /// are reported as [`UpgradeOutcome::Failed`].
    pub async fn upgrade_member(&mut self, member_id: u32) -> Result<UpgradeOutcome> {
        let member = self
            .members
            .iter()
            .find(|m| m.id == member_id)
            .cloned()
            .ok_or_else(|| CoordError::NotReady(format!("unknown member {}", member_id)))?;

        // Nothing has been touched yet; a lookup failure leaves the campaign as it was.
        let was_primary = self.current_primary().await?.as_deref() == Some(member.host.as_str());

        self.state = CampaignState::MemberUpgrading(member_id);
        self.outcomes.insert(member_id, UpgradeOutcome::InProgress);
        self.deps.status.set(UnitStatus::Maintenance(format!(
            "upgrading member {} to {}",
            member_id, self.settings.target_version
        )));

        if let Err(e) = self.deps.services.stop(&member).await {
            tracing::error!("Unable to stop database service on member {}", member_id);
            return self.fail(member_id, e).await;
        }

        if let Err(e) = self
            .deps
            .services
            .install(&member, &self.settings.target_version)
            .await
        {
            tracing::error!("Unable to install version {}", self.settings.target_version);
            return self.fail(member_id, e).await;
        }

        if was_primary {
            tracing::debug!("Stepping down current primary, before upgrading service...");
            if let Err(e) = self.step_down_and_wait(&member.host).await {
                return self.fail(member_id, e).await;
            }
        }

        tracing::info!("member {} upgrading service...", member_id);
        if let Err(e) = self.deps.services.restart(&member).await {
            return self.fail(member_id, e).await;
        }

        self.state = CampaignState::MemberVerifying(member_id);
        tracing::debug!("Running post-upgrade check...");
        if let Err(e) = self.post_upgrade_check().await {
            tracing::error!("{}", e);
            return self.fail(member_id, e).await;
        }

        tracing::debug!("Marking member {} completed...", member_id);
        self.outcomes.insert(member_id, UpgradeOutcome::Completed);
        self.deps.status.set(UnitStatus::active());
        Ok(UpgradeOutcome::Completed)
    }

    /// Pops a completed member off the stack. Returns the next member, if any.
    pub async fn on_member_completed(&mut self, member_id: u32) -> Result<Mutation<Option<u32>>> {
        if !self.authority.is_leader() {
            return Ok(Mutation::Unauthorized);
        }

        let peer_data = PeerData::new(self.deps.peers);
        let mut stack = peer_data.upgrade_stack().await?;
        if stack.first() != Some(&member_id) {
            return Err(CoordError::NotReady(format!(
                "member {} is not at the front of the upgrade stack {:?}",
                member_id, stack
            )));
        }
        stack.remove(0);
        peer_data.set_upgrade_stack(&stack).await?;

        let next = stack.first().copied();
        self.state = match next {
            Some(_) => CampaignState::StackBuilt,
            None => {
                tracing::info!("Upgrade campaign to {} completed", self.settings.target_version);
                CampaignState::Idle
            }
        };
        Ok(Mutation::Applied(next))
    }

    /// Preflight, stack and every member in order. Stops at the first failure.
    pub async fn run_campaign(&mut self) -> Result<Mutation<Vec<u32>>> {
        self.preflight().await?;
        if self.build_stack().await?.applied().is_none() {
            return Ok(Mutation::Unauthorized);
        }

        let mut upgraded = Vec::new();
        let mut next = PeerData::new(self.deps.peers).upgrade_stack().await?.first().copied();
        while let Some(member_id) = next {
            let grant = self.advance_on_grant(member_id).await?;
            if grant.outcome != UpgradeOutcome::Completed {
                return Err(CoordError::CampaignHalted { member_id });
            }
            upgraded.push(member_id);
            next = grant.next;
        }
        Ok(Mutation::Applied(upgraded))
    }

    async fn step_down_and_wait(&self, old_primary: &str) -> Result<()> {
        {
            let session = self.deps.factory.connect(&SessionTarget::Local).await?;
            session.step_down_primary().await?;
        }

        let factory = self.deps.factory;
        RetryExecutor::new(self.settings.step_down, self.sleeper)
            .execute(|_| async move {
                let session = factory.connect(&SessionTarget::Local).await?;
                match session.current_primary().await? {
                    Some(new_primary) if new_primary != old_primary => {
                        tracing::info!("New primary elected: {}", new_primary);
                        Ok(())
                    }
                    _ => Err(CoordError::FailedToElectNewPrimary {
                        old_primary: old_primary.to_string(),
                    }),
                }
            })
            .await
    }

    async fn post_upgrade_check(&self) -> Result<()> {
        let probe = self.probe();
        let hosts = self.hosts();
        let role = self.role;
        RetryExecutor::new(self.settings.post_upgrade, self.sleeper)
            .execute(|_| {
                let probe = &probe;
                let hosts = &hosts;
                async move {
                    if probe.check(role, hosts).await? {
                        Ok(())
                    } else {
                        Err(CoordError::ClusterNotReady {
                            message: POST_UPGRADE_FAILED.to_string(),
                            cause: "Cluster cannot read/write".to_string(),
                            resolution: None,
                        })
                    }
                }
            })
            .await
    }

    /// Halts the campaign. The failing unit records the halt whatever its
    /// authority, so only recovery on the leader can lift it.
    async fn fail(&mut self, member_id: u32, err: CoordError) -> Result<UpgradeOutcome> {
        tracing::error!("Upgrade of member {} failed: {}", member_id, err);
        tracing::error!("{}", ROLLBACK_INSTRUCTIONS);
        self.state = CampaignState::Failed(member_id);
        self.outcomes.insert(member_id, UpgradeOutcome::Failed);
        self.last_failure = Some(err);
        self.deps.status.set(UnitStatus::Blocked(format!(
            "upgrade failed on member {}, manual rollback required",
            member_id
        )));
        PeerData::new(self.deps.peers)
            .set_upgrade_failed(Some(member_id))
            .await?;
        Ok(UpgradeOutcome::Failed)
    }
}
