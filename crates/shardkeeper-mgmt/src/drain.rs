//! Shard-side tracking of removal from the cluster.
//!
//! Once the config-server has issued a remove command for this shard, the
//! router moves its chunks away. The shard polls the router until it is no
//! longer listed and records the result in peer data for its other units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::peer::{PeerData, PeerStore};
use crate::retry::{Sleeper, TokioSleeper};
use crate::role::{Authority, ShardRole};
use crate::router::Router;
use crate::session::SessionFactory;
use crate::status::{StatusReporter, UnitStatus};

static TOKIO_SLEEPER: TokioSleeper = TokioSleeper;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainOutcome {
    Drained,
    Cancelled,
}

pub struct DrainWatcher<'a> {
    shard: &'a ShardRole,
    factory: &'a dyn SessionFactory,
    peers: &'a dyn PeerStore,
    status: &'a StatusReporter,
    authority: Authority,
    sleeper: &'a dyn Sleeper,
    poll_interval: Duration,
}

impl<'a> DrainWatcher<'a> {
    pub fn new(
        shard: &'a ShardRole,
        factory: &'a dyn SessionFactory,
        peers: &'a dyn PeerStore,
        status: &'a StatusReporter,
        authority: Authority,
    ) -> Self {
        Self {
            shard,
            factory,
            peers,
            status,
            authority,
            sleeper: &TOKIO_SLEEPER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Whether this shard has left the cluster.
    ///
    /// Non-leaders read the flag the leader last recorded. The leader asks the
    /// router: no longer listed means drained, listed and draining means not
    /// yet, listed without the draining flag is [`CoordError::ShardNotPlannedForRemoval`].
    pub async fn is_drained(&self, router_hosts: &BTreeSet<String>) -> Result<bool> {
        let peer_data = PeerData::new(self.peers);
        if !self.authority.is_leader() {
            return peer_data.drained().await;
        }

        let state = {
            let router = Router::open(self.factory, router_hosts).await?;
            router.drain_state(&self.shard.shard_name).await?
        };

        let drained = match state {
            None => {
                tracing::info!(
                    "Shard {} is not in the cluster, it has been removed",
                    self.shard.shard_name
                );
                true
            }
            Some(s) if s.draining == Some(true) => false,
            Some(_) => {
                return Err(CoordError::ShardNotPlannedForRemoval(format!(
                    "Shard {} has not been marked for removal",
                    self.shard.shard_name
                )))
            }
        };

        peer_data.set_drained(drained).await?;
        Ok(drained)
    }

    /// Polls until the shard is drained or `cancel` fires.
    ///
    /// Waits one poll interval before every check. There is no timeout;
    /// command failures mark the unit blocked and polling continues.
    pub async fn wait_until_drained(
        &self,
        router_hosts: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome> {
        self.status
            .set(UnitStatus::Maintenance("Draining shard from cluster".to_string()));

        let mut polls: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Stopped waiting for shard {} to drain", self.shard.shard_name);
                    return Ok(DrainOutcome::Cancelled);
                }
                _ = self.sleeper.sleep(self.poll_interval) => {}
            }
            polls += 1;

            match self.is_drained(router_hosts).await {
                Ok(true) => {
                    tracing::debug!("Shard is fully drained after {} polls.", polls);
                    break;
                }
                Ok(false) => {
                    tracing::debug!("Shard is still draining");
                    self.status
                        .set(UnitStatus::Maintenance("Draining shard from cluster".to_string()));
                }
                Err(CoordError::ShardNotPlannedForRemoval(_)) => {
                    tracing::info!(
                        "Shard {} has not been identified for removal. Must wait for the cluster admin to remove it.",
                        self.shard.shard_name
                    );
                }
                Err(e) => {
                    tracing::error!("Error occurred while draining shard: {}", e);
                    self.status
                        .set(UnitStatus::Blocked("Failed to drain shard from cluster".to_string()));
                }
            }
        }

        self.status.set(UnitStatus::Active(
            "Shard drained from cluster, ready for removal".to_string(),
        ));
        Ok(DrainOutcome::Drained)
    }
}
