//! Error types for shard membership and upgrade coordination.

use thiserror::Error;

/// Router error code returned when removing the final shard of a cluster.
pub const FORBIDDEN_REMOVAL_ERR_CODE: i32 = 20;

/// Errors raised while reconciling shards, watching drains or upgrading members.
#[derive(Debug, Error)]
pub enum CoordError {
    /// An administrative command failed on the router or a replica member.
    #[error("admin command `{command}` failed: {msg}")]
    AdminCommand {
        /// Command name as sent to the cluster.
        command: String,
        /// Server error code, when one was reported.
        code: Option<i32>,
        /// Error message from the server or the connection layer.
        msg: String,
    },

    /// The cluster is in a transient state; the operation should be retried later.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The removal target is the primary shard for at least one database.
    #[error("cannot remove primary shard: {0}")]
    RemovePrimaryShard(String),

    /// The router refused to remove the last remaining shard.
    #[error("cannot remove last shard: {0}")]
    RemoveLastShard(String),

    /// The shard is still a cluster member after a remove command.
    #[error("shard not drained: {0}")]
    NotDrained(String),

    /// The shard is listed but was never marked for removal.
    #[error("shard not planned for removal: {0}")]
    ShardNotPlannedForRemoval(String),

    /// Gate failure before or after an upgrade step.
    #[error("{message}: {cause}")]
    ClusterNotReady {
        /// Summary of the failed gate.
        message: String,
        /// What made the gate fail.
        cause: String,
        /// Suggested operator action, if any.
        resolution: Option<String>,
    },

    /// No different primary appeared after a step-down.
    #[error("failed to elect a new primary after stepping down {old_primary}")]
    FailedToElectNewPrimary {
        /// Address of the primary that stepped down.
        old_primary: String,
    },

    /// The host-level service supervisor failed.
    #[error("service error during {action}: {msg}")]
    Service {
        /// The supervisor action (stop, install, restart, ...).
        action: String,
        /// Error message.
        msg: String,
    },

    /// The upgrade campaign is halted until an operator recovers it.
    #[error("upgrade campaign halted: member {member_id} failed")]
    CampaignHalted {
        /// Member that failed.
        member_id: u32,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer data could not be encoded or decoded.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used to decide between retrying, blocking and halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later; nothing was lost.
    Retryable,
    /// Permanent until cluster state changes or an operator intervenes.
    SafetyViolation,
    /// Observed state disagrees with expectations; may be propagation delay.
    Inconsistent,
    /// Stops an upgrade campaign; manual rollback required.
    Fatal,
}

impl CoordError {
    /// Builds an [`CoordError::AdminCommand`] without an error code.
    pub fn admin(command: impl Into<String>, msg: impl Into<String>) -> Self {
        CoordError::AdminCommand {
            command: command.into(),
            code: None,
            msg: msg.into(),
        }
    }

    /// Builds an [`CoordError::AdminCommand`] carrying a server error code.
    pub fn admin_code(command: impl Into<String>, code: i32, msg: impl Into<String>) -> Self {
        CoordError::AdminCommand {
            command: command.into(),
            code: Some(code),
            msg: msg.into(),
        }
    }

    /// Server error code, if this is an admin command failure that carried one.
    pub fn code(&self) -> Option<i32> {
        match self {
            CoordError::AdminCommand { code, .. } => *code,
            _ => None,
        }
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordError::AdminCommand { .. }
            | CoordError::NotReady(_)
            | CoordError::NotDrained(_) => ErrorClass::Retryable,
            CoordError::RemovePrimaryShard(_) | CoordError::RemoveLastShard(_) => {
                ErrorClass::SafetyViolation
            }
            CoordError::ShardNotPlannedForRemoval(_) | CoordError::Serialization(_) => {
                ErrorClass::Inconsistent
            }
            CoordError::ClusterNotReady { .. }
            | CoordError::FailedToElectNewPrimary { .. }
            | CoordError::Service { .. }
            | CoordError::CampaignHalted { .. }
            | CoordError::Config(_) => ErrorClass::Fatal,
        }
    }

    /// True when the caller may simply re-invoke the operation later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Result alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;
