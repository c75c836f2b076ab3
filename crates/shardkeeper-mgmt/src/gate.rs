//! Checks run before any sharding operation is attempted.

use crate::role::{Authority, Role};

/// What the dispatcher should do with the triggering event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Nothing to do on this unit; drop the event.
    Skip(String),
    /// Re-deliver the event later.
    Defer(String),
    /// Misconfiguration an operator must fix.
    Blocked(String),
}

impl GateDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, GateDecision::Proceed)
    }
}

/// Facts about the unit at the time an event is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext {
    pub role: Role,
    pub authority: Authority,
    pub db_initialised: bool,
    pub backup_in_progress: bool,
}

const REPLICATION_UNSUPPORTED: &str = "role replication does not support sharding";

/// Gate for config-server work (sharing secrets, adding and removing shards).
///
/// Units that will never act on the event skip it before initialisation is
/// considered; only the config-server leader waits for the database.
pub fn config_server_gate(ctx: &HookContext) -> GateDecision {
    if ctx.role == Role::Replication {
        tracing::error!("Sharding interface not supported with config role=replication.");
        return GateDecision::Blocked(REPLICATION_UNSUPPORTED.to_string());
    }

    if ctx.role != Role::ConfigServer {
        tracing::info!("Skipping, shard membership is only managed by the config-server");
        return GateDecision::Skip(format!("role {} does not manage shards", ctx.role));
    }

    if !ctx.authority.is_leader() {
        return GateDecision::Skip("not the leader".to_string());
    }

    if !ctx.db_initialised {
        return GateDecision::Defer("db is not initialised".to_string());
    }

    GateDecision::Proceed
}

/// Gate for membership changes; also waits out backups and restores.
pub fn membership_change_gate(ctx: &HookContext) -> GateDecision {
    let decision = config_server_gate(ctx);
    if !decision.proceeds() {
        return decision;
    }

    if ctx.backup_in_progress {
        return GateDecision::Defer(
            "Cannot add/remove shards while a backup/restore is in progress.".to_string(),
        );
    }

    GateDecision::Proceed
}

/// Gate for shard-side work (credentials from the config-server, draining).
pub fn shard_gate(ctx: &HookContext) -> GateDecision {
    if ctx.role == Role::Replication {
        tracing::error!("sharding interface not supported with config role=replication");
        return GateDecision::Blocked(REPLICATION_UNSUPPORTED.to_string());
    }

    if ctx.role != Role::Shard {
        tracing::info!("Skipping, event is only handled by shards");
        return GateDecision::Skip(format!("role {} is not a shard", ctx.role));
    }

    if !ctx.db_initialised {
        return GateDecision::Defer("db is not initialised".to_string());
    }

    GateDecision::Proceed
}
