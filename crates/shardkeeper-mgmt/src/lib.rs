//! Shard membership and rolling upgrade coordination for a sharded database cluster.
//!
//! The config-server side keeps the router's shard list in line with the
//! shards related to it ([`reconciler`]) and shares credentials with them
//! ([`credentials`]). Shards track their own removal ([`drain`]). Any
//! replica set can be upgraded in place one member at a time, primary last
//! ([`upgrade`]), gated by an end-to-end read/write check ([`probe`]).

pub mod cli;
pub mod config;
pub mod credentials;
pub mod drain;
pub mod error;
pub mod gate;
pub mod health;
pub mod peer;
pub mod probe;
pub mod reconciler;
pub mod retry;
pub mod role;
pub mod router;
pub mod service;
pub mod session;
pub mod sim;
pub mod status;
pub mod topology;
pub mod upgrade;

pub use config::CoordinatorConfig;
pub use drain::{DrainOutcome, DrainWatcher};
pub use error::{CoordError, ErrorClass, Result};
pub use probe::ReadWriteProbe;
pub use reconciler::{PassVerdict, ShardSetReconciler};
pub use role::{Authority, ClusterRole, ConfigServerRole, Mutation, Role, ShardRole};
pub use session::{AdminSession, SessionFactory, SessionTarget};
pub use upgrade::{UpgradeCoordinator, UpgradeOutcome};
