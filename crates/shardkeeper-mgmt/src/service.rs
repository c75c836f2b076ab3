use async_trait::async_trait;

use crate::error::Result;
use crate::topology::ClusterMember;

/// Host-level supervision of the database service on one member.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn stop(&self, member: &ClusterMember) -> Result<()>;

    /// Installs the database package at `version`; the service stays stopped.
    async fn install(&self, member: &ClusterMember, version: &str) -> Result<()>;

    async fn restart(&self, member: &ClusterMember) -> Result<()>;

    /// Keyfile currently on the member's disk, if any.
    async fn read_keyfile(&self, member: &ClusterMember) -> Result<Option<String>>;

    /// Replaces the internal-auth keyfile. Takes effect on the next restart.
    async fn write_keyfile(&self, member: &ClusterMember, contents: &str) -> Result<()>;
}
