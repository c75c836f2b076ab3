//! Sharing of internal credentials between the config-server and its shards.
//!
//! The config-server leader publishes the operator password, the internal
//! keyfile and its router hosts to every related shard. Shards install the
//! keyfile on each unit and, on their leader, rotate the operator password.

use std::collections::BTreeMap;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::gate::{shard_gate, GateDecision, HookContext};
use crate::peer::{encode_hosts, keys, PeerData, PeerStore, RelationData};
use crate::retry::{RetryConfig, RetryExecutor, Sleeper, TokioSleeper};
use crate::role::{Authority, ConfigServerRole, Mutation, ShardRole};
use crate::service::ServiceControl;
use crate::session::{SessionFactory, SessionTarget};
use crate::status::{StatusReporter, UnitStatus};
use crate::topology::{ClusterMember, RelationId};

static TOKIO_SLEEPER: TokioSleeper = TokioSleeper;

/// Config-server side.
pub struct CredentialPublisher<'a> {
    config_server: &'a ConfigServerRole,
    relations: &'a dyn RelationData,
    peers: &'a dyn PeerStore,
    authority: Authority,
}

impl<'a> CredentialPublisher<'a> {
    pub fn new(
        config_server: &'a ConfigServerRole,
        relations: &'a dyn RelationData,
        peers: &'a dyn PeerStore,
        authority: Authority,
    ) -> Self {
        Self {
            config_server,
            relations,
            peers,
            authority,
        }
    }

    /// Everything a newly joined shard needs from the config-server.
    pub async fn relation_payload(&self) -> Result<Mutation<BTreeMap<String, String>>> {
        if !self.authority.is_leader() {
            return Ok(Mutation::Unauthorized);
        }

        let peer_data = PeerData::new(self.peers);
        let mut payload = BTreeMap::new();
        for key in [keys::OPERATOR_PASSWORD, keys::KEYFILE] {
            // Relation data carries plain strings; the secret moves in without a copy.
            if let Some(secret) = peer_data.secret(key).await? {
                payload.insert(key.to_string(), secret);
            }
        }
        payload.insert(
            keys::HOSTS.to_string(),
            encode_hosts(&self.config_server.router_hosts)?,
        );
        Ok(Mutation::Applied(payload))
    }

    /// Writes the payload to a shard relation that just joined.
    pub async fn publish_to(&self, relation_id: RelationId) -> Result<Mutation<()>> {
        match self.relation_payload().await? {
            Mutation::Applied(payload) => {
                self.relations.update(relation_id, payload).await?;
                Ok(Mutation::Applied(()))
            }
            Mutation::Unauthorized => Ok(Mutation::Unauthorized),
        }
    }

    /// Republishes the router hosts to every shard.
    pub async fn update_router_hosts(&self) -> Result<Mutation<()>> {
        let hosts = encode_hosts(&self.config_server.router_hosts)?;
        self.update_credentials(keys::HOSTS, &hosts).await
    }

    /// Sends one key/value pair to every shard.
    pub async fn update_credentials(&self, key: &str, value: &str) -> Result<Mutation<()>> {
        if !self.authority.is_leader() {
            return Ok(Mutation::Unauthorized);
        }
        for relation_id in self.relations.relation_ids().await? {
            let data = BTreeMap::from([(key.to_string(), value.to_string())]);
            self.relations.update(relation_id, data).await?;
        }
        Ok(Mutation::Applied(()))
    }
}

/// Shard side, running on one unit of the shard.
pub struct CredentialSync<'a> {
    shard: &'a ShardRole,
    unit: &'a ClusterMember,
    factory: &'a dyn SessionFactory,
    services: &'a dyn ServiceControl,
    peers: &'a dyn PeerStore,
    status: &'a StatusReporter,
    authority: Authority,
    operator_username: String,
    password_retry: RetryConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> CredentialSync<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: &'a ShardRole,
        unit: &'a ClusterMember,
        factory: &'a dyn SessionFactory,
        services: &'a dyn ServiceControl,
        peers: &'a dyn PeerStore,
        status: &'a StatusReporter,
        authority: Authority,
        operator_username: impl Into<String>,
    ) -> Self {
        Self {
            shard,
            unit,
            factory,
            services,
            peers,
            status,
            authority,
            operator_username: operator_username.into(),
            password_retry: RetryConfig::new(20, std::time::Duration::from_secs(3)),
            sleeper: &TOKIO_SLEEPER,
        }
    }

    pub fn with_password_retry(mut self, retry: RetryConfig) -> Self {
        self.password_retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Installs a new keyfile on this unit and restarts the database.
    ///
    /// The comparison is against the file on disk, which may lag the
    /// application secret. Returns whether anything changed.
    pub async fn update_keyfile(&self, contents: Option<&str>) -> Result<bool> {
        let contents = match contents {
            Some(c) if !c.is_empty() => Zeroizing::new(c.to_string()),
            _ => return Ok(false),
        };
        let current = self.services.read_keyfile(self.unit).await?.map(Zeroizing::new);
        if current.as_deref() == Some(&*contents) {
            return Ok(false);
        }

        self.services.write_keyfile(self.unit, &contents).await?;
        self.services.restart(self.unit).await?;

        if self.authority.is_leader() {
            PeerData::new(self.peers).set_secret(keys::KEYFILE, &contents).await?;
        }
        Ok(true)
    }

    /// Rotates the operator password on the leader.
    ///
    /// Usually follows a keyfile change, so members may still be catching up;
    /// the command is retried over the configured window.
    pub async fn update_operator_password(&self, new_password: Option<&str>) -> Result<bool> {
        let new_password = match new_password {
            Some(p) if !p.is_empty() => Zeroizing::new(p.to_string()),
            _ => return Ok(false),
        };
        if !self.authority.is_leader() {
            return Ok(false);
        }

        let peer_data = PeerData::new(self.peers);
        let current = peer_data.secret(keys::OPERATOR_PASSWORD).await?.map(Zeroizing::new);
        if current.as_deref() == Some(&*new_password) {
            return Ok(false);
        }

        let factory = self.factory;
        let username = self.operator_username.as_str();
        let password: &str = &new_password;
        RetryExecutor::new(self.password_retry, self.sleeper)
            .execute(|_| async move {
                let session = factory.connect(&SessionTarget::Local).await?;
                session
                    .set_user_password(username, password)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed changing the password: {}", e);
                        e
                    })
            })
            .await?;

        peer_data
            .set_secret(keys::OPERATOR_PASSWORD, &new_password)
            .await?;
        Ok(true)
    }

    /// Applies credentials the config-server published for this shard.
    ///
    /// Returns [`GateDecision::Proceed`] once the data was applied.
    pub async fn on_config_server_data(
        &self,
        ctx: &HookContext,
        data: &BTreeMap<String, String>,
    ) -> Result<GateDecision> {
        let decision = shard_gate(ctx);
        match &decision {
            GateDecision::Proceed => {}
            GateDecision::Blocked(reason) => {
                self.status.set(UnitStatus::Blocked(reason.clone()));
                return Ok(decision);
            }
            _ => return Ok(decision),
        }

        self.update_keyfile(data.get(keys::KEYFILE).map(String::as_str))
            .await?;
        self.status
            .set(UnitStatus::Maintenance("Adding shard to config-server".to_string()));

        if !self.authority.is_leader() {
            return Ok(GateDecision::Proceed);
        }

        match self
            .update_operator_password(data.get(keys::OPERATOR_PASSWORD).map(String::as_str))
            .await
        {
            Ok(_) => Ok(GateDecision::Proceed),
            Err(e) => {
                tracing::error!(
                    "Shard {} could not be added to config server, failed to set operator password: {}",
                    self.shard.shard_name,
                    e
                );
                self.status
                    .set(UnitStatus::Blocked("Shard not added to config-server".to_string()));
                Err(e)
            }
        }
    }
}
