//! Federation host registry
//!
//! Remembers every remote forge this instance has talked to, keyed by its
//! lower-cased host name, together with its software kind and the clock
//! used to order Like activities.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::actor_id::{ActorId, SourceType};
use super::client::ActivityPubClient;
use super::keys::KeyProvider;
use super::nodeinfo::{NodeInfoLinks, parse_software_kind};
use crate::data::{FederationHost, HostStore};
use crate::error::{FederationError, Result};

const MAX_FQDN_LEN: usize = 255;

/// Activities dated further ahead than this many minutes are refused.
pub const MAX_FUTURE_SKEW_MINUTES: i64 = 10;

pub struct FederationHostRegistry {
    hosts: Arc<dyn HostStore>,
    client: Arc<ActivityPubClient>,
    keys: Arc<dyn KeyProvider>,
}

impl FederationHostRegistry {
    pub fn new(
        hosts: Arc<dyn HostStore>,
        client: Arc<ActivityPubClient>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            hosts,
            client,
            keys,
        }
    }

    /// Known host of `actor_id`, discovering it through NodeInfo on first contact.
    pub async fn resolve_host(&self, actor_id: &ActorId) -> Result<FederationHost> {
        let fqdn = actor_id.host().to_lowercase();
        if fqdn.is_empty() || fqdn.len() > MAX_FQDN_LEN {
            return Err(FederationError::InvalidIdentity(format!(
                "host name {:?} has an invalid length",
                fqdn
            )));
        }

        if let Some(host) = self.hosts.get_federation_host_by_fqdn(&fqdn).await? {
            return Ok(host);
        }

        let kind = self.discover_software(actor_id).await?;
        tracing::info!(host = %fqdn, software = %kind, "Registering federation host");

        self.hosts
            .insert_federation_host(&fqdn, kind.as_str(), DateTime::<Utc>::default())
            .await
    }

    /// Known host without discovery.
    pub async fn get_host_by_fqdn(&self, fqdn: &str) -> Result<Option<FederationHost>> {
        self.hosts.get_federation_host_by_fqdn(fqdn).await
    }

    /// Advance the ordering clock of `host`.
    pub async fn record_activity(
        &self,
        host: &FederationHost,
        latest_activity: DateTime<Utc>,
    ) -> Result<()> {
        validate_latest_activity(latest_activity, Utc::now())?;
        self.hosts
            .update_federation_host_latest_activity(host.id, latest_activity)
            .await
    }

    async fn discover_software(&self, actor_id: &ActorId) -> Result<SourceType> {
        let signer = self.keys.instance_signer().await?;

        let well_known = format!("{}/.well-known/nodeinfo", actor_id.origin());
        let body = self.client.get(&well_known, &signer).await?;
        let href = NodeInfoLinks::parse_href(&body)?;

        let body = self.client.get(&href, &signer).await?;
        parse_software_kind(&body)
    }
}

/// Software kind recorded for `host`.
pub fn host_source(host: &FederationHost) -> Result<SourceType> {
    host.software_kind.parse().map_err(|_| {
        FederationError::RemoteUnavailable(format!(
            "host {} has unsupported software {}",
            host.host_fqdn, host.software_kind
        ))
    })
}

/// Refuse timestamps too far in the future.
pub fn validate_latest_activity(latest: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if latest > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
        return Err(FederationError::ValidationFailed(format!(
            "activity time {} lies too far in the future",
            latest.to_rfc3339()
        )));
    }
    Ok(())
}
