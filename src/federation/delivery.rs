//! Activity delivery
//!
//! Outbound activities travel through three queues:
//! - pending: waits until the recipient's inbox is known
//! - refresh: fetches the recipient's actor document to learn its inbox
//! - delivery: signs and POSTs the activity to the inbox
//!
//! [`FederationRuntime`] owns the worker pools of all three, plus the
//! periodic refresh of federated user profiles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::client::ActivityPubClient;
use super::keys::KeyProvider;
use super::processor::ActivityProcessor;
use super::queue::{QueueHandler, UniqueQueue};
use crate::config::QueueConfig;
use crate::data::{FederatedUserFollower, QueueStore, User, UserDirectory};
use crate::error::{FederationError, Result};
use crate::metrics::ACTIVITYPUB_ACTIVITIES_SENT;

pub const PENDING_QUEUE: &str = "activitypub_pending_delivery";
pub const REFRESH_QUEUE: &str = "activitypub_user_data_refresh";
pub const DELIVERY_QUEUE: &str = "activitypub_inbox_delivery";

/// Activity waiting for its recipient's inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub doer_id: i64,
    pub federated_user_id: i64,
    /// Serialized activity
    pub payload: String,
}

/// Request to learn the inbox of a federated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshItem {
    pub doer_id: i64,
    pub federated_user_id: i64,
}

/// Activity ready to be POSTed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryItem {
    pub doer_id: i64,
    pub inbox_url: String,
    pub payload: String,
}

/// Handles to the three delivery queues
#[derive(Clone)]
pub struct DeliveryQueues {
    pub pending: UniqueQueue<PendingItem>,
    pub refresh: UniqueQueue<RefreshItem>,
    pub delivery: UniqueQueue<DeliveryItem>,
}

impl DeliveryQueues {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            pending: UniqueQueue::new(PENDING_QUEUE, store.clone()),
            refresh: UniqueQueue::new(REFRESH_QUEUE, store.clone()),
            delivery: UniqueQueue::new(DELIVERY_QUEUE, store),
        }
    }

    /// Queue `payload` for every follower.
    ///
    /// A failed push is logged and does not stop the others.
    /// Returns the number of followers queued.
    pub async fn push_to_followers(
        &self,
        doer_id: i64,
        followers: &[FederatedUserFollower],
        payload: &str,
    ) -> usize {
        let mut queued = 0;
        for follower in followers {
            let item = PendingItem {
                doer_id,
                federated_user_id: follower.federated_user_id,
                payload: payload.to_string(),
            };
            match self.pending.push(&item).await {
                Ok(_) => queued += 1,
                Err(e) => tracing::warn!(
                    doer_id,
                    federated_user_id = follower.federated_user_id,
                    error = %e,
                    "Failed to queue activity for follower"
                ),
            }
        }
        queued
    }
}

struct PendingHandler {
    users: Arc<dyn UserDirectory>,
    queues: DeliveryQueues,
}

#[async_trait]
impl QueueHandler<PendingItem> for PendingHandler {
    async fn handle(&self, item: &PendingItem) -> Result<()> {
        let Some(federated_user) = self.users.get_federated_user(item.federated_user_id).await?
        else {
            tracing::warn!(
                federated_user_id = item.federated_user_id,
                "Dropping activity for unknown federated user"
            );
            return Ok(());
        };

        let Some(inbox) = federated_user.inbox() else {
            self.queues
                .refresh
                .push(&RefreshItem {
                    doer_id: item.doer_id,
                    federated_user_id: item.federated_user_id,
                })
                .await?;
            tracing::debug!(
                federated_user_id = item.federated_user_id,
                "No inbox known yet, refresh requested"
            );
            return Err(FederationError::DeliveryFailed(format!(
                "no inbox known for federated user {}",
                item.federated_user_id
            )));
        };

        self.queues
            .delivery
            .push(&DeliveryItem {
                doer_id: item.doer_id,
                inbox_url: inbox.to_string(),
                payload: item.payload.clone(),
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ActorWithInbox {
    #[serde(default)]
    inbox: Option<String>,
}

struct RefreshHandler {
    users: Arc<dyn UserDirectory>,
    client: Arc<ActivityPubClient>,
    keys: Arc<dyn KeyProvider>,
}

#[async_trait]
impl QueueHandler<RefreshItem> for RefreshHandler {
    async fn handle(&self, item: &RefreshItem) -> Result<()> {
        let doer = load_user(self.users.as_ref(), item.doer_id).await?;
        let federated_user = self
            .users
            .get_federated_user(item.federated_user_id)
            .await?
            .ok_or(FederationError::NotFound)?;
        let shadow = load_user(self.users.as_ref(), federated_user.user_id).await?;

        let actor_uri = shadow
            .normalized_federated_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                FederationError::ValidationFailed(format!(
                    "federated user {} (user {}) has no actor uri",
                    federated_user.id, shadow.id
                ))
            })?;

        let signer = self.keys.user_signer(&doer).await?;
        let actor: ActorWithInbox = self.client.get_json(actor_uri, &signer).await?;
        let inbox = actor
            .inbox
            .as_deref()
            .map(str::trim)
            .filter(|inbox| !inbox.is_empty())
            .ok_or_else(|| {
                FederationError::RemoteUnavailable(format!("{} publishes no inbox", actor_uri))
            })?;

        tracing::info!(federated_user_id = federated_user.id, %inbox, "Refreshed inbox");
        self.users
            .set_federated_user_inbox(federated_user.id, inbox)
            .await
    }
}

struct DeliveryHandler {
    users: Arc<dyn UserDirectory>,
    client: Arc<ActivityPubClient>,
    keys: Arc<dyn KeyProvider>,
}

#[async_trait]
impl QueueHandler<DeliveryItem> for DeliveryHandler {
    async fn handle(&self, item: &DeliveryItem) -> Result<()> {
        let doer = load_user(self.users.as_ref(), item.doer_id).await?;
        let signer = self.keys.user_signer(&doer).await?;

        let response = self
            .client
            .post(&item.inbox_url, item.payload.as_bytes().to_vec(), &signer)
            .await?;

        if response.status.as_u16() >= 400 {
            tracing::warn!(
                inbox = %item.inbox_url,
                status = response.status.as_u16(),
                body = %response.body_snippet,
                "Delivery rejected"
            );
            return Err(FederationError::DeliveryFailed(format!(
                "{} answered {}",
                item.inbox_url, response.status
            )));
        }

        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[activity_type(&item.payload)])
            .inc();
        tracing::debug!(inbox = %item.inbox_url, status = response.status.as_u16(), "Activity delivered");
        Ok(())
    }
}

async fn load_user(users: &dyn UserDirectory, id: i64) -> Result<User> {
    users.get_user(id).await?.ok_or(FederationError::NotFound)
}

fn activity_type(payload: &str) -> &'static str {
    let kind = serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(String::from));
    match kind.as_deref() {
        Some("Like") => "Like",
        Some("Follow") => "Follow",
        Some("Undo") => "Undo",
        Some("Accept") => "Accept",
        Some("Create") => "Create",
        _ => "Other",
    }
}

/// Worker pools of the three delivery queues
pub struct FederationRuntime {
    queues: DeliveryQueues,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl FederationRuntime {
    pub fn start(
        queues: DeliveryQueues,
        users: Arc<dyn UserDirectory>,
        client: Arc<ActivityPubClient>,
        keys: Arc<dyn KeyProvider>,
        settings: &QueueConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut workers = queues.pending.start_workers(
            settings.pending_workers,
            Arc::new(PendingHandler {
                users: users.clone(),
                queues: queues.clone(),
            }),
            settings.clone(),
            shutdown_rx.clone(),
        );
        workers.extend(queues.refresh.start_workers(
            settings.refresh_workers,
            Arc::new(RefreshHandler {
                users: users.clone(),
                client: client.clone(),
                keys: keys.clone(),
            }),
            settings.clone(),
            shutdown_rx.clone(),
        ));
        workers.extend(queues.delivery.start_workers(
            settings.delivery_workers,
            Arc::new(DeliveryHandler {
                users,
                client,
                keys,
            }),
            settings.clone(),
            shutdown_rx,
        ));

        tracing::info!(workers = workers.len(), "Federation runtime started");
        Self {
            queues,
            shutdown,
            workers,
        }
    }

    pub fn queues(&self) -> &DeliveryQueues {
        &self.queues
    }

    /// Re-fetch federated user profiles every `every`, starting one period
    /// after the call.
    pub fn schedule_profile_refresh(
        &mut self,
        processor: Arc<ActivityProcessor>,
        every: Duration,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        self.workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = processor.refresh_federated_user_profiles().await {
                            tracing::warn!(error = %e, "Profile refresh failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
        tracing::info!(every_secs = every.as_secs(), "Profile refresh scheduled");
    }

    /// Stop all workers and wait for them; unprocessed items stay persisted.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        tracing::info!("Federation runtime stopped");
    }
}
