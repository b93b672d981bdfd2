//! Activity processing
//!
//! Applies decoded inbound activities to local state, and builds the
//! outbound activities local users send (Likes, Follows, Notes).
//!
//! Inbound handlers never write HTTP responses: they return an
//! [`InboxOutcome`] or a [`Rejection`] for the boundary to render.

use std::sync::Arc;

use axum::http::StatusCode;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::activity::{
    AcceptActivity, CreateActivity, FollowActivity, InboundActivity, LikeActivity, UndoActivity,
};
use super::actor_id::{ActorId, PersonId, RepositoryId, SourceType};
use super::builder::{self, UserAction};
use super::client::ActivityPubClient;
use super::delivery::{DeliveryItem, DeliveryQueues, PendingItem};
use super::host_registry::{FederationHostRegistry, host_source, validate_latest_activity};
use super::keys::KeyProvider;
use super::urls::{LocalUrls, inbox_of};
use crate::data::{
    FederatedUser, FederationHost, NewFollowingRepo, NewUser, NewUserActivity, RepoStore, User,
    UserDirectory, UserKind, UserProfile,
};
use crate::error::{FederationError, Rejection, Result};
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

const GENERATED_PASSWORD_LEN: usize = 32;
const PROFILE_REFRESH_PAGE_SIZE: i64 = 50;

/// Successful inbox results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// 204
    NoContent,
    /// 202 with `{"status":"Accepted"}`
    Accepted,
}

/// Collaborators of the [`ActivityProcessor`]
#[derive(Clone)]
pub struct ProcessorDeps {
    pub users: Arc<dyn UserDirectory>,
    pub repos: Arc<dyn RepoStore>,
    pub registry: Arc<FederationHostRegistry>,
    pub client: Arc<ActivityPubClient>,
    pub keys: Arc<dyn KeyProvider>,
    pub queues: DeliveryQueues,
    pub urls: LocalUrls,
}

/// Remote Person fields needed to create a shadow user
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePerson {
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct ActivityProcessor {
    deps: ProcessorDeps,
}

impl ActivityProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }

    pub fn urls(&self) -> &LocalUrls {
        &self.deps.urls
    }

    // =========================================================================
    // Inboxes
    // =========================================================================

    /// Process an activity delivered to a repository inbox.
    pub async fn process_repository_inbox(
        &self,
        repo_id: i64,
        activity: InboundActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        let kind = activity.kind();
        let result = match activity {
            InboundActivity::Like(like) => self.handle_like(repo_id, like).await,
            other => Err(Rejection::from_error(
                "Unsupported activity",
                FederationError::ValidationFailed(format!(
                    "{} is not accepted by repository inboxes",
                    other.kind()
                )),
            )),
        };
        record_received(kind, &result);
        result
    }

    /// Process an activity delivered to a person inbox.
    pub async fn process_person_inbox(
        &self,
        user_id: i64,
        activity: InboundActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        let kind = activity.kind();
        let result = async {
            let owner = self.local_user(user_id).await?;
            match activity {
                InboundActivity::Follow(follow) => self.handle_follow(&owner, follow).await,
                InboundActivity::Undo(undo) => self.handle_undo(&owner, undo).await,
                InboundActivity::Accept(accept) => self.handle_accept(&owner, accept).await,
                InboundActivity::Create(create) => self.handle_create(&owner, create).await,
                InboundActivity::Like(_) => Err(Rejection::from_error(
                    "Unsupported activity",
                    FederationError::ValidationFailed(
                        "Like is not accepted by person inboxes".to_string(),
                    ),
                )),
            }
        }
        .await;
        record_received(kind, &result);
        result
    }

    async fn local_user(&self, user_id: i64) -> std::result::Result<User, Rejection> {
        match self.deps.users.get_user(user_id).await {
            Ok(Some(user)) if !user.is_remote() => Ok(user),
            Ok(_) => Err(Rejection::from_error("User not found", FederationError::NotFound)),
            Err(e) => Err(Rejection::from_error("Failed to load user", e)),
        }
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    /// Star the repository on behalf of the remote actor.
    async fn handle_like(
        &self,
        repo_id: i64,
        like: LikeActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        let repo = match self.deps.repos.get_repository(repo_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                return Err(Rejection::from_error(
                    "Repository not found",
                    FederationError::NotFound,
                ));
            }
            Err(e) => return Err(Rejection::from_error("Failed to load repository", e)),
        };

        validate_latest_activity(like.start_time, Utc::now())
            .map_err(|e| Rejection::from_error("Invalid activity", e))?;

        let actor_id = ActorId::parse(&like.actor)
            .map_err(|e| Rejection::from_error("Invalid PersonID", e))?;
        let host = self
            .deps
            .registry
            .resolve_host(&actor_id)
            .await
            .map_err(|e| Rejection::from_error("Wrong FederationHost", e))?;

        if like.start_time <= host.latest_activity {
            return Err(Rejection::new(
                StatusCode::NOT_ACCEPTABLE,
                "Activity out of order.",
                FederationError::OutOfOrder(format!(
                    "Like at {} is not newer than {}",
                    like.start_time.to_rfc3339(),
                    host.latest_activity.to_rfc3339()
                )),
            ));
        }

        let person = host_source(&host)
            .and_then(|source| PersonId::parse(&like.actor, source.as_str()))
            .map_err(|e| Rejection::from_error("Invalid PersonID", e))?;
        tracing::debug!(actor = %like.actor, "Like actor accepted");

        let object = RepositoryId::parse(&like.object, SourceType::Forgejo.as_str())
            .map_err(|e| Rejection::from_error("Invalid objectId", e))?;
        if object.id() != repo.id.to_string() {
            return Err(Rejection::new(
                StatusCode::NOT_ACCEPTABLE,
                "Invalid objectId",
                FederationError::ObjectMismatch(format!(
                    "{} does not name repository {}",
                    like.object, repo.id
                )),
            ));
        }

        let (user, _) = self
            .find_or_create_with_host(&person, &host)
            .await
            .map_err(|e| Rejection::from_error("Error creating federatedUser", e))?;

        let starring = self
            .deps
            .repos
            .is_starring(user.id, repo.id)
            .await
            .map_err(|e| Rejection::from_error("Error starring", e))?;
        if !starring {
            self.deps
                .repos
                .star_repo(user.id, repo.id)
                .await
                .map_err(|e| Rejection::from_error("Error starring", e))?;
            tracing::info!(user = %user.name, repo_id = repo.id, "Repository starred by remote user");
        }

        self.deps
            .registry
            .record_activity(&host, like.start_time)
            .await
            .map_err(|e| Rejection::from_error("Error updating federatedHost", e))?;

        Ok(InboxOutcome::NoContent)
    }

    /// Record the follower and answer with an Accept.
    async fn handle_follow(
        &self,
        owner: &User,
        follow: FollowActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        let owner_actor = self.deps.urls.person_actor(owner.id);
        if follow.object != owner_actor {
            return Err(Rejection::new(
                StatusCode::NOT_ACCEPTABLE,
                "Wrong user to follow",
                FederationError::ObjectMismatch(format!(
                    "{} does not name the inbox owner",
                    follow.object
                )),
            ));
        }

        let (_, federated_user, _) = self
            .find_or_create_federated_user(&follow.actor)
            .await
            .map_err(|e| Rejection::from_error("Failed to resolve federated user", e))?;

        self.deps
            .users
            .add_follower(owner.id, federated_user.id)
            .await
            .map_err(|e| Rejection::from_error("Unable to add follower", e))?;
        tracing::info!(owner = %owner.name, follower = %follow.actor, "Follower added");

        let accept_id = format!("{}/follows/{}", owner_actor, ulid::Ulid::new());
        let accept = builder::accept(&accept_id, &owner_actor, &follow.raw);
        let item = PendingItem {
            doer_id: owner.id,
            federated_user_id: federated_user.id,
            payload: accept.to_string(),
        };
        // Push failures do not undo the recorded follow.
        if let Err(e) = self.deps.queues.pending.push(&item).await {
            tracing::error!(error = %e, follower = %follow.actor, "Failed to queue Accept");
        }

        Ok(InboxOutcome::Accepted)
    }

    /// Remove a follower; unknown actors are ignored.
    async fn handle_undo(
        &self,
        owner: &User,
        undo: UndoActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        tracing::debug!(follow = ?undo.object.id(), "Undo of Follow received");
        let found = self
            .find_federated_user(&undo.actor)
            .await
            .map_err(|e| Rejection::from_error("Failed to resolve federated user", e))?;

        if let Some((_, federated_user)) = found {
            let removed = self
                .deps
                .users
                .remove_follower(owner.id, federated_user.id)
                .await
                .map_err(|e| Rejection::from_error("Unable to remove follower", e))?;
            if removed {
                tracing::info!(owner = %owner.name, follower = %undo.actor, "Follower removed");
            }
        }

        Ok(InboxOutcome::NoContent)
    }

    async fn handle_accept(
        &self,
        owner: &User,
        accept: AcceptActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        tracing::debug!(
            owner = %owner.name,
            actor = %accept.actor,
            follow = ?accept.object.id(),
            "Accept of Follow received"
        );
        Ok(InboxOutcome::NoContent)
    }

    /// Store a Note from a followed actor for the inbox owner.
    async fn handle_create(
        &self,
        owner: &User,
        create: CreateActivity,
    ) -> std::result::Result<InboxOutcome, Rejection> {
        let (author, _, _) = self
            .find_or_create_federated_user(&create.actor)
            .await
            .map_err(|e| Rejection::from_error("Failed to resolve federated user", e))?;

        let activity = NewUserActivity {
            user_id: owner.id,
            actor_id: author.id,
            actor_uri: create.actor.clone(),
            note_content: ammonia::clean(&create.note.content),
            note_url: create.note.link().to_string(),
            original_note: create.note.raw.to_string(),
        };
        self.deps
            .users
            .add_user_activity(&activity)
            .await
            .map_err(|e| Rejection::from_error("Unable to record activity", e))?;
        tracing::debug!(owner = %owner.name, activity = %create.id, "Note recorded");

        Ok(InboxOutcome::NoContent)
    }

    // =========================================================================
    // Federated users
    // =========================================================================

    /// Shadow user of `actor_uri`, created from the remote Person on first contact.
    pub async fn find_or_create_federated_user(
        &self,
        actor_uri: &str,
    ) -> Result<(User, FederatedUser, FederationHost)> {
        let actor_id = ActorId::parse(actor_uri)?;
        let host = self.deps.registry.resolve_host(&actor_id).await?;
        let person = PersonId::parse(actor_uri, host_source(&host)?.as_str())?;
        let (user, federated_user) = self.find_or_create_with_host(&person, &host).await?;
        Ok((user, federated_user, host))
    }

    /// Shadow user of `actor_uri` if one exists; never contacts the remote.
    pub async fn find_federated_user(
        &self,
        actor_uri: &str,
    ) -> Result<Option<(User, FederatedUser)>> {
        let actor_id = ActorId::parse(actor_uri)?;
        let fqdn = actor_id.host().to_lowercase();
        let Some(host) = self
            .deps
            .registry
            .get_host_by_fqdn(&fqdn)
            .await?
        else {
            return Ok(None);
        };
        let person = PersonId::parse(actor_uri, host_source(&host)?.as_str())?;
        self.deps
            .users
            .find_federated_user(person.id(), host.id)
            .await
    }

    async fn find_or_create_with_host(
        &self,
        person: &PersonId,
        host: &FederationHost,
    ) -> Result<(User, FederatedUser)> {
        if let Some(found) = self
            .deps
            .users
            .find_federated_user(person.id(), host.id)
            .await?
        {
            return Ok(found);
        }

        let actor_uri = person.as_uri();
        let profile = self.fetch_profile(person).await?;
        let new_user = NewUser {
            email: format!("f{}@{}", ulid::Ulid::new(), self.deps.urls.host()),
            passwd_hash: hash_password(&generate_password()),
            kind: UserKind::Remote,
            normalized_federated_uri: Some(actor_uri.clone()),
            name: profile.name,
            full_name: profile.full_name,
            login_name: profile.login_name,
        };

        let (user, federated_user) = self
            .deps
            .users
            .create_federated_user(&new_user, person.id(), host.id)
            .await?;
        tracing::info!(user = %user.name, actor = %actor_uri, "Created federated user");

        Ok((user, federated_user))
    }

    /// Shadow user fields derived from the remote Person, fetched as the instance actor.
    async fn fetch_profile(&self, person: &PersonId) -> Result<UserProfile> {
        let actor_uri = person.as_uri();
        let signer = self.deps.keys.instance_signer().await?;
        let remote: RemotePerson = self.deps.client.get_json(&actor_uri, &signer).await?;
        let preferred_username = remote
            .preferred_username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                FederationError::RemoteUnavailable(format!(
                    "{} has no preferredUsername",
                    actor_uri
                ))
            })?;

        let name = format!("{}{}", preferred_username, person.host_suffix());
        let full_name = remote
            .name
            .as_deref()
            .map(str::trim)
            .filter(|full_name| !full_name.is_empty())
            .map(String::from)
            .unwrap_or_else(|| name.clone());

        Ok(UserProfile {
            name,
            full_name,
            login_name: person.as_login_name(),
        })
    }

    /// Re-fetch every federated user's Person and mirror renamed profiles.
    ///
    /// A user whose remote cannot be reached is logged and skipped. Returns
    /// the number of shadow users updated.
    pub async fn refresh_federated_user_profiles(&self) -> Result<usize> {
        let mut updated = 0;
        let mut offset = 0;
        loop {
            let page = self
                .deps
                .users
                .list_federated_users(PROFILE_REFRESH_PAGE_SIZE, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;

            for federated_user in &page {
                match self.refresh_profile(federated_user).await {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        federated_user_id = federated_user.id,
                        error = %e,
                        "Failed to refresh federated user profile"
                    ),
                }
            }
        }

        tracing::info!(updated, "Federated user profiles refreshed");
        Ok(updated)
    }

    async fn refresh_profile(&self, federated_user: &FederatedUser) -> Result<bool> {
        let user = self
            .deps
            .users
            .get_user(federated_user.user_id)
            .await?
            .ok_or(FederationError::NotFound)?;
        let actor_uri = user
            .normalized_federated_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                FederationError::ValidationFailed(format!("user {} has no actor uri", user.id))
            })?;

        let actor_id = ActorId::parse(actor_uri)?;
        let host = self
            .deps
            .registry
            .get_host_by_fqdn(&actor_id.host().to_lowercase())
            .await?
            .ok_or(FederationError::NotFound)?;
        let person = PersonId::parse(actor_uri, host_source(&host)?.as_str())?;

        let profile = self.fetch_profile(&person).await?;
        if profile.matches(&user) {
            return Ok(false);
        }

        self.deps.users.update_user_profile(user.id, &profile).await?;
        tracing::info!(user_id = user.id, from = %user.name, to = %profile.name, "Federated user profile updated");
        Ok(true)
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send a Like to every remote repository `repo_id` follows.
    ///
    /// Start times are spaced a second apart so the receiving host accepts
    /// them in order. Returns the number of Likes queued.
    pub async fn send_like_activities(&self, doer: &User, repo_id: i64) -> Result<usize> {
        let following = self.deps.repos.list_following_repos(repo_id).await?;
        let actor = self.deps.urls.person_actor(doer.id);
        let now = Utc::now();

        let mut queued = 0;
        for (i, following_repo) in following.iter().enumerate() {
            let like = builder::like(&actor, &following_repo.uri, now + Duration::seconds(i as i64));
            let item = DeliveryItem {
                doer_id: doer.id,
                inbox_url: inbox_of(&following_repo.uri),
                payload: like.to_string(),
            };
            match self.deps.queues.delivery.push(&item).await {
                Ok(_) => queued += 1,
                Err(e) => tracing::error!(
                    target_repo = %following_repo.uri,
                    error = %e,
                    "Failed to queue Like"
                ),
            }
        }

        tracing::info!(repo_id, queued, "Like activities queued");
        Ok(queued)
    }

    /// Replace the remote repositories `repo_id` forwards its stars to.
    pub async fn store_following_repo_list(&self, repo_id: i64, uris: &[String]) -> Result<()> {
        if self.deps.repos.get_repository(repo_id).await?.is_none() {
            return Err(FederationError::NotFound);
        }

        let mut repos = Vec::with_capacity(uris.len());
        for uri in uris {
            let actor_id = ActorId::parse(uri)?;
            let host = self.deps.registry.resolve_host(&actor_id).await?;
            let repository = RepositoryId::parse(uri, host_source(&host)?.as_str())?;
            repos.push(NewFollowingRepo {
                external_id: repository.id().to_string(),
                federation_host_id: host.id,
                uri: uri.clone(),
            });
        }

        self.deps.repos.replace_following_repos(repo_id, &repos).await
    }

    pub async fn delete_following_repos(&self, repo_id: i64) -> Result<()> {
        self.deps.repos.replace_following_repos(repo_id, &[]).await
    }

    /// Announce a local user action to the doer's remote followers.
    ///
    /// Returns the number of followers the Note was queued for.
    pub async fn notify_followers(&self, doer: &User, action: &UserAction) -> Result<usize> {
        if doer.is_remote() || doer.is_private || doer.keep_activity_private || !action.is_public()
        {
            tracing::debug!(user = %doer.name, action_id = action.id, "Action not announced");
            return Ok(0);
        }

        let followers = self.deps.users.list_followers(doer.id).await?;
        if followers.is_empty() {
            return Ok(0);
        }

        let actor = self.deps.urls.person_actor(doer.id);
        let create = builder::create_note(&actor, action.id, &action.render(), Utc::now());
        let queued = self
            .deps
            .queues
            .push_to_followers(doer.id, &followers, &create.to_string())
            .await;

        tracing::info!(user = %doer.name, action_id = action.id, queued, "Action announced");
        Ok(queued)
    }

    /// Follow a remote user on behalf of `doer`.
    pub async fn follow_remote_user(&self, doer: &User, actor_uri: &str) -> Result<()> {
        let (_, federated_user, _) = self.find_or_create_federated_user(actor_uri).await?;
        let actor = self.deps.urls.person_actor(doer.id);
        let follow = builder::follow(&follow_id(&actor, federated_user.id), &actor, actor_uri);

        self.deps
            .queues
            .pending
            .push(&PendingItem {
                doer_id: doer.id,
                federated_user_id: federated_user.id,
                payload: follow.to_string(),
            })
            .await?;
        tracing::info!(user = %doer.name, target = %actor_uri, "Follow queued");
        Ok(())
    }

    /// Withdraw a Follow previously sent by `doer`.
    pub async fn unfollow_remote_user(&self, doer: &User, actor_uri: &str) -> Result<()> {
        let Some((_, federated_user)) = self.find_federated_user(actor_uri).await? else {
            return Err(FederationError::NotFound);
        };
        let actor = self.deps.urls.person_actor(doer.id);
        let undo = builder::undo_follow(
            &format!("{}/undo/{}", actor, ulid::Ulid::new()),
            &actor,
            &follow_id(&actor, federated_user.id),
            actor_uri,
        );

        self.deps
            .queues
            .pending
            .push(&PendingItem {
                doer_id: doer.id,
                federated_user_id: federated_user.id,
                payload: undo.to_string(),
            })
            .await?;
        tracing::info!(user = %doer.name, target = %actor_uri, "Undo of Follow queued");
        Ok(())
    }
}

/// Follows sent to the same remote user share one id so they can be undone.
fn follow_id(actor: &str, federated_user_id: i64) -> String {
    format!("{}/follows/{}", actor, federated_user_id)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn hash_password(password: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(password.as_bytes()))
}

fn record_received(kind: &str, result: &std::result::Result<InboxOutcome, Rejection>) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(rejection) if rejection.status.is_client_error() => "rejected",
        Err(_) => "error",
    };
    ACTIVITYPUB_ACTIVITIES_RECEIVED
        .with_label_values(&[kind, outcome])
        .inc();
    if let Err(rejection) = result {
        if rejection.status.is_server_error() {
            tracing::error!(activity = kind, %rejection, "Inbound activity failed");
        } else {
            tracing::info!(activity = kind, %rejection, "Inbound activity rejected");
        }
    }
}
