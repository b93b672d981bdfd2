//! Storage interfaces consumed by the federation core
//!
//! The core only talks to storage through these traits. [`Database`]
//! implements all of them on SQLite.
//!
//! [`Database`]: super::Database

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::error::Result;

/// Remote host records
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get_federation_host_by_fqdn(&self, host_fqdn: &str)
    -> Result<Option<FederationHost>>;

    async fn get_federation_host(&self, id: i64) -> Result<Option<FederationHost>>;

    /// Insert a host, or return the existing row when another caller won the race.
    async fn insert_federation_host(
        &self,
        host_fqdn: &str,
        software_kind: &str,
        latest_activity: DateTime<Utc>,
    ) -> Result<FederationHost>;

    async fn update_federation_host_latest_activity(
        &self,
        id: i64,
        latest_activity: DateTime<Utc>,
    ) -> Result<()>;
}

/// Users, shadow users and their federation edges
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    async fn get_federated_user(&self, id: i64) -> Result<Option<FederatedUser>>;

    async fn find_federated_user(
        &self,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<Option<(User, FederatedUser)>>;

    /// Create a shadow user plus its federated link.
    ///
    /// If the `(external_id, federation_host_id)` pair already exists the
    /// existing rows are returned instead.
    async fn create_federated_user(
        &self,
        user: &NewUser,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<(User, FederatedUser)>;

    async fn set_federated_user_inbox(&self, federated_user_id: i64, inbox_url: &str)
    -> Result<()>;

    /// One page of federated users ordered by id.
    async fn list_federated_users(&self, limit: i64, offset: i64) -> Result<Vec<FederatedUser>>;

    async fn update_user_profile(&self, user_id: i64, profile: &UserProfile) -> Result<()>;

    /// Returns true when a new edge was written.
    async fn add_follower(&self, local_user_id: i64, federated_user_id: i64) -> Result<bool>;

    /// Returns true when an edge was removed.
    async fn remove_follower(&self, local_user_id: i64, federated_user_id: i64) -> Result<bool>;

    async fn list_followers(&self, local_user_id: i64) -> Result<Vec<FederatedUserFollower>>;

    async fn add_user_activity(&self, activity: &NewUserActivity) -> Result<i64>;
}

/// Repositories, stars and following-repo lists
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get_repository(&self, id: i64) -> Result<Option<Repository>>;

    async fn is_starring(&self, user_id: i64, repo_id: i64) -> Result<bool>;

    /// Returns true when a new star was written.
    async fn star_repo(&self, user_id: i64, repo_id: i64) -> Result<bool>;

    async fn list_following_repos(&self, repo_id: i64) -> Result<Vec<FollowingRepo>>;

    /// Delete every following repo of `repo_id` and insert `repos`.
    async fn replace_following_repos(&self, repo_id: i64, repos: &[NewFollowingRepo])
    -> Result<()>;
}

/// Persisted signing keys
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_signing_key(&self, owner: &str) -> Result<Option<SigningKeyPair>>;

    /// Store a key pair unless one exists; returns whichever pair is stored.
    async fn insert_signing_key(
        &self,
        owner: &str,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<SigningKeyPair>;
}

/// Durable backing for the unique queues
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Returns false when an item with the same key is already enqueued.
    async fn enqueue(
        &self,
        queue_name: &str,
        unique_key: &str,
        payload: &str,
        now_ms: i64,
    ) -> Result<bool>;

    /// Lease up to `limit` due items until `now_ms + lease_ms`.
    async fn claim_due(
        &self,
        queue_name: &str,
        limit: u32,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<QueueRecord>>;

    async fn complete(&self, id: i64) -> Result<()>;

    async fn reschedule(&self, id: i64, next_attempt_at_ms: i64, error: &str) -> Result<()>;

    async fn queue_len(&self, queue_name: &str) -> Result<i64>;
}
