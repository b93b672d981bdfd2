//! Data models
//!
//! Rust structs representing database rows.
//! Forge entities use integer IDs (they appear in actor URIs);
//! timestamps are chrono `DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Local forge records
// =============================================================================

/// Whether a user row is a real local account or a shadow of a remote actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub lower_name: String,
    pub full_name: String,
    pub email: String,
    /// Base64url SHA-256 of the (unused) generated password for shadow users
    pub passwd_hash: String,
    pub login_name: String,
    pub kind: UserKind,
    /// Canonical actor URI, set for remote shadow users
    pub normalized_federated_uri: Option<String>,
    pub is_private: bool,
    pub keep_activity_private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_remote(&self) -> bool {
        self.kind == UserKind::Remote
    }
}

/// Insert form for users
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub full_name: String,
    pub email: String,
    pub passwd_hash: String,
    pub login_name: String,
    pub kind: UserKind,
    pub normalized_federated_uri: Option<String>,
}

/// Profile fields of a shadow user mirrored from the remote Person
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub full_name: String,
    pub login_name: String,
}

impl UserProfile {
    pub fn matches(&self, user: &User) -> bool {
        self.name == user.name
            && self.full_name == user.full_name
            && self.login_name == user.login_name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Repository {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
}

/// Key material used to sign outbound requests
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKeyPair {
    /// "instance" or "user:{id}"
    pub owner: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Federation
// =============================================================================

/// A remote forge instance we have talked to
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederationHost {
    pub id: i64,
    /// Lower-cased host name, unique
    pub host_fqdn: String,
    /// NodeInfo software name ("forgejo", "gitea")
    pub software_kind: String,
    /// Timestamp of the newest accepted Like from this host
    pub latest_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link between a shadow user and the remote actor it mirrors
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUser {
    pub id: i64,
    pub user_id: i64,
    pub external_id: String,
    pub federation_host_id: i64,
    pub inbox_url: Option<String>,
}

impl FederatedUser {
    /// Inbox URL, if one has been recorded and is not blank.
    pub fn inbox(&self) -> Option<&str> {
        self.inbox_url
            .as_deref()
            .map(str::trim)
            .filter(|inbox| !inbox.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUserFollower {
    pub id: i64,
    pub local_user_id: i64,
    pub federated_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Remote repository a local repository forwards its stars to
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowingRepo {
    pub id: i64,
    pub repo_id: i64,
    pub external_id: String,
    pub federation_host_id: i64,
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct NewFollowingRepo {
    pub external_id: String,
    pub federation_host_id: i64,
    pub uri: String,
}

/// Note received from a followed remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUserActivity {
    pub id: i64,
    /// Local user whose inbox received the note
    pub user_id: i64,
    /// Shadow user of the author
    pub actor_id: i64,
    pub actor_uri: String,
    pub note_content: String,
    pub note_url: String,
    /// Note JSON as received
    pub original_note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUserActivity {
    pub user_id: i64,
    pub actor_id: i64,
    pub actor_uri: String,
    pub note_content: String,
    pub note_url: String,
    pub original_note: String,
}

// =============================================================================
// Queues
// =============================================================================

/// Persisted queue item
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueRecord {
    pub id: i64,
    pub queue_name: String,
    pub unique_key: String,
    /// JSON-encoded item
    pub payload: String,
    pub attempts: i64,
    pub next_attempt_at_ms: i64,
    pub leased_until_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
