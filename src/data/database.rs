//! SQLite database operations
//!
//! All database access goes through this module.
//! `Database` implements every storage trait the federation core consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::*;
use crate::error::{FederationError, Result};

const USER_COLUMNS: &str = "id, name, lower_name, full_name, email, passwd_hash, login_name, kind, \
     normalized_federated_uri, is_private, keep_activity_private, created_at, updated_at";

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to a SQLite file, creating it if needed, and run migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FederationError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                FederationError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Local users and repositories
    // =========================================================================

    /// Insert a user row and return it.
    pub async fn create_user(&self, user: &NewUser) -> Result<User> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO users (
                name, lower_name, full_name, email, passwd_hash, login_name, kind,
                normalized_federated_uri, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.name)
        .bind(user.name.to_lowercase())
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(&user.passwd_hash)
        .bind(&user.login_name)
        .bind(user.kind)
        .bind(&user.normalized_federated_uri)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_user(id).await?.ok_or(FederationError::NotFound)
    }

    /// Create a plain local account.
    pub async fn create_local_user(&self, name: &str) -> Result<User> {
        self.create_user(&NewUser {
            name: name.to_string(),
            full_name: name.to_string(),
            email: format!("{}@localhost", name.to_lowercase()),
            passwd_hash: String::new(),
            login_name: name.to_lowercase(),
            kind: UserKind::Local,
            normalized_federated_uri: None,
        })
        .await
    }

    pub async fn set_user_visibility(
        &self,
        user_id: i64,
        is_private: bool,
        keep_activity_private: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET is_private = ?, keep_activity_private = ?, updated_at = ? WHERE id = ?",
        )
        .bind(is_private)
        .bind(keep_activity_private)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_local_users(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE kind = 'local'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn create_repository(
        &self,
        owner_id: i64,
        name: &str,
        is_private: bool,
    ) -> Result<Repository> {
        let id = sqlx::query(
            "INSERT INTO repositories (owner_id, name, is_private, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(owner_id)
        .bind(name)
        .bind(is_private)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_repository(id).await?.ok_or(FederationError::NotFound)
    }

    pub async fn count_stars(&self, repo_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stars WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Notes received by `user_id`, newest first.
    pub async fn list_user_activities(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FederatedUserActivity>> {
        let rows = sqlx::query_as::<_, FederatedUserActivity>(
            r#"
            SELECT id, user_id, actor_id, actor_uri, note_content, note_url, original_note, created_at
            FROM federated_user_activities
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Items waiting in `queue_name`, oldest first, leased ones included.
    pub async fn list_queue_items(&self, queue_name: &str) -> Result<Vec<QueueRecord>> {
        let rows = sqlx::query_as::<_, QueueRecord>(
            r#"
            SELECT id, queue_name, unique_key, payload, attempts, next_attempt_at_ms,
                   leased_until_ms, last_error, created_at
            FROM queue_items
            WHERE queue_name = ?
            ORDER BY id
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn fetch_federated_user(
        &self,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<Option<FederatedUser>> {
        let row = sqlx::query_as::<_, FederatedUser>(
            r#"
            SELECT id, user_id, external_id, federation_host_id, inbox_url
            FROM federated_users
            WHERE external_id = ? AND federation_host_id = ?
            "#,
        )
        .bind(external_id)
        .bind(federation_host_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

// =============================================================================
// Federation hosts
// =============================================================================

#[async_trait]
impl HostStore for Database {
    async fn get_federation_host_by_fqdn(
        &self,
        host_fqdn: &str,
    ) -> Result<Option<FederationHost>> {
        let host = sqlx::query_as::<_, FederationHost>(
            r#"
            SELECT id, host_fqdn, software_kind, latest_activity, created_at, updated_at
            FROM federation_hosts
            WHERE host_fqdn = ?
            "#,
        )
        .bind(host_fqdn.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(host)
    }

    async fn get_federation_host(&self, id: i64) -> Result<Option<FederationHost>> {
        let host = sqlx::query_as::<_, FederationHost>(
            r#"
            SELECT id, host_fqdn, software_kind, latest_activity, created_at, updated_at
            FROM federation_hosts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(host)
    }

    async fn insert_federation_host(
        &self,
        host_fqdn: &str,
        software_kind: &str,
        latest_activity: DateTime<Utc>,
    ) -> Result<FederationHost> {
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO federation_hosts (
                host_fqdn, software_kind, latest_activity, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(host_fqdn.to_lowercase())
        .bind(software_kind)
        .bind(latest_activity)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            tracing::debug!(host = %host_fqdn, "Federation host already exists, re-fetching");
        }

        self.get_federation_host_by_fqdn(host_fqdn)
            .await?
            .ok_or(FederationError::NotFound)
    }

    async fn update_federation_host_latest_activity(
        &self,
        id: i64,
        latest_activity: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE federation_hosts SET latest_activity = ?, updated_at = ? WHERE id = ?")
            .bind(latest_activity)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Users and followers
// =============================================================================

#[async_trait]
impl UserDirectory for Database {
    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_federated_user(&self, id: i64) -> Result<Option<FederatedUser>> {
        let row = sqlx::query_as::<_, FederatedUser>(
            "SELECT id, user_id, external_id, federation_host_id, inbox_url FROM federated_users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_federated_user(
        &self,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<Option<(User, FederatedUser)>> {
        let Some(federated) = self
            .fetch_federated_user(external_id, federation_host_id)
            .await?
        else {
            return Ok(None);
        };

        match self.get_user(federated.user_id).await? {
            Some(user) => Ok(Some((user, federated))),
            None => {
                tracing::warn!(
                    federated_user_id = federated.id,
                    user_id = federated.user_id,
                    "Federated user points at a missing user row"
                );
                Ok(None)
            }
        }
    }

    async fn create_federated_user(
        &self,
        user: &NewUser,
        external_id: &str,
        federation_host_id: i64,
    ) -> Result<(User, FederatedUser)> {
        // Writing first takes the write lock before anything is read.
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (
                name, lower_name, full_name, email, passwd_hash, login_name, kind,
                normalized_federated_uri, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.name)
        .bind(user.name.to_lowercase())
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(&user.passwd_hash)
        .bind(&user.login_name)
        .bind(user.kind)
        .bind(&user.normalized_federated_uri)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let user_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                tx.rollback().await?;
                tracing::debug!(%external_id, "Shadow user name taken, looking up existing link");
                return match self.find_federated_user(external_id, federation_host_id).await? {
                    Some(existing) => Ok(existing),
                    None => Err(FederationError::Database(sqlx::Error::Database(error))),
                };
            }
            Err(error) => return Err(error.into()),
        };

        let linked = sqlx::query(
            r#"
            INSERT OR IGNORE INTO federated_users (user_id, external_id, federation_host_id)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(external_id)
        .bind(federation_host_id)
        .execute(&mut *tx)
        .await?;

        if linked.rows_affected() > 0 {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
            tracing::debug!(%external_id, "Federated user already exists, re-fetching");
        }

        self.find_federated_user(external_id, federation_host_id)
            .await?
            .ok_or(FederationError::NotFound)
    }

    async fn set_federated_user_inbox(
        &self,
        federated_user_id: i64,
        inbox_url: &str,
    ) -> Result<()> {
        let updated = sqlx::query("UPDATE federated_users SET inbox_url = ? WHERE id = ?")
            .bind(inbox_url)
            .bind(federated_user_id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(FederationError::NotFound);
        }
        Ok(())
    }

    async fn list_federated_users(&self, limit: i64, offset: i64) -> Result<Vec<FederatedUser>> {
        let rows = sqlx::query_as::<_, FederatedUser>(
            r#"
            SELECT id, user_id, external_id, federation_host_id, inbox_url
            FROM federated_users
            ORDER BY id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_user_profile(&self, user_id: i64, profile: &UserProfile) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE users
            SET name = ?, lower_name = ?, full_name = ?, login_name = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&profile.name)
        .bind(profile.name.to_lowercase())
        .bind(&profile.full_name)
        .bind(&profile.login_name)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(FederationError::NotFound);
        }
        Ok(())
    }

    async fn add_follower(&self, local_user_id: i64, federated_user_id: i64) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO federated_user_followers (local_user_id, federated_user_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(local_user_id)
        .bind(federated_user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn remove_follower(&self, local_user_id: i64, federated_user_id: i64) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM federated_user_followers WHERE local_user_id = ? AND federated_user_id = ?",
        )
        .bind(local_user_id)
        .bind(federated_user_id)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn list_followers(&self, local_user_id: i64) -> Result<Vec<FederatedUserFollower>> {
        let rows = sqlx::query_as::<_, FederatedUserFollower>(
            r#"
            SELECT id, local_user_id, federated_user_id, created_at
            FROM federated_user_followers
            WHERE local_user_id = ?
            ORDER BY id
            "#,
        )
        .bind(local_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn add_user_activity(&self, activity: &NewUserActivity) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO federated_user_activities (
                user_id, actor_id, actor_uri, note_content, note_url, original_note, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(activity.user_id)
        .bind(activity.actor_id)
        .bind(&activity.actor_uri)
        .bind(&activity.note_content)
        .bind(&activity.note_url)
        .bind(&activity.original_note)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }
}

// =============================================================================
// Repositories, stars, following repos
// =============================================================================

#[async_trait]
impl RepoStore for Database {
    async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let repo = sqlx::query_as::<_, Repository>(
            "SELECT id, owner_id, name, is_private, created_at FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(repo)
    }

    async fn is_starring(&self, user_id: i64, repo_id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM stars WHERE user_id = ? AND repo_id = ?)",
        )
        .bind(user_id)
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn star_repo(&self, user_id: i64, repo_id: i64) -> Result<bool> {
        let inserted =
            sqlx::query("INSERT OR IGNORE INTO stars (user_id, repo_id, created_at) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(repo_id)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn list_following_repos(&self, repo_id: i64) -> Result<Vec<FollowingRepo>> {
        let rows = sqlx::query_as::<_, FollowingRepo>(
            r#"
            SELECT id, repo_id, external_id, federation_host_id, uri
            FROM following_repos
            WHERE repo_id = ?
            ORDER BY id
            "#,
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn replace_following_repos(
        &self,
        repo_id: i64,
        repos: &[NewFollowingRepo],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM following_repos WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await?;

        for repo in repos {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO following_repos (repo_id, external_id, federation_host_id, uri)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(repo_id)
            .bind(&repo.external_id)
            .bind(repo.federation_host_id)
            .bind(&repo.uri)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Signing keys
// =============================================================================

#[async_trait]
impl KeyStore for Database {
    async fn get_signing_key(&self, owner: &str) -> Result<Option<SigningKeyPair>> {
        let key = sqlx::query_as::<_, SigningKeyPair>(
            "SELECT owner, private_key_pem, public_key_pem, created_at FROM signing_keys WHERE owner = ?",
        )
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn insert_signing_key(
        &self,
        owner: &str,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<SigningKeyPair> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO signing_keys (owner, private_key_pem, public_key_pem, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(owner)
        .bind(private_key_pem)
        .bind(public_key_pem)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_signing_key(owner)
            .await?
            .ok_or(FederationError::NotFound)
    }
}

// =============================================================================
// Queue items
// =============================================================================

#[async_trait]
impl QueueStore for Database {
    async fn enqueue(
        &self,
        queue_name: &str,
        unique_key: &str,
        payload: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_items (
                queue_name, unique_key, payload, attempts, next_attempt_at_ms, created_at
            ) VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(queue_name)
        .bind(unique_key)
        .bind(payload)
        .bind(now_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        queue_name: &str,
        limit: u32,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<QueueRecord>> {
        let mut records = sqlx::query_as::<_, QueueRecord>(
            r#"
            UPDATE queue_items
            SET leased_until_ms = ?
            WHERE id IN (
                SELECT id FROM queue_items
                WHERE queue_name = ?
                  AND next_attempt_at_ms <= ?
                  AND (leased_until_ms IS NULL OR leased_until_ms <= ?)
                ORDER BY next_attempt_at_ms, id
                LIMIT ?
            )
            RETURNING id, queue_name, unique_key, payload, attempts, next_attempt_at_ms,
                      leased_until_ms, last_error, created_at
            "#,
        )
        .bind(now_ms + lease_ms)
        .bind(queue_name)
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|record| (record.next_attempt_at_ms, record.id));
        Ok(records)
    }

    async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, id: i64, next_attempt_at_ms: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_items
            SET attempts = attempts + 1, next_attempt_at_ms = ?, leased_until_ms = NULL, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(next_attempt_at_ms)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_len(&self, queue_name: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_items WHERE queue_name = ?")
                .bind(queue_name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
