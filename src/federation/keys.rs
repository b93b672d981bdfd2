//! Signing-key provider
//!
//! Every local user, and the instance service actor, signs with its own RSA
//! key pair. Pairs are generated on first use and persisted.

use std::sync::Arc;

use async_trait::async_trait;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::urls::{LocalUrls, main_key_id};
use crate::data::{KeyStore, SigningKeyPair, User};
use crate::error::{FederationError, Result};

const INSTANCE_KEY_OWNER: &str = "instance";

/// Credentials for one signed request
#[derive(Clone)]
pub struct Signer {
    pub key_id: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Source of signing credentials and published public keys
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Signer for the instance service actor.
    async fn instance_signer(&self) -> Result<Signer>;

    /// Signer acting as `user`.
    async fn user_signer(&self, user: &User) -> Result<Signer>;

    async fn instance_public_key(&self) -> Result<String>;

    async fn user_public_key(&self, user_id: i64) -> Result<String>;
}

/// Key provider backed by a [`KeyStore`]
pub struct StoredKeyProvider {
    store: Arc<dyn KeyStore>,
    urls: LocalUrls,
    key_bits: usize,
}

impl StoredKeyProvider {
    pub fn new(store: Arc<dyn KeyStore>, urls: LocalUrls, key_bits: usize) -> Self {
        Self {
            store,
            urls,
            key_bits,
        }
    }

    async fn key_pair(&self, owner: &str) -> Result<SigningKeyPair> {
        if let Some(pair) = self.store.get_signing_key(owner).await? {
            return Ok(pair);
        }

        tracing::info!(%owner, bits = self.key_bits, "Generating signing key pair");
        let bits = self.key_bits;
        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || generate_key_pair(bits))
                .await
                .map_err(|e| FederationError::Internal(anyhow::anyhow!(e)))??;

        // A concurrent caller may have stored a pair first; the store returns the winner.
        self.store
            .insert_signing_key(owner, &private_key_pem, &public_key_pem)
            .await
    }
}

#[async_trait]
impl KeyProvider for StoredKeyProvider {
    async fn instance_signer(&self) -> Result<Signer> {
        let pair = self.key_pair(INSTANCE_KEY_OWNER).await?;
        Ok(Signer {
            key_id: main_key_id(&self.urls.instance_actor()),
            private_key_pem: pair.private_key_pem,
        })
    }

    async fn user_signer(&self, user: &User) -> Result<Signer> {
        if user.is_remote() {
            return Err(FederationError::Internal(anyhow::anyhow!(
                "remote user {} cannot sign requests",
                user.id
            )));
        }

        let pair = self.key_pair(&user_key_owner(user.id)).await?;
        Ok(Signer {
            key_id: main_key_id(&self.urls.person_actor(user.id)),
            private_key_pem: pair.private_key_pem,
        })
    }

    async fn instance_public_key(&self) -> Result<String> {
        Ok(self.key_pair(INSTANCE_KEY_OWNER).await?.public_key_pem)
    }

    async fn user_public_key(&self, user_id: i64) -> Result<String> {
        Ok(self.key_pair(&user_key_owner(user_id)).await?.public_key_pem)
    }
}

fn user_key_owner(user_id: i64) -> String {
    format!("user:{}", user_id)
}

/// Generate an RSA key pair as PKCS#8 / SPKI PEM strings.
pub fn generate_key_pair(bits: usize) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| FederationError::Internal(anyhow::anyhow!("Key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| FederationError::Internal(anyhow::anyhow!("Private key encoding failed: {}", e)))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| FederationError::Internal(anyhow::anyhow!("Public key encoding failed: {}", e)))?;

    Ok((private_key_pem, public_key_pem))
}
