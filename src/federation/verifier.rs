//! Inbound HTTP signature verification
//!
//! Resolves the signing key of the remote actor and checks the request
//! signature against it.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::client::ActivityPubClient;
use super::key_cache::PublicKeyCache;
use super::keys::KeyProvider;
use super::signature::{VerifyOptions, extract_signature_key_id, verify_signature};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorKeyDocument {
    public_key: Option<ActorPublicKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorPublicKey {
    id: String,
    #[serde(default)]
    public_key_pem: String,
}

pub struct SignatureVerifier {
    client: Arc<ActivityPubClient>,
    keys: Arc<dyn KeyProvider>,
    cache: PublicKeyCache,
    allowed_algorithms: Vec<String>,
    clock_skew_secs: i64,
}

impl SignatureVerifier {
    pub fn new(
        client: Arc<ActivityPubClient>,
        keys: Arc<dyn KeyProvider>,
        config: &FederationConfig,
    ) -> Self {
        Self {
            client,
            keys,
            cache: PublicKeyCache::new(Duration::from_secs(config.public_key_cache_ttl_secs)),
            allowed_algorithms: config.algorithms.clone(),
            clock_skew_secs: config.clock_skew_secs,
        }
    }

    /// Verify the signature of an inbound request.
    ///
    /// `Err(AuthenticationFailed)` for malformed or unresolvable signatures,
    /// `Ok(false)` when the signature does not match the actor's key.
    pub async fn verify(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<bool> {
        let key_id = extract_signature_key_id(headers)?;
        let options = VerifyOptions {
            allowed_algorithms: &self.allowed_algorithms,
            clock_skew_secs: self.clock_skew_secs,
        };

        if let Some(pem) = self.cache.get(&key_id).await {
            if verify_signature(method, path_and_query, headers, body, &pem, &options)? {
                return Ok(true);
            }
            tracing::debug!(%key_id, "Cached key rejected signature, refetching");
            self.cache.invalidate(&key_id).await;
        }

        let pem = self.fetch_public_key(&key_id).await?;
        let verified = verify_signature(method, path_and_query, headers, body, &pem, &options)?;
        if verified {
            self.cache.insert(&key_id, &pem).await;
        }
        Ok(verified)
    }

    /// Fetch the actor document owning `key_id` and return its PEM.
    async fn fetch_public_key(&self, key_id: &str) -> Result<String> {
        let url = url::Url::parse(key_id).map_err(|e| {
            FederationError::AuthenticationFailed(format!("Invalid keyId {}: {}", key_id, e))
        })?;
        let mut actor_url = url.clone();
        actor_url.set_fragment(None);

        let signer = self.keys.instance_signer().await?;
        let document: ActorKeyDocument = self
            .client
            .get_json(actor_url.as_str(), &signer)
            .await
            .map_err(|e| {
                FederationError::AuthenticationFailed(format!(
                    "Failed to fetch key owner of {}: {}",
                    key_id, e
                ))
            })?;

        let public_key = document.public_key.ok_or_else(|| {
            FederationError::AuthenticationFailed(format!("Actor of {} has no publicKey", key_id))
        })?;
        if public_key.id != key_id {
            return Err(FederationError::AuthenticationFailed(format!(
                "publicKey id {} does not match keyId {}",
                public_key.id, key_id
            )));
        }
        if public_key.public_key_pem.trim().is_empty() {
            return Err(FederationError::AuthenticationFailed(format!(
                "Actor of {} publishes an empty key",
                key_id
            )));
        }

        Ok(public_key.public_key_pem)
    }
}
