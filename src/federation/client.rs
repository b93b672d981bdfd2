//! Signed HTTP client for outbound federation calls
//!
//! Every request is signed, bounded by connect/request timeouts and refuses
//! private destinations unless explicitly allowed.

use std::net::IpAddr;
use std::time::Instant;

use serde::de::DeserializeOwned;

use super::keys::Signer;
use super::signature::{SignatureAlgorithm, sign_request};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Response of a signed POST
#[derive(Debug, Clone)]
pub struct PostResponse {
    pub status: reqwest::StatusCode,
    /// First bytes of the body, for logging
    pub body_snippet: String,
}

pub struct ActivityPubClient {
    http: reqwest::Client,
    algorithm: SignatureAlgorithm,
    max_size: usize,
    allow_private_networks: bool,
}

impl ActivityPubClient {
    pub fn new(config: &FederationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("forgefed/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FederationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let algorithm = SignatureAlgorithm::from_name(config.signing_algorithm()).ok_or_else(|| {
            FederationError::Config(format!(
                "Unsupported signing algorithm: {}",
                config.signing_algorithm()
            ))
        })?;

        Ok(Self {
            http,
            algorithm,
            max_size: config.max_size,
            allow_private_networks: config.allow_private_networks,
        })
    }

    /// Signed GET returning the raw body.
    ///
    /// Any failure, including a non-2xx status, is `RemoteUnavailable`.
    pub async fn get(&self, url: &str, signer: &Signer) -> Result<Vec<u8>> {
        let unavailable = |reason: String| {
            FederationError::RemoteUnavailable(format!("GET {}: {}", url, reason))
        };

        self.check_destination(url).await.map_err(unavailable)?;

        let signed = sign_request(
            "GET",
            url,
            None,
            &signer.private_key_pem,
            &signer.key_id,
            self.algorithm,
        )?;

        let started = Instant::now();
        let response = self
            .http
            .get(url)
            .header("Accept", format!("{}, application/json", ACTIVITY_JSON))
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = response.map_err(|e| {
            record_outbound("error");
            unavailable(e.to_string())
        })?;

        let status = response.status();
        record_outbound(status.as_str());
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {}", status)));
        }

        self.read_limited(response).await.map_err(unavailable)
    }

    /// Signed GET decoded as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, signer: &Signer) -> Result<T> {
        let body = self.get(url, signer).await?;
        serde_json::from_slice(&body).map_err(|e| {
            FederationError::RemoteUnavailable(format!("GET {}: invalid JSON: {}", url, e))
        })
    }

    /// Signed POST of an activity.
    ///
    /// Transport errors are `DeliveryFailed`; the HTTP status is returned
    /// for the caller to judge.
    pub async fn post(&self, url: &str, body: Vec<u8>, signer: &Signer) -> Result<PostResponse> {
        let failed =
            |reason: String| FederationError::DeliveryFailed(format!("POST {}: {}", url, reason));

        self.check_destination(url).await.map_err(failed)?;

        let signed = sign_request(
            "POST",
            url,
            Some(&body),
            &signer.private_key_pem,
            &signer.key_id,
            self.algorithm,
        )?;

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let response = request.body(body).send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = response.map_err(|e| {
            record_outbound("error");
            failed(e.to_string())
        })?;

        let status = response.status();
        record_outbound(status.as_str());
        let body = self.read_limited(response).await.unwrap_or_default();
        let body_snippet: String = String::from_utf8_lossy(&body).chars().take(512).collect();

        Ok(PostResponse {
            status,
            body_snippet,
        })
    }

    async fn read_limited(
        &self,
        mut response: reqwest::Response,
    ) -> std::result::Result<Vec<u8>, String> {
        if let Some(length) = response.content_length() {
            if length as usize > self.max_size {
                return Err(format!("response of {} bytes exceeds limit", length));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            if body.len() + chunk.len() > self.max_size {
                return Err(format!("response exceeds {} bytes", self.max_size));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn check_destination(&self, url: &str) -> std::result::Result<(), String> {
        let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(format!("unsupported scheme {}", scheme)),
        }

        if self.allow_private_networks {
            return Ok(());
        }

        let host = parsed.host_str().ok_or("missing host")?;
        if is_disallowed_host(host) {
            return Err(format!("destination {} is not allowed", host));
        }

        let port = parsed.port_or_known_default().ok_or("missing port")?;
        validate_resolved_host_ips(host, port).await
    }
}

fn record_outbound(status: &str) {
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound", status])
        .inc();
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Resolve `host` and reject it when any address is private.
async fn validate_resolved_host_ips(host: &str, port: u16) -> std::result::Result<(), String> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| format!("failed to resolve {}: {}", host, e))?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(format!("{} resolves to a private address", host));
        }
    }

    if !resolved_any {
        return Err(format!("no DNS records for {}", host));
    }

    Ok(())
}
