//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification of the draft-cavage HTTP signature
//! scheme as spoken by Forgejo, Gitea and Mastodon.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use crate::error::FederationError;

/// Signature algorithms understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha256,
    RsaSha512,
    /// Algorithm derived from the key; RSA keys use SHA-256
    Hs2019,
}

impl SignatureAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rsa-sha256" => Some(Self::RsaSha256),
            "rsa-sha512" => Some(Self::RsaSha512),
            "hs2019" => Some(Self::Hs2019),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
            Self::RsaSha512 => "rsa-sha512",
            Self::Hs2019 => "hs2019",
        }
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Covers `(request-target)`, `host`, `date` and, when a body is present,
/// `digest`.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    algorithm: SignatureAlgorithm,
) -> Result<SignatureHeaders, FederationError> {
    let parsed_url = url::Url::parse(url)
        .map_err(|e| FederationError::ValidationFailed(format!("Invalid URL {}: {}", url, e)))?;

    let host = host_header_value(&parsed_url).ok_or_else(|| {
        FederationError::ValidationFailed(format!("Missing host in URL {}", url))
    })?;

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!(
            "(request-target): {} {}",
            method.to_lowercase(),
            path_and_query
        ),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| FederationError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;

    let mut rng = rand::thread_rng();
    let signature_bytes = match algorithm {
        SignatureAlgorithm::RsaSha512 => SigningKey::<Sha512>::new(private_key)
            .sign_with_rng(&mut rng, signing_string.as_bytes())
            .to_bytes(),
        SignatureAlgorithm::RsaSha256 | SignatureAlgorithm::Hs2019 => {
            SigningKey::<Sha256>::new(private_key)
                .sign_with_rng(&mut rng, signing_string.as_bytes())
                .to_bytes()
        }
    };

    let signature = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        algorithm.as_str(),
        headers_list.join(" "),
        BASE64.encode(signature_bytes)
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest,
    })
}

/// Value of the Host header reqwest sends for `url`.
fn host_header_value(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Knobs for [`verify_signature`]
#[derive(Debug, Clone)]
pub struct VerifyOptions<'a> {
    /// Algorithm names the instance accepts
    pub allowed_algorithms: &'a [String],
    /// Maximum distance between the Date header and now
    pub clock_skew_secs: i64,
}

/// Verify an HTTP request signature
///
/// # Returns
/// - `Ok(true)` when the signature checks out
/// - `Ok(false)` when the request is well-formed but the signature or
///   digest does not match
///
/// # Errors
/// `AuthenticationFailed` for structural problems: missing or malformed
/// headers, stale dates, unsupported algorithms, unreadable keys.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    options: &VerifyOptions<'_>,
) -> Result<bool, FederationError> {
    let parsed = parse_signature_header(signature_header(headers)?)?;

    let algorithm = SignatureAlgorithm::from_name(&parsed.algorithm)
        .filter(|_| {
            options
                .allowed_algorithms
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&parsed.algorithm))
        })
        .ok_or_else(|| {
            auth_failed(format!(
                "Unsupported signature algorithm: {}",
                parsed.algorithm
            ))
        })?;

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(auth_failed(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(auth_failed("Signed headers must include: digest"));
    }

    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| auth_failed("Invalid Date format"))?;
    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > options.clock_skew_secs {
        return Err(auth_failed("Date header too old or in future"));
    }

    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            tracing::debug!("Digest header does not match request body");
            return Ok(false);
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" | "content-length" => {
                header_str(headers, header_name)?.to_string()
            }
            other => {
                return Err(auth_failed(format!(
                    "Unsupported header in signature: {}",
                    other
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| auth_failed("Invalid signature encoding"))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| auth_failed(format!("Invalid signature format: {}", e)))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| auth_failed(format!("Invalid public key: {}", e)))?;

    let verified = match algorithm {
        SignatureAlgorithm::RsaSha512 => VerifyingKey::<Sha512>::new(public_key)
            .verify(signing_string.as_bytes(), &signature)
            .is_ok(),
        SignatureAlgorithm::RsaSha256 | SignatureAlgorithm::Hs2019 => {
            VerifyingKey::<Sha256>::new(public_key)
                .verify(signing_string.as_bytes(), &signature)
                .is_ok()
        }
    };

    Ok(verified)
}

fn auth_failed(message: impl Into<String>) -> FederationError {
    FederationError::AuthenticationFailed(message.into())
}

fn signature_header(headers: &http::HeaderMap) -> Result<&str, FederationError> {
    headers
        .get("signature")
        .ok_or_else(|| auth_failed("Missing Signature header"))?
        .to_str()
        .map_err(|_| auth_failed("Invalid Signature header"))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, FederationError> {
    headers
        .get(name)
        .ok_or_else(|| auth_failed(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| auth_failed(format!("Invalid {} header", name)))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, FederationError> {
    Ok(parse_signature_header(signature_header(headers)?)?.key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm name as sent
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to hs2019 and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, FederationError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| auth_failed("Missing keyId"))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| auth_failed("Missing signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}
