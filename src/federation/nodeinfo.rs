//! NodeInfo discovery documents
//!
//! Parses the `/.well-known/nodeinfo` link document and the NodeInfo body
//! of a remote instance, and builds the documents this instance serves.

use serde::{Deserialize, Serialize};

use super::actor_id::SourceType;
use crate::error::{FederationError, Result};

pub const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// `/.well-known/nodeinfo` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoLinks {
    pub links: Vec<NodeInfoLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoLink {
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub href: String,
}

impl NodeInfoLinks {
    /// Absolute http(s) href of the first link.
    pub fn parse_href(body: &[u8]) -> Result<String> {
        let links: NodeInfoLinks = serde_json::from_slice(body).map_err(|e| {
            FederationError::RemoteUnavailable(format!("Invalid nodeinfo links: {}", e))
        })?;
        let href = links
            .links
            .first()
            .map(|link| link.href.trim())
            .filter(|href| !href.is_empty())
            .ok_or_else(|| {
                FederationError::RemoteUnavailable("Nodeinfo links carry no href".to_string())
            })?;

        let parsed = url::Url::parse(href).map_err(|e| {
            FederationError::RemoteUnavailable(format!("Invalid nodeinfo href {}: {}", href, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FederationError::RemoteUnavailable(format!(
                "Nodeinfo href {} is not http(s)",
                href
            )));
        }
        if parsed.host_str().is_none() {
            return Err(FederationError::RemoteUnavailable(format!(
                "Nodeinfo href {} has to be absolute",
                href
            )));
        }
        if parsed.query().is_some() {
            return Err(FederationError::RemoteUnavailable(format!(
                "Nodeinfo href {} may not contain a query",
                href
            )));
        }

        Ok(href.to_string())
    }
}

/// NodeInfo 2.1 document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub software: NodeInfoSoftware,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub services: NodeInfoServices,
    #[serde(default)]
    pub open_registrations: bool,
    #[serde(default)]
    pub usage: NodeInfoUsage,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoSoftware {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfoServices {
    #[serde(default)]
    pub inbound: Vec<String>,
    #[serde(default)]
    pub outbound: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    #[serde(default)]
    pub users: NodeInfoUsers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_posts: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_half_year: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_month: Option<i64>,
}

/// Software kind announced by a remote NodeInfo body.
///
/// Only the `software.name` field is read; unknown kinds are refused.
pub fn parse_software_kind(body: &[u8]) -> Result<SourceType> {
    #[derive(Deserialize)]
    struct Partial {
        software: Option<PartialSoftware>,
    }
    #[derive(Deserialize)]
    struct PartialSoftware {
        name: Option<String>,
    }

    let partial: Partial = serde_json::from_slice(body)
        .map_err(|e| FederationError::RemoteUnavailable(format!("Invalid nodeinfo: {}", e)))?;
    let name = partial
        .software
        .and_then(|software| software.name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            FederationError::RemoteUnavailable("Nodeinfo has no software name".to_string())
        })?;

    name.parse::<SourceType>().map_err(|_| {
        FederationError::RemoteUnavailable(format!("Unsupported software kind: {}", name))
    })
}

/// Links document advertising this instance's NodeInfo.
pub fn well_known_links(nodeinfo_url: &str) -> NodeInfoLinks {
    NodeInfoLinks {
        links: vec![NodeInfoLink {
            rel: NODEINFO_SCHEMA.to_string(),
            href: nodeinfo_url.to_string(),
        }],
    }
}

/// NodeInfo describing this instance.
pub fn local_nodeinfo(
    software_name: &str,
    instance_name: &str,
    total_users: Option<i64>,
) -> NodeInfo {
    NodeInfo {
        version: "2.1".to_string(),
        software: NodeInfoSoftware {
            name: software_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            repository: None,
            homepage: None,
        },
        protocols: vec!["activitypub".to_string()],
        services: NodeInfoServices::default(),
        open_registrations: false,
        usage: NodeInfoUsage {
            users: NodeInfoUsers {
                total: total_users,
                ..Default::default()
            },
            local_posts: None,
        },
        metadata: serde_json::json!({ "nodeName": instance_name }),
    }
}
