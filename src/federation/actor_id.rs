//! Actor identities
//!
//! Canonical actor URIs look like
//! `https://forge.example/api/v1/activitypub/user-id/30`: the last path
//! segment is the local id on the remote forge, everything before it is the
//! API path. Only URIs that re-serialize to exactly the same string are
//! accepted, so queries, fragments, doubled slashes and dot segments never
//! survive parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;

const PERSON_PATHS: &[&str] = &["api/v1/activitypub/user-id", "api/activitypub/user-id"];
const REPOSITORY_PATHS: &[&str] = &[
    "api/v1/activitypub/repository-id",
    "api/activitypub/repository-id",
];

/// Forge software we know how to federate with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Forgejo,
    Gitea,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Forgejo => "forgejo",
            SourceType::Gitea => "gitea",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forgejo" => Ok(SourceType::Forgejo),
            "gitea" => Ok(SourceType::Gitea),
            other => Err(FederationError::InvalidIdentity(format!(
                "unknown source type: {:?}",
                other
            ))),
        }
    }
}

/// A validated actor URI split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorId {
    id: String,
    source: Option<SourceType>,
    scheme: String,
    host: String,
    port: Option<String>,
    path: String,
    raw: String,
}

impl ActorId {
    /// Parse an actor URI without committing to a software kind.
    ///
    /// Used to find the host before its NodeInfo is known.
    pub fn parse(uri: &str) -> Result<Self, FederationError> {
        let invalid = |reason: &str| {
            FederationError::InvalidIdentity(format!("{:?}: {}", uri, reason))
        };

        if uri.trim().is_empty() {
            return Err(invalid("empty uri"));
        }

        let parsed = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            _ => return Err(invalid("scheme must be http or https")),
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("userinfo is not allowed"));
        }

        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }

        let host = match parsed.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(_)) | Some(url::Host::Ipv6(_)) => {
                return Err(invalid("IP literal hosts are not allowed"));
            }
            None => return Err(invalid("missing host")),
        };

        if raw_path(uri)
            .split('/')
            .any(|segment| segment == ".." || segment == ".")
        {
            return Err(invalid("relative path segments are not allowed"));
        }

        let mut segments: Vec<&str> = parsed
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let id = segments
            .pop()
            .ok_or_else(|| invalid("missing id segment"))?
            .to_string();
        let path = segments.join("/");
        if path.is_empty() {
            return Err(invalid("missing api path"));
        }

        let actor = Self {
            id,
            source: None,
            scheme: parsed.scheme().to_string(),
            host,
            port: explicit_port(uri),
            path,
            raw: uri.to_string(),
        };

        // Scheme and host come back lowercased; everything after must match byte for byte.
        let canonical = actor.as_uri();
        let origin_len = actor.origin().len();
        let round_trips = canonical.len() == actor.raw.len()
            && actor.raw.is_char_boundary(origin_len)
            && canonical[..origin_len].eq_ignore_ascii_case(&actor.raw[..origin_len])
            && canonical[origin_len..] == actor.raw[origin_len..];
        if !round_trips {
            return Err(invalid(&format!("not all input was parsed: {:?}", canonical)));
        }

        Ok(actor)
    }

    /// Parse an actor URI published by software of kind `source`.
    pub fn parse_with_source(uri: &str, source: &str) -> Result<Self, FederationError> {
        let source = source.parse::<SourceType>()?;
        let mut actor = Self::parse(uri)?;
        actor.source = Some(source);
        Ok(actor)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> Option<SourceType> {
        self.source
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        match &self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Rebuild the URI from its parts.
    pub fn as_uri(&self) -> String {
        format!("{}/{}/{}", self.origin(), self.path, self.id)
    }

    fn require_path(self, allowed: &[&str], kind: &str) -> Result<Self, FederationError> {
        let lower = self.path.to_lowercase();
        if allowed.iter().any(|candidate| *candidate == lower) {
            Ok(self)
        } else {
            Err(FederationError::InvalidIdentity(format!(
                "path {:?} is not a {} api path",
                self.path, kind
            )))
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Actor id of a remote user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonId(ActorId);

impl PersonId {
    pub fn parse(uri: &str, source: &str) -> Result<Self, FederationError> {
        ActorId::parse_with_source(uri, source)?
            .require_path(PERSON_PATHS, "person")
            .map(Self)
    }

    /// `@{id}@{host}`
    pub fn as_webfinger(&self) -> String {
        format!(
            "@{}@{}",
            self.0.id.to_lowercase(),
            self.0.host.to_lowercase()
        )
    }

    /// Login name for the local shadow user.
    pub fn as_login_name(&self) -> String {
        format!("{}{}", self.0.id.to_lowercase(), self.host_suffix())
    }

    /// Suffix appended to remote names to keep them apart from local ones.
    pub fn host_suffix(&self) -> String {
        format!("-{}", self.0.host.to_lowercase())
    }
}

impl std::ops::Deref for PersonId {
    type Target = ActorId;

    fn deref(&self) -> &ActorId {
        &self.0
    }
}

/// Actor id of a remote repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryId(ActorId);

impl RepositoryId {
    pub fn parse(uri: &str, source: &str) -> Result<Self, FederationError> {
        ActorId::parse_with_source(uri, source)?
            .require_path(REPOSITORY_PATHS, "repository")
            .map(Self)
    }
}

impl std::ops::Deref for RepositoryId {
    type Target = ActorId;

    fn deref(&self) -> &ActorId {
        &self.0
    }
}

/// Path portion of the raw input, before any normalization.
fn raw_path(uri: &str) -> &str {
    let after_scheme = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    match after_scheme.find('/') {
        Some(index) => &after_scheme[index..],
        None => "",
    }
}

/// Port as written in the input; `url` drops default ports, the raw form keeps them.
fn explicit_port(uri: &str) -> Option<String> {
    let after_scheme = uri.split_once("://")?.1;
    let authority = after_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()?;
    let (host_part, port) = authority.rsplit_once(':')?;
    if host_part.is_empty()
        || port.is_empty()
        || !port.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some(port.to_string())
}
