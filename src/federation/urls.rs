//! URLs of this instance's own ActivityPub objects

/// Builds actor and inbox URLs under the instance base URL
#[derive(Debug, Clone)]
pub struct LocalUrls {
    base_url: String,
}

impl LocalUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Host name of the instance, without port.
    pub fn host(&self) -> String {
        url::Url::parse(&self.base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.base_url.clone())
    }

    /// Service actor used for instance-level signed fetches.
    pub fn instance_actor(&self) -> String {
        format!("{}/api/v1/activitypub/actor", self.base_url)
    }

    pub fn person_actor(&self, user_id: i64) -> String {
        format!("{}/api/v1/activitypub/user-id/{}", self.base_url, user_id)
    }

    pub fn repository_actor(&self, repo_id: i64) -> String {
        format!(
            "{}/api/v1/activitypub/repository-id/{}",
            self.base_url, repo_id
        )
    }

    pub fn nodeinfo(&self) -> String {
        format!("{}/api/v1/nodeinfo", self.base_url)
    }
}

/// `{actor}#main-key`
pub fn main_key_id(actor_uri: &str) -> String {
    format!("{}#main-key", actor_uri)
}

/// `{actor}/inbox`
pub fn inbox_of(actor_uri: &str) -> String {
    format!("{}/inbox", actor_uri)
}
