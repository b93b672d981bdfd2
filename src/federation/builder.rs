//! Outbound JSON-LD documents
//!
//! Activities this instance sends, the actor documents it serves, and the
//! rendering of local user actions into Notes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::activity::PUBLIC_COLLECTION;
use super::urls::{inbox_of, main_key_id};

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const FORGEFED_CONTEXT: &str = "https://forgefed.org/ns";

fn context() -> Value {
    json!([ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT])
}

fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Like of a remote repository.
pub fn like(actor: &str, object: &str, start_time: DateTime<Utc>) -> Value {
    json!({
        "@context": context(),
        "type": "Like",
        "actor": actor,
        "object": object,
        "startTime": timestamp(start_time),
    })
}

pub fn follow(id: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": context(),
        "id": id,
        "type": "Follow",
        "actor": actor,
        "object": object,
    })
}

/// Undo of a previously sent Follow.
pub fn undo_follow(id: &str, actor: &str, follow_id: &str, followed: &str) -> Value {
    json!({
        "@context": context(),
        "id": id,
        "type": "Undo",
        "actor": actor,
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": actor,
            "object": followed,
        },
    })
}

/// Accept answering a received Follow; `follow` is echoed unchanged.
pub fn accept(id: &str, actor: &str, follow: &Value) -> Value {
    let mut follow = follow.clone();
    if let Some(map) = follow.as_object_mut() {
        map.remove("@context");
    }
    json!({
        "@context": context(),
        "id": id,
        "type": "Accept",
        "actor": actor,
        "object": follow,
    })
}

/// Create wrapping a Note about a local user action.
///
/// Note id is `{actor}/activities/{action_id}`, the activity id appends `/activity`.
pub fn create_note(
    actor: &str,
    action_id: i64,
    content: &str,
    published: DateTime<Utc>,
) -> Value {
    let note_id = format!("{}/activities/{}", actor, action_id);
    let followers = format!("{}/followers", actor);
    let published = timestamp(published);

    json!({
        "@context": context(),
        "id": format!("{}/activity", note_id),
        "type": "Create",
        "actor": actor,
        "published": published,
        "to": [PUBLIC_COLLECTION],
        "cc": [followers],
        "object": {
            "id": note_id,
            "type": "Note",
            "attributedTo": actor,
            "content": content,
            "url": note_id,
            "published": published,
            "to": [PUBLIC_COLLECTION],
            "cc": [followers],
        },
    })
}

fn public_key(actor: &str, public_key_pem: &str) -> Value {
    json!({
        "id": main_key_id(actor),
        "owner": actor,
        "publicKeyPem": public_key_pem,
    })
}

/// Person document of a local user.
pub fn person_document(
    actor: &str,
    username: &str,
    display_name: &str,
    public_key_pem: &str,
) -> Value {
    json!({
        "@context": context(),
        "id": actor,
        "type": "Person",
        "preferredUsername": username,
        "name": display_name,
        "inbox": inbox_of(actor),
        "outbox": format!("{}/outbox", actor),
        "followers": format!("{}/followers", actor),
        "publicKey": public_key(actor, public_key_pem),
    })
}

/// Item-less OrderedCollection that only reports its size.
pub fn ordered_collection(id: &str, total_items: usize) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total_items,
    })
}

/// Service actor used for instance-level signed fetches.
pub fn application_document(actor: &str, name: &str, public_key_pem: &str) -> Value {
    json!({
        "@context": context(),
        "id": actor,
        "type": "Application",
        "preferredUsername": name,
        "name": name,
        "inbox": inbox_of(actor),
        "publicKey": public_key(actor, public_key_pem),
    })
}

pub fn repository_document(actor: &str, name: &str, owner_actor: &str) -> Value {
    json!({
        "@context": [ACTIVITYSTREAMS_CONTEXT, FORGEFED_CONTEXT],
        "id": actor,
        "type": "Repository",
        "name": name,
        "attributedTo": owner_actor,
        "inbox": inbox_of(actor),
    })
}

// =============================================================================
// User actions
// =============================================================================

/// A local user's action, as announced to remote followers
#[derive(Debug, Clone)]
pub struct UserAction {
    pub id: i64,
    pub actor_html_url: String,
    pub actor_display_name: String,
    pub repo: Option<ActionRepo>,
    pub kind: UserActionKind,
}

#[derive(Debug, Clone)]
pub struct ActionRepo {
    pub html_url: String,
    /// `owner/name`
    pub full_name: String,
    pub is_private: bool,
    /// Owner is private or keeps its activity private
    pub owner_private: bool,
}

#[derive(Debug, Clone)]
pub struct IssueRef {
    pub html_url: String,
    pub index: i64,
}

#[derive(Debug, Clone)]
pub struct PushedCommit {
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum UserActionKind {
    CreateRepo,
    RenameRepo,
    StarRepo,
    WatchRepo,
    TransferRepo,
    Push {
        branch: String,
        ref_link: String,
        commits: Vec<PushedCommit>,
    },
    PushTag {
        tag: String,
        ref_link: String,
    },
    DeleteTag {
        tag: String,
    },
    DeleteBranch {
        branch: String,
    },
    CreateIssue(IssueRef),
    CloseIssue(IssueRef),
    ReopenIssue(IssueRef),
    CreatePullRequest(IssueRef),
    MergePullRequest(IssueRef),
    ClosePullRequest(IssueRef),
    ReopenPullRequest(IssueRef),
    ApprovePullRequest(IssueRef),
    RejectPullRequest(IssueRef),
    Comment {
        issue: IssueRef,
        comment_url: String,
        /// Already rendered HTML
        comment_html: String,
    },
    Other(String),
}

impl UserAction {
    /// HTML content of the Note announcing this action.
    pub fn render(&self) -> String {
        let repo_link = || match &self.repo {
            Some(repo) => link(&repo.html_url, &repo.full_name),
            None => String::new(),
        };
        let issue_link = |issue: &IssueRef| {
            let path = self
                .repo
                .as_ref()
                .map(|repo| repo.full_name.as_str())
                .unwrap_or_default();
            link(&issue.html_url, &format!("{}#{}", path, issue.index))
        };

        let sentence = match &self.kind {
            UserActionKind::CreateRepo => format!("created a new repository: {}", repo_link()),
            UserActionKind::RenameRepo => format!("renamed a repository: {}", repo_link()),
            UserActionKind::StarRepo => format!("starred a repository: {}", repo_link()),
            UserActionKind::WatchRepo => {
                format!("started watching a repository: {}", repo_link())
            }
            UserActionKind::TransferRepo => format!("transferred {}", repo_link()),
            UserActionKind::Push {
                branch,
                ref_link,
                commits,
            } => {
                let repo_url = self
                    .repo
                    .as_ref()
                    .map(|repo| repo.html_url.as_str())
                    .unwrap_or_default();
                let items: String = commits
                    .iter()
                    .map(|commit| {
                        format!(
                            "<li>{} <pre>{}</pre></li>",
                            link(&format!("{}/commit/{}", repo_url, commit.sha), &commit.sha),
                            html_escape::encode_text(&commit.message)
                        )
                    })
                    .collect();
                format!(
                    "pushed to {} at {}: <ul>{}</ul>",
                    link(ref_link, branch),
                    repo_link(),
                    items
                )
            }
            UserActionKind::PushTag { tag, ref_link } => {
                format!("pushed {} at {}", link(ref_link, tag), repo_link())
            }
            UserActionKind::DeleteTag { tag } => format!(
                "deleted tag {} at {}",
                html_escape::encode_text(tag),
                repo_link()
            ),
            UserActionKind::DeleteBranch { branch } => format!(
                "deleted branch {} at {}",
                html_escape::encode_text(branch),
                repo_link()
            ),
            UserActionKind::CreateIssue(issue) => format!("opened issue {}", issue_link(issue)),
            UserActionKind::CloseIssue(issue) => format!("closed issue {}", issue_link(issue)),
            UserActionKind::ReopenIssue(issue) => format!("reopened issue {}", issue_link(issue)),
            UserActionKind::CreatePullRequest(issue) => {
                format!("opened pull request {}", issue_link(issue))
            }
            UserActionKind::MergePullRequest(issue) => {
                format!("merged pull request {}", issue_link(issue))
            }
            UserActionKind::ClosePullRequest(issue) => {
                format!("closed pull request {}", issue_link(issue))
            }
            UserActionKind::ReopenPullRequest(issue) => {
                format!("reopened pull request {}", issue_link(issue))
            }
            UserActionKind::ApprovePullRequest(issue) => {
                format!("approved pull request {}", issue_link(issue))
            }
            UserActionKind::RejectPullRequest(issue) => {
                format!("rejected pull request {}", issue_link(issue))
            }
            UserActionKind::Comment {
                issue,
                comment_url,
                comment_html,
            } => format!(
                "{} on {}: <blockquote>{}</blockquote>",
                link(comment_url, "commented"),
                issue_link(issue),
                comment_html
            ),
            UserActionKind::Other(name) => format!(
                "performed an unrecognised action: {}",
                html_escape::encode_text(name)
            ),
        };

        format!(
            "{} {}",
            link(&self.actor_html_url, &self.actor_display_name),
            sentence
        )
    }

    /// Private repositories and owners are never announced.
    pub fn is_public(&self) -> bool {
        self.repo
            .as_ref()
            .map(|repo| !repo.is_private && !repo.owner_private)
            .unwrap_or(true)
    }
}

fn link(href: &str, text: &str) -> String {
    format!(
        r#"<a href="{}" rel="nofollow">{}</a>"#,
        html_escape::encode_double_quoted_attribute(href),
        html_escape::encode_text(text)
    )
}
