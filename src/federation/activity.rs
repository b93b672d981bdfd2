//! Inbound activities
//!
//! Request bodies are decoded once, at the inbox boundary, into the closed
//! [`InboundActivity`] union. Everything after that point works on typed
//! values; structural problems never get past [`InboundActivity::decode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FederationError, Rejection};

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// An embedded object or a bare link to one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Link(String),
    Object(ApObject),
}

impl ObjectRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Link(link) => Some(link.as_str()),
            ObjectRef::Object(object) => object.id.as_deref(),
        }
        .map(str::trim)
        .filter(|id| !id.is_empty())
    }

    /// Declared type; links carry none.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ObjectRef::Link(_) => None,
            ObjectRef::Object(object) => object.kind.as_deref(),
        }
    }
}

/// Loosely typed ActivityStreams object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl ApObject {
    fn str_field(&self, name: &str) -> Option<&str> {
        self.rest.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<Value>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values
                .into_iter()
                .filter_map(|value| match value {
                    Value::String(s) => Some(s),
                    Value::Object(map) => map.get("id").and_then(Value::as_str).map(String::from),
                    _ => None,
                })
                .collect(),
        }
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .collect()
    }
}

/// Wire shape shared by every activity type
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActivity {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    actor: Option<ObjectRef>,
    #[serde(default)]
    object: Option<ObjectRef>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    to: OneOrMany,
    #[serde(default)]
    cc: OneOrMany,
}

/// Like of a local repository
#[derive(Debug, Clone)]
pub struct LikeActivity {
    pub id: Option<String>,
    pub actor: String,
    pub object: String,
    pub start_time: DateTime<Utc>,
}

/// Follow of a local user
#[derive(Debug, Clone)]
pub struct FollowActivity {
    pub id: Option<String>,
    pub actor: String,
    pub object: String,
    /// The Follow as received, echoed back in the Accept
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct UndoActivity {
    pub actor: String,
    /// The undone Follow
    pub object: ObjectRef,
}

#[derive(Debug, Clone)]
pub struct AcceptActivity {
    pub actor: String,
    pub object: ObjectRef,
}

/// Note published by a followed remote user
#[derive(Debug, Clone)]
pub struct CreateActivity {
    pub id: String,
    pub actor: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub note: NoteObject,
}

#[derive(Debug, Clone)]
pub struct NoteObject {
    pub id: Option<String>,
    /// HTML content as received, not yet sanitized
    pub content: String,
    pub url: Option<String>,
    pub raw: Value,
}

impl NoteObject {
    /// Link to the note for display: `url`, falling back to `id`.
    pub fn link(&self) -> &str {
        self.url
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or_default()
    }
}

/// Every activity an inbox accepts
#[derive(Debug, Clone)]
pub enum InboundActivity {
    Like(LikeActivity),
    Follow(FollowActivity),
    Undo(UndoActivity),
    Accept(AcceptActivity),
    Create(CreateActivity),
}

impl InboundActivity {
    /// Decode and structurally validate an inbox body.
    pub fn decode(body: &[u8]) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| invalid("Invalid activity", format!("Malformed JSON: {}", e)))?;
        let raw: RawActivity = serde_json::from_value(value.clone())
            .map_err(|e| invalid("Invalid activity", format!("Malformed activity: {}", e)))?;

        let kind = raw
            .kind
            .clone()
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| invalid("Invalid activity", "Missing type"))?;

        match kind.as_str() {
            "Like" => Self::like(raw),
            "Follow" => Self::follow(raw, value),
            "Undo" => Self::undo(raw),
            "Accept" => Self::accept(raw),
            "Create" => Self::create(raw),
            other => Err(invalid(
                "Unsupported activity",
                format!("Unsupported activity type: {}", other),
            )),
        }
    }

    /// Activity type name, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundActivity::Like(_) => "Like",
            InboundActivity::Follow(_) => "Follow",
            InboundActivity::Undo(_) => "Undo",
            InboundActivity::Accept(_) => "Accept",
            InboundActivity::Create(_) => "Create",
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            InboundActivity::Like(a) => &a.actor,
            InboundActivity::Follow(a) => &a.actor,
            InboundActivity::Undo(a) => &a.actor,
            InboundActivity::Accept(a) => &a.actor,
            InboundActivity::Create(a) => &a.actor,
        }
    }

    fn like(raw: RawActivity) -> Result<Self, Rejection> {
        let actor = required_id(raw.actor.as_ref(), "actor")?;
        let object = required_id(raw.object.as_ref(), "object")?;
        let start_time = raw
            .start_time
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid("Invalid activity", "Missing startTime"))?;
        let start_time = DateTime::parse_from_rfc3339(start_time)
            .map_err(|e| invalid("Invalid activity", format!("Invalid startTime: {}", e)))?
            .with_timezone(&Utc);

        Ok(InboundActivity::Like(LikeActivity {
            id: raw.id,
            actor,
            object,
            start_time,
        }))
    }

    fn follow(raw: RawActivity, value: Value) -> Result<Self, Rejection> {
        let actor = raw
            .actor
            .as_ref()
            .and_then(ObjectRef::id)
            .map(String::from)
            .ok_or_else(|| invalid("Missing actor", "Follow carries no actor"))?;
        let object = required_id(raw.object.as_ref(), "object")?;

        Ok(InboundActivity::Follow(FollowActivity {
            id: raw.id,
            actor,
            object,
            raw: value,
        }))
    }

    fn undo(raw: RawActivity) -> Result<Self, Rejection> {
        let actor = required_id(raw.actor.as_ref(), "actor")?;
        let object = wrapped_follow(raw.object, "Invalid object type for Undo activity")?;
        Ok(InboundActivity::Undo(UndoActivity { actor, object }))
    }

    fn accept(raw: RawActivity) -> Result<Self, Rejection> {
        let actor = required_id(raw.actor.as_ref(), "actor")?;
        let object = wrapped_follow(raw.object, "Invalid object type for Accept activity")?;
        Ok(InboundActivity::Accept(AcceptActivity { actor, object }))
    }

    fn create(raw: RawActivity) -> Result<Self, Rejection> {
        let label = "Invalid user activity";
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid(label, "Missing id"))?;
        let actor = raw
            .actor
            .as_ref()
            .and_then(ObjectRef::id)
            .map(String::from)
            .ok_or_else(|| invalid(label, "Missing actor"))?;
        let to = raw.to.into_vec();
        if to.is_empty() {
            return Err(invalid(label, "Missing to"));
        }
        let cc = raw.cc.into_vec();
        if cc.is_empty() {
            return Err(invalid(label, "Missing cc"));
        }

        let object = match raw.object {
            Some(ObjectRef::Object(object)) if object.kind.as_deref() == Some("Note") => object,
            other => {
                return Err(invalid(
                    "Invalid object type for Create activity",
                    format!(
                        "Expected a Note, got {}",
                        other
                            .as_ref()
                            .and_then(ObjectRef::kind)
                            .unwrap_or("nothing")
                    ),
                ));
            }
        };

        let content = object
            .str_field("content")
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .map(String::from)
            .ok_or_else(|| invalid(label, "Note has no content"))?;
        let url = object.str_field("url").map(String::from);
        let note_raw = serde_json::to_value(&object)
            .map_err(|e| invalid(label, format!("Unserializable note: {}", e)))?;

        Ok(InboundActivity::Create(CreateActivity {
            id,
            actor,
            to,
            cc,
            note: NoteObject {
                id: object.id,
                content,
                url,
                raw: note_raw,
            },
        }))
    }
}

fn invalid(label: &'static str, message: impl Into<String>) -> Rejection {
    Rejection::from_error(label, FederationError::ValidationFailed(message.into()))
}

fn required_id(object: Option<&ObjectRef>, field: &str) -> Result<String, Rejection> {
    object
        .and_then(ObjectRef::id)
        .map(String::from)
        .ok_or_else(|| invalid("Invalid activity", format!("Missing {}", field)))
}

fn wrapped_follow(object: Option<ObjectRef>, label: &'static str) -> Result<ObjectRef, Rejection> {
    match object {
        Some(object) if object.kind() == Some("Follow") => Ok(object),
        other => Err(invalid(
            label,
            format!(
                "Expected a wrapped Follow, got {}",
                other.as_ref().and_then(ObjectRef::kind).unwrap_or("nothing")
            ),
        )),
    }
}
