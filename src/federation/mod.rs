//! ActivityPub federation module
//!
//! Handles:
//! - Actor identity parsing
//! - Federation host discovery (NodeInfo)
//! - HTTP Signatures and public key caching
//! - Inbound activity processing
//! - Outbound delivery through durable queues

mod activity;
mod actor_id;
pub mod builder;
mod client;
mod delivery;
mod host_registry;
mod key_cache;
mod keys;
mod nodeinfo;
mod processor;
mod queue;
mod signature;
mod urls;
mod verifier;

pub use activity::{
    AcceptActivity, ApObject, CreateActivity, FollowActivity, InboundActivity, LikeActivity,
    NoteObject, ObjectRef, PUBLIC_COLLECTION, UndoActivity,
};
pub use actor_id::{ActorId, PersonId, RepositoryId, SourceType};
pub use builder::{ActionRepo, IssueRef, PushedCommit, UserAction, UserActionKind};
pub use client::{ACTIVITY_JSON, ActivityPubClient, PostResponse};
pub use delivery::{
    DELIVERY_QUEUE, DeliveryItem, DeliveryQueues, FederationRuntime, PENDING_QUEUE, PendingItem,
    REFRESH_QUEUE, RefreshItem,
};
pub use host_registry::{
    FederationHostRegistry, MAX_FUTURE_SKEW_MINUTES, host_source, validate_latest_activity,
};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use keys::{KeyProvider, Signer, StoredKeyProvider, generate_key_pair};
pub use nodeinfo::{
    NODEINFO_SCHEMA, NodeInfo, NodeInfoLink, NodeInfoLinks, local_nodeinfo, parse_software_kind,
    well_known_links,
};
pub use processor::{ActivityProcessor, InboxOutcome, ProcessorDeps};
pub use queue::{QueueHandler, UniqueQueue, unique_key};
pub use signature::{
    SignatureAlgorithm, SignatureHeaders, VerifyOptions, extract_signature_key_id,
    generate_digest, parse_signature_header, sign_request, verify_signature,
};
pub use urls::{LocalUrls, inbox_of, main_key_id};
pub use verifier::SignatureVerifier;
