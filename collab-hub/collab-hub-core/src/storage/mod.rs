//! Backend seams of the hub.
//!
//! - [`AccessStore`]: durable documents, grants and invitations (relational).
//! - [`ContentStore`]: one opaque JSON blob per document.
//! - [`CacheStore`]: ephemeral sets and capped lists (presence, chat).
//! - [`UserDirectory`]: id/username lookups backed by the credential store.
//!
//! Every component receives these as `Arc<dyn …>` in its constructor.

pub mod cache;
pub mod content;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Document, Grant, Invitation, User};

pub use cache::RedisCache;
pub use content::FileContentStore;
pub use memory::{MemoryAccessStore, MemoryCache, MemoryContentStore, MemoryUserDirectory};
pub use sqlite::SqliteStore;

/// Relational store for documents, grants and invitations.
///
/// Implementations must make each method a single transaction. In particular
/// [`AccessStore::accept_invitation`] must lock the matching invitation row
/// so concurrent accepts of the same invitation serialize.
#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;
    async fn document(&self, id: Uuid) -> Result<Option<Document>>;
    /// Documents the user owns or holds a grant on.
    async fn documents_for_user(&self, user_id: &str) -> Result<Vec<Document>>;
    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Document>>;
    async fn set_public(&self, id: Uuid, is_public: bool) -> Result<bool>;
    /// Removes the document together with its grants and invitations.
    async fn delete_document(&self, id: Uuid) -> Result<bool>;

    /// Fails with `Conflict` when a grant already exists for the pair.
    async fn insert_grant(&self, grant: &Grant) -> Result<()>;
    async fn grant(&self, document_id: Uuid, user_id: &str) -> Result<Option<Grant>>;
    async fn grants(&self, document_id: Uuid) -> Result<Vec<Grant>>;
    async fn delete_grant(&self, document_id: Uuid, user_id: &str) -> Result<bool>;

    /// Fails with `Conflict` when a pending invitation exists for the same
    /// `(document, invitee)` pair.
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()>;
    /// Locks `(id, invitee, pending)`, inserts the grant and marks the
    /// invitation accepted in one transaction. `NotFound` when no such row,
    /// `Conflict` (rolled back) when the grant already exists.
    async fn accept_invitation(&self, id: Uuid, invitee_id: &str) -> Result<Invitation>;
    /// Conditional update; returns whether a row changed.
    async fn decline_invitation(&self, id: Uuid, invitee_id: &str) -> Result<bool>;
    /// Pending invitations for the invitee with their document titles, in
    /// creation order.
    async fn pending_invitations(&self, invitee_id: &str) -> Result<Vec<(Invitation, String)>>;
}

/// Durable content record of one document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DocumentContent {
    pub document_id: Uuid,
    pub content: Value,
    pub updated_at: DateTime<Utc>,
}

impl DocumentContent {
    pub fn new(document_id: Uuid, content: Value) -> Self {
        Self {
            document_id,
            content,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(&self, document_id: Uuid, content: &Value) -> anyhow::Result<()>;
    async fn load(&self, document_id: Uuid) -> anyhow::Result<Option<DocumentContent>>;
    /// Overwrites an existing record. Returns `false` when there is none.
    async fn save(&self, document_id: Uuid, content: &Value) -> anyhow::Result<bool>;
    async fn remove(&self, document_id: Uuid) -> anyhow::Result<()>;
}

/// Low-latency shared key/value store for ephemeral state.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_add(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn set_members(&self, key: &str) -> anyhow::Result<Vec<String>>;
    /// Appends `value` and keeps only the newest `cap` entries.
    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> anyhow::Result<()>;
    /// The newest `n` entries, oldest first.
    async fn list_tail(&self, key: &str, n: usize) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Records a user seen through a verified credential.
    async fn remember(&self, user: &User) -> anyhow::Result<()>;
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>>;
}
