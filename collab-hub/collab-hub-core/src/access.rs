//! Document ownership, grants and public self-enrollment.
//!
//! [`AccessControl::resolve_role`] is the only place that turns the document
//! row and the grant table into a [`Role`]; every other authorization
//! decision in the hub consumes its result.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::model::{Document, Grant, Role};
use crate::storage::{AccessStore, ContentStore};

pub struct AccessControl {
    store: Arc<dyn AccessStore>,
    content: Arc<dyn ContentStore>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn AccessStore>, content: Arc<dyn ContentStore>) -> Self {
        Self { store, content }
    }

    pub fn store(&self) -> &Arc<dyn AccessStore> {
        &self.store
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Creates the document row and its empty content record.
    ///
    /// The content record is written first; it is unreachable until the
    /// document row exists, so a failure at either step leaves no visible
    /// document.
    pub async fn create_document(&self, title: Option<&str>, owner_id: &str) -> Result<Document> {
        let doc = Document::new(title, owner_id);
        self.content
            .create(doc.id, &Value::String(String::new()))
            .await?;
        if let Err(e) = self.store.insert_document(&doc).await {
            if let Err(cleanup) = self.content.remove(doc.id).await {
                warn!(document = %doc.id, "orphaned content record after failed create: {cleanup:#}");
            }
            return Err(e);
        }
        info!(document = %doc.id, owner = owner_id, "document created");
        Ok(doc)
    }

    pub async fn resolve_role(&self, document_id: Uuid, user_id: &str) -> Result<Option<Role>> {
        let Some(doc) = self.store.document(document_id).await? else {
            return Ok(None);
        };
        if doc.owner_id == user_id {
            return Ok(Some(Role::Owner));
        }
        Ok(self
            .store
            .grant(document_id, user_id)
            .await?
            .map(|g| g.role))
    }

    /// Inserts a grant. Never upserts: an existing pair yields `Conflict`.
    pub async fn grant_permission(
        &self,
        document_id: Uuid,
        user_id: &str,
        role: Role,
    ) -> Result<Grant> {
        if !role.is_grantable() {
            return Err(HubError::invalid("the owner role cannot be granted"));
        }
        let doc = self.require_document(document_id).await?;
        if doc.owner_id == user_id {
            return Err(HubError::invalid("the owner already has full access"));
        }
        let grant = Grant::new(document_id, user_id, role);
        self.store.insert_grant(&grant).await?;
        Ok(grant)
    }

    pub async fn revoke_permission(&self, document_id: Uuid, user_id: &str) -> Result<bool> {
        let doc = self.require_document(document_id).await?;
        if doc.owner_id == user_id {
            return Err(HubError::invalid("the owner's access cannot be removed"));
        }
        if !self.store.delete_grant(document_id, user_id).await? {
            return Err(HubError::not_found("this user has no access to the document"));
        }
        Ok(true)
    }

    pub async fn set_visibility(&self, document_id: Uuid, is_public: bool) -> Result<()> {
        if !self.store.set_public(document_id, is_public).await? {
            return Err(HubError::not_found("No document found with that ID"));
        }
        Ok(())
    }

    /// Grants `viewer` on a public document to a caller without a role.
    ///
    /// A caller who already holds a role gets it back unchanged. Two racing
    /// first-time enrollments both succeed; the loser's duplicate-grant
    /// conflict is treated as success.
    pub async fn self_enroll(&self, document_id: Uuid, user_id: &str) -> Result<Role> {
        let doc = self.require_document(document_id).await?;
        if let Some(role) = self.resolve_role(document_id, user_id).await? {
            return Ok(role);
        }
        if !doc.is_public {
            return Err(HubError::forbidden("this document is not public"));
        }
        match self.grant_permission(document_id, user_id, Role::Viewer).await {
            Ok(_) => {
                info!(document = %document_id, user = user_id, "self-enrolled as viewer");
                Ok(Role::Viewer)
            }
            Err(e) if e.is_conflict() => Ok(self
                .resolve_role(document_id, user_id)
                .await?
                .unwrap_or(Role::Viewer)),
            Err(e) => Err(e),
        }
    }

    pub async fn documents_for_user(&self, user_id: &str) -> Result<Vec<Document>> {
        self.store.documents_for_user(user_id).await
    }

    /// The document, if the caller holds any role on it.
    pub async fn document_for_user(&self, document_id: Uuid, user_id: &str) -> Result<(Document, Role)> {
        let doc = self.require_document(document_id).await?;
        match self.resolve_role(document_id, user_id).await? {
            Some(role) => Ok((doc, role)),
            None => Err(HubError::not_found("No document found with that ID")),
        }
    }

    pub async fn update_title(&self, document_id: Uuid, user_id: &str, title: &str) -> Result<Document> {
        let title = title.trim();
        if title.is_empty() {
            return Err(HubError::invalid("Title is required for an update."));
        }
        self.require_owner(document_id, user_id).await?;
        self.store
            .update_title(document_id, title)
            .await?
            .ok_or_else(|| HubError::not_found("No document found with that ID"))
    }

    pub async fn delete_document(&self, document_id: Uuid, user_id: &str) -> Result<()> {
        self.require_owner(document_id, user_id).await?;
        if !self.store.delete_document(document_id).await? {
            return Err(HubError::not_found("No document found with that ID"));
        }
        if let Err(e) = self.content.remove(document_id).await {
            warn!(document = %document_id, "failed to remove content of deleted document: {e:#}");
        }
        info!(document = %document_id, "document deleted");
        Ok(())
    }

    /// Grants on the document, visible to any role holder.
    pub async fn list_permissions(&self, document_id: Uuid, user_id: &str) -> Result<Vec<Grant>> {
        self.document_for_user(document_id, user_id).await?;
        self.store.grants(document_id).await
    }

    /// Owner-only wrapper around [`AccessControl::revoke_permission`].
    pub async fn remove_permission(&self, document_id: Uuid, caller_id: &str, user_id: &str) -> Result<()> {
        self.require_owner(document_id, caller_id).await?;
        self.revoke_permission(document_id, user_id).await?;
        Ok(())
    }

    /// Owner-only wrapper around [`AccessControl::set_visibility`].
    pub async fn set_public(&self, document_id: Uuid, caller_id: &str, is_public: bool) -> Result<()> {
        self.require_owner(document_id, caller_id).await?;
        self.set_visibility(document_id, is_public).await
    }

    pub(crate) async fn require_owner(&self, document_id: Uuid, user_id: &str) -> Result<Document> {
        let (doc, role) = self.document_for_user(document_id, user_id).await?;
        if role != Role::Owner {
            return Err(HubError::forbidden(
                "only the owner of this document can perform this action",
            ));
        }
        Ok(doc)
    }

    async fn require_document(&self, document_id: Uuid) -> Result<Document> {
        self.store
            .document(document_id)
            .await?
            .ok_or_else(|| HubError::not_found("No document found with that ID"))
    }
}
