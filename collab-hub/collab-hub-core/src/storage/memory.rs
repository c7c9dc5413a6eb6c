//! In-process implementations of the storage traits.
//!
//! The access store keeps all tables behind one mutex; every trait method is
//! one critical section, which gives the same serialization a row lock gives
//! a relational backend. No guard is held across an `.await`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

use super::{AccessStore, CacheStore, ContentStore, DocumentContent, UserDirectory};
use crate::error::{HubError, Result};
use crate::model::{Document, Grant, Invitation, InvitationStatus, User};

#[derive(Default)]
struct Tables {
    documents: HashMap<Uuid, Document>,
    grants: HashMap<(Uuid, String), Grant>,
    // insertion order doubles as creation order
    invitations: Vec<Invitation>,
}

#[derive(Default)]
pub struct MemoryAccessStore {
    tables: Mutex<Tables>,
}

impl MemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessStore for MemoryAccessStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.documents.contains_key(&doc.id) {
            return Err(HubError::conflict("document already exists"));
        }
        tables.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.tables.lock().documents.get(&id).cloned())
    }

    async fn documents_for_user(&self, user_id: &str) -> Result<Vec<Document>> {
        let tables = self.tables.lock();
        let mut docs: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| {
                d.owner_id == user_id
                    || tables.grants.contains_key(&(d.id, user_id.to_string()))
            })
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(docs)
    }

    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Document>> {
        let mut tables = self.tables.lock();
        Ok(tables.documents.get_mut(&id).map(|doc| {
            doc.title = title.to_string();
            doc.updated_at = Utc::now();
            doc.clone()
        }))
    }

    async fn set_public(&self, id: Uuid, is_public: bool) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.documents.get_mut(&id) {
            Some(doc) => {
                doc.is_public = is_public;
                doc.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock();
        if tables.documents.remove(&id).is_none() {
            return Ok(false);
        }
        tables.grants.retain(|(doc_id, _), _| *doc_id != id);
        tables.invitations.retain(|inv| inv.document_id != id);
        Ok(true)
    }

    async fn insert_grant(&self, grant: &Grant) -> Result<()> {
        let mut tables = self.tables.lock();
        let key = (grant.document_id, grant.user_id.clone());
        if tables.grants.contains_key(&key) {
            return Err(HubError::conflict("user already has access to this document"));
        }
        tables.grants.insert(key, grant.clone());
        Ok(())
    }

    async fn grant(&self, document_id: Uuid, user_id: &str) -> Result<Option<Grant>> {
        let tables = self.tables.lock();
        Ok(tables.grants.get(&(document_id, user_id.to_string())).cloned())
    }

    async fn grants(&self, document_id: Uuid) -> Result<Vec<Grant>> {
        let tables = self.tables.lock();
        let mut grants: Vec<Grant> = tables
            .grants
            .values()
            .filter(|g| g.document_id == document_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(grants)
    }

    async fn delete_grant(&self, document_id: Uuid, user_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        Ok(tables
            .grants
            .remove(&(document_id, user_id.to_string()))
            .is_some())
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()> {
        let mut tables = self.tables.lock();
        let duplicate = tables.invitations.iter().any(|inv| {
            inv.document_id == invitation.document_id
                && inv.invitee_id == invitation.invitee_id
                && inv.status == InvitationStatus::Pending
        });
        if duplicate {
            return Err(HubError::conflict(
                "a pending invitation already exists for this user",
            ));
        }
        tables.invitations.push(invitation.clone());
        Ok(())
    }

    async fn accept_invitation(&self, id: Uuid, invitee_id: &str) -> Result<Invitation> {
        let mut tables = self.tables.lock();
        let Tables {
            grants,
            invitations,
            ..
        } = &mut *tables;
        let invitation = invitations
            .iter_mut()
            .find(|inv| {
                inv.id == id
                    && inv.invitee_id == invitee_id
                    && inv.status == InvitationStatus::Pending
            })
            .ok_or_else(|| {
                HubError::not_found("Invitation not found or has already been acted upon")
            })?;
        let key = (invitation.document_id, invitation.invitee_id.clone());
        if grants.contains_key(&key) {
            return Err(HubError::conflict("user already has access to this document"));
        }
        grants.insert(
            key,
            Grant::new(invitation.document_id, &invitation.invitee_id, invitation.role),
        );
        invitation.status = InvitationStatus::Accepted;
        Ok(invitation.clone())
    }

    async fn decline_invitation(&self, id: Uuid, invitee_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.invitations.iter_mut().find(|inv| {
            inv.id == id && inv.invitee_id == invitee_id && inv.status == InvitationStatus::Pending
        }) {
            Some(inv) => {
                inv.status = InvitationStatus::Declined;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_invitations(&self, invitee_id: &str) -> Result<Vec<(Invitation, String)>> {
        let tables = self.tables.lock();
        Ok(tables
            .invitations
            .iter()
            .filter(|inv| inv.invitee_id == invitee_id && inv.status == InvitationStatus::Pending)
            .filter_map(|inv| {
                tables
                    .documents
                    .get(&inv.document_id)
                    .map(|doc| (inv.clone(), doc.title.clone()))
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryContentStore {
    records: Mutex<HashMap<Uuid, DocumentContent>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn create(&self, document_id: Uuid, content: &Value) -> anyhow::Result<()> {
        self.records
            .lock()
            .insert(document_id, DocumentContent::new(document_id, content.clone()));
        Ok(())
    }

    async fn load(&self, document_id: Uuid) -> anyhow::Result<Option<DocumentContent>> {
        Ok(self.records.lock().get(&document_id).cloned())
    }

    async fn save(&self, document_id: Uuid, content: &Value) -> anyhow::Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(&document_id) {
            Some(record) => {
                record.content = content.clone();
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, document_id: Uuid) -> anyhow::Result<()> {
        self.records.lock().remove(&document_id);
        Ok(())
    }
}

/// Cache used when no Redis URL is configured and in tests.
#[derive(Default)]
pub struct MemoryCache {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored under a list key.
    pub fn list_len(&self, key: &str) -> usize {
        self.lists.lock().get(key).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_add(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut sets = self.sets.lock();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> anyhow::Result<()> {
        let mut lists = self.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        while list.len() > cap {
            list.pop_front();
        }
        Ok(())
    }

    async fn list_tail(&self, key: &str, n: usize) -> anyhow::Result<Vec<String>> {
        let lists = self.lists.lock();
        Ok(lists
            .get(key)
            .map(|list| {
                let skip = list.len().saturating_sub(n);
                list.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }
}

/// Users learned from verified tokens.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<String, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let dir = Self::new();
        {
            let mut map = dir.users.lock();
            for user in users {
                map.insert(user.id.clone(), user);
            }
        }
        dir
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn remember(&self, user: &User) -> anyhow::Result<()> {
        self.users.lock().insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.users.lock().get(id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| u.username == username)
            .cloned())
    }
}
