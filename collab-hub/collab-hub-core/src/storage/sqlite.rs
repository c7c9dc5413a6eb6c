//! SQLite-backed access store and user directory.
//!
//! One database file holds documents, grants, invitations and the users
//! learned from verified tokens. Foreign keys are enforced, so deleting a
//! document cascades to its grants and invitations. Schema version lives in
//! `PRAGMA user_version`.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{AccessStore, UserDirectory};
use crate::error::{HubError, Result};
use crate::model::{Document, Grant, Invitation, InvitationStatus, User};

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE documents (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    owner_id    TEXT NOT NULL,
    is_public   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX documents_by_owner ON documents(owner_id);

CREATE TABLE grants (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (document_id, user_id)
);
CREATE INDEX grants_by_user ON grants(user_id);

CREATE TABLE invitations (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    inviter_id  TEXT NOT NULL,
    invitee_id  TEXT NOT NULL,
    role        TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE UNIQUE INDEX invitations_one_pending
    ON invitations(document_id, invitee_id) WHERE status = 'pending';

CREATE TABLE users (
    id          TEXT PRIMARY KEY,
    username    TEXT NOT NULL
);
CREATE INDEX users_by_name ON users(username);
";

const DOCUMENT_COLUMNS: &str = "id, title, owner_id, is_public, created_at, updated_at";
const INVITATION_COLUMNS: &str = "id, document_id, inviter_id, invitee_id, role, status, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == 0 {
        info!("initializing database schema v{SCHEMA_VERSION}");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if version > SCHEMA_VERSION {
        anyhow::bail!("database schema v{version} is newer than supported v{SCHEMA_VERSION}");
    }
    Ok(())
}

fn storage(e: rusqlite::Error) -> HubError {
    HubError::Storage(e.into())
}

/// Unique and primary-key violations are conflicts; a dangling document
/// reference is a missing document.
fn insert_error(e: rusqlite::Error, conflict: &str) -> HubError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            if err.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                HubError::not_found("No document found with that ID")
            } else {
                HubError::conflict(conflict)
            }
        }
        _ => storage(e),
    }
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn document_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: parsed(row, 0)?,
        title: row.get(1)?,
        owner_id: row.get(2)?,
        is_public: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn grant_row(row: &Row<'_>) -> rusqlite::Result<Grant> {
    Ok(Grant {
        document_id: parsed(row, 0)?,
        user_id: row.get(1)?,
        role: parsed(row, 2)?,
        created_at: row.get(3)?,
    })
}

fn invitation_row(row: &Row<'_>) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        id: parsed(row, 0)?,
        document_id: parsed(row, 1)?,
        inviter_id: row.get(2)?,
        invitee_id: row.get(3)?,
        role: parsed(row, 4)?,
        status: parsed(row, 5)?,
        created_at: row.get(6)?,
    })
}

fn select_document(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Document>> {
    conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
        [id.to_string()],
        document_row,
    )
    .optional()
}

fn insert_grant_row(conn: &Connection, grant: &Grant) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO grants (document_id, user_id, role, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            grant.document_id.to_string(),
            grant.user_id,
            grant.role.as_str(),
            grant.created_at,
        ],
    )
}

#[async_trait]
impl AccessStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                doc.id.to_string(),
                doc.title,
                doc.owner_id,
                doc.is_public,
                doc.created_at,
                doc.updated_at,
            ],
        )
        .map_err(|e| insert_error(e, "document already exists"))?;
        Ok(())
    }

    async fn document(&self, id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock().await;
        select_document(&conn, id).map_err(storage)
    }

    async fn documents_for_user(&self, user_id: &str) -> Result<Vec<Document>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT d.id, d.title, d.owner_id, d.is_public, d.created_at, d.updated_at
                 FROM documents d
                 LEFT JOIN grants g ON g.document_id = d.id AND g.user_id = ?1
                 WHERE d.owner_id = ?1 OR g.user_id IS NOT NULL
                 ORDER BY d.updated_at DESC",
            )
            .map_err(storage)?;
        let docs = stmt
            .query_map([user_id], document_row)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(docs)
    }

    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE documents SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), title, Utc::now()],
            )
            .map_err(storage)?;
        if changed == 0 {
            return Ok(None);
        }
        select_document(&conn, id).map_err(storage)
    }

    async fn set_public(&self, id: Uuid, is_public: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE documents SET is_public = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), is_public, Utc::now()],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM documents WHERE id = ?1", [id.to_string()])
            .map_err(storage)?;
        Ok(changed > 0)
    }

    async fn insert_grant(&self, grant: &Grant) -> Result<()> {
        let conn = self.conn.lock().await;
        insert_grant_row(&conn, grant)
            .map_err(|e| insert_error(e, "user already has access to this document"))?;
        Ok(())
    }

    async fn grant(&self, document_id: Uuid, user_id: &str) -> Result<Option<Grant>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT document_id, user_id, role, created_at FROM grants
             WHERE document_id = ?1 AND user_id = ?2",
            params![document_id.to_string(), user_id],
            grant_row,
        )
        .optional()
        .map_err(storage)
    }

    async fn grants(&self, document_id: Uuid) -> Result<Vec<Grant>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT document_id, user_id, role, created_at FROM grants
                 WHERE document_id = ?1 ORDER BY created_at",
            )
            .map_err(storage)?;
        let grants = stmt
            .query_map([document_id.to_string()], grant_row)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(grants)
    }

    async fn delete_grant(&self, document_id: Uuid, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM grants WHERE document_id = ?1 AND user_id = ?2",
                params![document_id.to_string(), user_id],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO invitations ({INVITATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                invitation.id.to_string(),
                invitation.document_id.to_string(),
                invitation.inviter_id,
                invitation.invitee_id,
                invitation.role.as_str(),
                invitation.status.as_str(),
                invitation.created_at,
            ],
        )
        .map_err(|e| insert_error(e, "a pending invitation already exists for this user"))?;
        Ok(())
    }

    async fn accept_invitation(&self, id: Uuid, invitee_id: &str) -> Result<Invitation> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;
        let invitation = tx
            .query_row(
                &format!(
                    "SELECT {INVITATION_COLUMNS} FROM invitations
                     WHERE id = ?1 AND invitee_id = ?2 AND status = 'pending'"
                ),
                params![id.to_string(), invitee_id],
                invitation_row,
            )
            .optional()
            .map_err(storage)?
            .ok_or_else(|| {
                HubError::not_found("Invitation not found or has already been acted upon")
            })?;
        // an early return drops `tx`, which rolls back
        let grant = Grant::new(invitation.document_id, &invitation.invitee_id, invitation.role);
        insert_grant_row(&tx, &grant)
            .map_err(|e| insert_error(e, "user already has access to this document"))?;
        tx.execute(
            "UPDATE invitations SET status = 'accepted' WHERE id = ?1",
            [id.to_string()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(Invitation {
            status: InvitationStatus::Accepted,
            ..invitation
        })
    }

    async fn decline_invitation(&self, id: Uuid, invitee_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE invitations SET status = 'declined'
                 WHERE id = ?1 AND invitee_id = ?2 AND status = 'pending'",
                params![id.to_string(), invitee_id],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    async fn pending_invitations(&self, invitee_id: &str) -> Result<Vec<(Invitation, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.document_id, i.inviter_id, i.invitee_id, i.role, i.status,
                        i.created_at, d.title
                 FROM invitations i
                 JOIN documents d ON d.id = i.document_id
                 WHERE i.invitee_id = ?1 AND i.status = 'pending'
                 ORDER BY i.seq",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map([invitee_id], |row| -> rusqlite::Result<(Invitation, String)> {
                Ok((invitation_row(row)?, row.get(7)?))
            })
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows)
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn remember(&self, user: &User) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, username) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username",
            params![user.id, user.username],
        )?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row("SELECT id, username FROM users WHERE id = ?1", [id], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            })
            .optional()?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, username FROM users WHERE username = ?1 ORDER BY rowid LIMIT 1",
                [username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn seeded() -> (SqliteStore, Document) {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = Document::new(Some("Plan"), "u1");
        store.insert_document(&doc).await.unwrap();
        (store, doc)
    }

    #[tokio::test]
    async fn documents_round_trip_through_the_schema() {
        let (store, doc) = seeded().await;
        let loaded = store.document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, doc.id);
        assert_eq!(loaded.title, "Plan");
        assert!(!loaded.is_public);
        assert!(store.insert_document(&doc).await.unwrap_err().is_conflict());

        assert!(store.set_public(doc.id, true).await.unwrap());
        let renamed = store.update_title(doc.id, "Final").await.unwrap().unwrap();
        assert_eq!(renamed.title, "Final");
        assert!(renamed.is_public);
        assert!(store.update_title(Uuid::new_v4(), "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grants_conflict_and_reference_documents() {
        let (store, doc) = seeded().await;
        store.insert_grant(&Grant::new(doc.id, "u2", Role::Viewer)).await.unwrap();
        let err = store
            .insert_grant(&Grant::new(doc.id, "u2", Role::Editor))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let err = store
            .insert_grant(&Grant::new(Uuid::new_v4(), "u2", Role::Editor))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));

        let listed = store.documents_for_user("u2").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(store.grant(doc.id, "u2").await.unwrap().unwrap().role, Role::Viewer);
    }

    #[tokio::test]
    async fn accept_is_all_or_nothing() {
        let (store, doc) = seeded().await;
        let inv = Invitation::new(doc.id, "u1", "u2", Role::Editor);
        store.insert_invitation(&inv).await.unwrap();
        let dup = Invitation::new(doc.id, "u1", "u2", Role::Viewer);
        assert!(store.insert_invitation(&dup).await.unwrap_err().is_conflict());

        // a grant that appeared meanwhile makes accept roll back
        store.insert_grant(&Grant::new(doc.id, "u2", Role::Viewer)).await.unwrap();
        assert!(store.accept_invitation(inv.id, "u2").await.unwrap_err().is_conflict());
        assert_eq!(store.pending_invitations("u2").await.unwrap().len(), 1);

        store.delete_grant(doc.id, "u2").await.unwrap();
        let accepted = store.accept_invitation(inv.id, "u2").await.unwrap();
        assert_eq!(accepted.status, InvitationStatus::Accepted);
        assert_eq!(store.grant(doc.id, "u2").await.unwrap().unwrap().role, Role::Editor);
        assert!(matches!(
            store.accept_invitation(inv.id, "u2").await,
            Err(HubError::NotFound(_))
        ));
        assert!(!store.decline_invitation(inv.id, "u2").await.unwrap());
    }

    #[tokio::test]
    async fn delete_cascades() {
        let (store, doc) = seeded().await;
        store.insert_grant(&Grant::new(doc.id, "u2", Role::Viewer)).await.unwrap();
        store
            .insert_invitation(&Invitation::new(doc.id, "u1", "u3", Role::Viewer))
            .await
            .unwrap();
        assert!(store.delete_document(doc.id).await.unwrap());
        assert!(store.grants(doc.id).await.unwrap().is_empty());
        assert!(store.pending_invitations("u3").await.unwrap().is_empty());
        assert!(!store.delete_document(doc.id).await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        let doc = Document::new(Some("Kept"), "u1");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_document(&doc).await.unwrap();
            store.insert_grant(&Grant::new(doc.id, "u2", Role::Editor)).await.unwrap();
            store
                .remember(&User { id: "u2".into(), username: "bob".into() })
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.document(doc.id).await.unwrap().unwrap().title, "Kept");
        assert_eq!(store.grants(doc.id).await.unwrap().len(), 1);
        let bob = store.find_by_username("bob").await.unwrap().unwrap();
        assert_eq!(bob.id, "u2");
    }
}
