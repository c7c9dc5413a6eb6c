//! Records owned by the relational store and the value types that flow
//! between the access-control layer and the session layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::HubError;

pub const DEFAULT_TITLE: &str = "Untitled Document";

/// Authorization level of a user on one document.
///
/// `Owner` is never stored as a grant; it is derived from `Document::owner_id`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Whether this role may change document content.
    pub fn can_edit(&self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Roles that can be stored in a grant or offered in an invitation.
    pub fn is_grantable(&self) -> bool {
        !matches!(self, Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(HubError::invalid(format!("unknown role '{other}'"))),
        }
    }
}

/// A user as known to the hub. Credentials live in the credential store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub owner_id: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: Option<&str>, owner_id: &str) -> Self {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            owner_id: owner_id.to_string(),
            is_public: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored `(document, user, role)` authorization record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub document_id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn new(document_id: Uuid, user_id: &str, role: Role) -> Self {
        Self {
            document_id,
            user_id: user_id.to_string(),
            role,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

impl FromStr for InvitationStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "accepted" => Ok(InvitationStatus::Accepted),
            "declined" => Ok(InvitationStatus::Declined),
            other => Err(HubError::invalid(format!("unknown invitation status '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invitation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub inviter_id: String,
    pub invitee_id: String,
    pub role: Role,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn new(document_id: Uuid, inviter_id: &str, invitee_id: &str, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            inviter_id: inviter_id.to_string(),
            invitee_id: invitee_id.to_string(),
            role,
            status: InvitationStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Pending invitation joined with the names a client needs to render it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingInvitation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_title: String,
    pub inviter_id: String,
    pub inviter_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// One entry of a document's chat log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub username: String,
    pub content: String,
    /// RFC 3339 / ISO 8601 timestamp.
    pub timestamp: String,
}

impl ChatMessage {
    pub fn now(username: &str, content: &str) -> Self {
        Self {
            username: username.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_titles_fall_back_to_default() {
        assert_eq!(Document::new(None, "u1").title, DEFAULT_TITLE);
        assert_eq!(Document::new(Some("   "), "u1").title, DEFAULT_TITLE);
        assert_eq!(Document::new(Some(" Plan "), "u1").title, "Plan");
    }

    #[test]
    fn role_parsing_and_capabilities() {
        assert_eq!("Editor".parse::<Role>().unwrap(), Role::Editor);
        assert!("admin".parse::<Role>().is_err());
        assert!(Role::Owner.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(!Role::Viewer.can_edit());
        assert!(!Role::Owner.is_grantable());
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Viewer).unwrap(), "\"viewer\"");
        let status: InvitationStatus = serde_json::from_str("\"declined\"").unwrap();
        assert!(status.is_terminal());
    }
}
