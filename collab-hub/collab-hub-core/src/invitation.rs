//! Invitation lifecycle: `pending → accepted | declined`, both terminal.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::access::AccessControl;
use crate::error::{HubError, Result};
use crate::model::{Invitation, PendingInvitation, Role};
use crate::storage::UserDirectory;

pub struct Invitations {
    access: Arc<AccessControl>,
    users: Arc<dyn UserDirectory>,
}

impl Invitations {
    pub fn new(access: Arc<AccessControl>, users: Arc<dyn UserDirectory>) -> Self {
        Self { access, users }
    }

    /// Records a pending invitation from the document owner.
    ///
    /// A declined (or accepted then revoked) invitee may be invited again;
    /// only a second *pending* invitation is a conflict.
    pub async fn invite(
        &self,
        document_id: Uuid,
        inviter_id: &str,
        invitee_id: &str,
        role: Role,
    ) -> Result<Invitation> {
        if invitee_id == inviter_id {
            return Err(HubError::invalid("You cannot invite yourself."));
        }
        if !role.is_grantable() {
            return Err(HubError::invalid("Invitations may offer the editor or viewer role only."));
        }
        self.access.require_owner(document_id, inviter_id).await?;
        if self.users.find_by_id(invitee_id).await?.is_none() {
            return Err(HubError::not_found("No user found to invite."));
        }
        if self.access.resolve_role(document_id, invitee_id).await?.is_some() {
            return Err(HubError::conflict("This user already has access to the document."));
        }
        let invitation = Invitation::new(document_id, inviter_id, invitee_id, role);
        self.access.store().insert_invitation(&invitation).await?;
        info!(invitation = %invitation.id, document = %document_id, invitee = invitee_id, "invitation sent");
        Ok(invitation)
    }

    /// Accepts a pending invitation addressed to the caller.
    ///
    /// The store serializes concurrent accepts of the same row, so exactly
    /// one caller wins; the rest see `NotFound`.
    pub async fn accept(&self, invitation_id: Uuid, caller_id: &str) -> Result<Invitation> {
        let invitation = self
            .access
            .store()
            .accept_invitation(invitation_id, caller_id)
            .await?;
        info!(invitation = %invitation_id, user = caller_id, role = %invitation.role, "invitation accepted");
        Ok(invitation)
    }

    /// Returns whether a pending invitation addressed to the caller changed.
    pub async fn decline(&self, invitation_id: Uuid, caller_id: &str) -> Result<bool> {
        let changed = self
            .access
            .store()
            .decline_invitation(invitation_id, caller_id)
            .await?;
        if changed {
            info!(invitation = %invitation_id, user = caller_id, "invitation declined");
        }
        Ok(changed)
    }

    pub async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingInvitation>> {
        let rows = self.access.store().pending_invitations(user_id).await?;
        let mut pending = Vec::with_capacity(rows.len());
        for (inv, document_title) in rows {
            let inviter_name = self
                .users
                .find_by_id(&inv.inviter_id)
                .await?
                .map(|u| u.username)
                .unwrap_or_else(|| inv.inviter_id.clone());
            pending.push(PendingInvitation {
                id: inv.id,
                document_id: inv.document_id,
                document_title,
                inviter_id: inv.inviter_id,
                inviter_name,
                role: inv.role,
                created_at: inv.created_at,
            });
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use crate::storage::{MemoryAccessStore, MemoryContentStore, MemoryUserDirectory};

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.into(),
            username: name.into(),
        }
    }

    fn setup() -> (Arc<AccessControl>, Invitations) {
        let access = Arc::new(AccessControl::new(
            Arc::new(MemoryAccessStore::new()),
            Arc::new(MemoryContentStore::new()),
        ));
        let users = Arc::new(MemoryUserDirectory::with_users([
            user("u1", "ann"),
            user("u2", "bob"),
            user("u3", "cat"),
        ]));
        let invitations = Invitations::new(access.clone(), users);
        (access, invitations)
    }

    #[tokio::test]
    async fn accept_grants_the_offered_role() {
        let (access, invitations) = setup();
        let doc = access.create_document(Some("Spec"), "u1").await.unwrap();
        let inv = invitations.invite(doc.id, "u1", "u2", Role::Editor).await.unwrap();

        let pending = invitations.list_pending("u2").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].document_title, "Spec");
        assert_eq!(pending[0].inviter_name, "ann");
        assert_eq!(pending[0].role, Role::Editor);

        let accepted = invitations.accept(inv.id, "u2").await.unwrap();
        assert!(accepted.status.is_terminal());
        assert_eq!(access.resolve_role(doc.id, "u2").await.unwrap(), Some(Role::Editor));
        assert!(invitations.list_pending("u2").await.unwrap().is_empty());

        // terminal: neither accept nor decline apply again
        assert!(matches!(
            invitations.accept(inv.id, "u2").await,
            Err(HubError::NotFound(_))
        ));
        assert!(!invitations.decline(inv.id, "u2").await.unwrap());
    }

    #[tokio::test]
    async fn only_the_invitee_can_respond() {
        let (access, invitations) = setup();
        let doc = access.create_document(None, "u1").await.unwrap();
        let inv = invitations.invite(doc.id, "u1", "u2", Role::Viewer).await.unwrap();

        assert!(matches!(
            invitations.accept(inv.id, "u3").await,
            Err(HubError::NotFound(_))
        ));
        assert!(!invitations.decline(inv.id, "u3").await.unwrap());
        assert!(invitations.decline(inv.id, "u2").await.unwrap());
        assert_eq!(access.resolve_role(doc.id, "u2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invite_validation() {
        let (access, invitations) = setup();
        let doc = access.create_document(None, "u1").await.unwrap();

        assert!(matches!(
            invitations.invite(doc.id, "u1", "u1", Role::Viewer).await,
            Err(HubError::InvalidArgument(_))
        ));
        assert!(matches!(
            invitations.invite(doc.id, "u1", "u2", Role::Owner).await,
            Err(HubError::InvalidArgument(_))
        ));
        assert!(matches!(
            invitations.invite(doc.id, "u2", "u3", Role::Viewer).await,
            Err(HubError::NotFound(_))
        ));
        assert!(matches!(
            invitations.invite(doc.id, "u1", "ghost", Role::Viewer).await,
            Err(HubError::NotFound(_))
        ));

        invitations.invite(doc.id, "u1", "u2", Role::Viewer).await.unwrap();
        assert!(matches!(
            invitations.invite(doc.id, "u1", "u2", Role::Editor).await,
            Err(HubError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn declined_invitees_can_be_invited_again() {
        let (access, invitations) = setup();
        let doc = access.create_document(None, "u1").await.unwrap();
        let first = invitations.invite(doc.id, "u1", "u2", Role::Viewer).await.unwrap();
        assert!(invitations.decline(first.id, "u2").await.unwrap());
        let second = invitations.invite(doc.id, "u1", "u2", Role::Editor).await.unwrap();
        assert_ne!(first.id, second.id);
        invitations.accept(second.id, "u2").await.unwrap();
        assert_eq!(access.resolve_role(doc.id, "u2").await.unwrap(), Some(Role::Editor));
    }

    #[tokio::test]
    async fn accept_conflicts_when_access_was_granted_meanwhile() {
        let (access, invitations) = setup();
        let doc = access.create_document(None, "u1").await.unwrap();
        let inv = invitations.invite(doc.id, "u1", "u2", Role::Editor).await.unwrap();
        access.set_visibility(doc.id, true).await.unwrap();
        access.self_enroll(doc.id, "u2").await.unwrap();

        let err = invitations.accept(inv.id, "u2").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(access.store().grants(doc.id).await.unwrap().len(), 1);
        assert_eq!(access.resolve_role(doc.id, "u2").await.unwrap(), Some(Role::Viewer));
    }

    #[tokio::test]
    async fn pending_list_keeps_creation_order() {
        let (access, invitations) = setup();
        let a = access.create_document(Some("A"), "u1").await.unwrap();
        let b = access.create_document(Some("B"), "u3").await.unwrap();
        invitations.invite(a.id, "u1", "u2", Role::Viewer).await.unwrap();
        invitations.invite(b.id, "u3", "u2", Role::Editor).await.unwrap();

        let titles: Vec<String> = invitations
            .list_pending("u2")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.document_title)
            .collect();
        assert_eq!(titles, vec!["A", "B"]);
    }
}
