use axum::{extract::State, Json};
use collab_hub_core::HubError;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{success, ApiError, ApiPath, AppState, AuthContext};

pub async fn pending(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Value>, ApiError> {
    let invitations = state.invitations.list_pending(&auth.user.id).await?;
    Ok(success(invitations))
}

pub async fn accept(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    let invitation = state
        .invitations
        .accept(id, &auth.user.id)
        .await
        .map_err(|e| match e {
            HubError::Conflict(_) => HubError::conflict("You already have access to this document."),
            other => other,
        })?;
    Ok(success(json!({
        "document_id": invitation.document_id,
        "role": invitation.role,
    })))
}

pub async fn decline(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    if !state.invitations.decline(id, &auth.user.id).await? {
        return Err(HubError::not_found("Invitation not found or has already been acted upon").into());
    }
    Ok(success(json!({ "message": "Invitation declined." })))
}
