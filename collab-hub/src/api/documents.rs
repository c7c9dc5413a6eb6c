use axum::{extract::State, http::StatusCode, Json};
use collab_hub_core::model::{Document, Role};
use collab_hub_core::HubError;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{success, ApiError, ApiJson, ApiPath, AppState, AuthContext};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize, Default)]
pub struct CreateRequest {
    title: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    title: String,
}

#[derive(Deserialize)]
pub struct ShareRequest {
    username: String,
    role: String,
}

#[derive(Deserialize)]
pub struct VisibilityRequest {
    is_public: bool,
}

fn with_role(doc: Document, role: Role) -> Value {
    let mut value = json!(doc);
    value["role"] = json!(role);
    value
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Option<ApiJson<CreateRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let req = body.map(|ApiJson(r)| r).unwrap_or_default();
    let title = req.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let doc = state.access.create_document(title, &auth.user.id).await?;
    Ok((StatusCode::CREATED, success(with_role(doc, Role::Owner))))
}

pub async fn list(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Value>> {
    let docs = state.access.documents_for_user(&auth.user.id).await?;
    Ok(success(docs))
}

pub async fn get_one(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> ApiResult<Json<Value>> {
    let (doc, role) = state.access.document_for_user(id, &auth.user.id).await?;
    Ok(success(with_role(doc, role)))
}

pub async fn rename(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
    ApiJson(req): ApiJson<RenameRequest>,
) -> ApiResult<Json<Value>> {
    let doc = state.access.update_title(id, &auth.user.id, &req.title).await?;
    Ok(success(doc))
}

pub async fn remove(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> ApiResult<StatusCode> {
    state.access.delete_document(id, &auth.user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Invites a user, found by username, to the document.
pub async fn share(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
    ApiJson(req): ApiJson<ShareRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let role: Role = req.role.parse()?;
    let invitee = state
        .users
        .find_by_username(req.username.trim())
        .await?
        .ok_or_else(|| HubError::not_found("No user found with that username."))?;
    let invitation = state
        .invitations
        .invite(id, &auth.user.id, &invitee.id, role)
        .await?;
    Ok((StatusCode::CREATED, success(invitation)))
}

pub async fn permissions(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> ApiResult<Json<Value>> {
    let (doc, _) = state.access.document_for_user(id, &auth.user.id).await?;
    let grants = state.access.list_permissions(id, &auth.user.id).await?;
    let mut entries = vec![json!({ "user_id": doc.owner_id, "role": Role::Owner })];
    for grant in grants {
        entries.push(json!({ "user_id": grant.user_id, "role": grant.role }));
    }
    Ok(success(entries))
}

pub async fn revoke(
    State(state): State<AppState>,
    ApiPath((id, user_id)): ApiPath<(Uuid, String)>,
    auth: AuthContext,
) -> ApiResult<StatusCode> {
    state
        .access
        .remove_permission(id, &auth.user.id, &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn visibility(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
    ApiJson(req): ApiJson<VisibilityRequest>,
) -> ApiResult<Json<Value>> {
    state.access.set_public(id, &auth.user.id, req.is_public).await?;
    Ok(success(json!({ "is_public": req.is_public })))
}

pub async fn enroll(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    auth: AuthContext,
) -> ApiResult<Json<Value>> {
    let role = state.access.self_enroll(id, &auth.user.id).await?;
    Ok(success(json!({ "document_id": id, "role": role })))
}
