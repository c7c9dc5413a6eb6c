//! HTTP and WebSocket surface of the hub.

pub mod collab_ws;
pub mod documents;
pub mod error;
pub mod extract;
pub mod invitations;

use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
    routing::{delete, get, post, put},
    Json, Router,
};
use collab_hub_core::auth::TokenVerifier;
use collab_hub_core::model::User;
use collab_hub_core::storage::{
    AccessStore, CacheStore, ContentStore, MemoryAccessStore, MemoryCache, MemoryContentStore,
    MemoryUserDirectory, UserDirectory,
};
use collab_hub_core::policy::DEFAULT_CACHE_TIMEOUT;
use collab_hub_core::session::DEFAULT_ROOM_CAPACITY;
use collab_hub_core::{AccessControl, Invitations, SessionManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

pub use error::ApiError;
pub use extract::{ApiJson, ApiPath};

/// Backends the hub is assembled from.
pub struct Backends {
    pub access: Arc<dyn AccessStore>,
    pub content: Arc<dyn ContentStore>,
    pub cache: Arc<dyn CacheStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            access: Arc::new(MemoryAccessStore::new()),
            content: Arc::new(MemoryContentStore::new()),
            cache: Arc::new(MemoryCache::new()),
            users: Arc::new(MemoryUserDirectory::new()),
        }
    }
}

/// Session tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    /// Room broadcast buffer and per-connection outbound queue size.
    pub room_capacity: usize,
    /// Deadline for each presence or chat cache call.
    pub cache_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub access: Arc<AccessControl>,
    pub invitations: Arc<Invitations>,
    pub sessions: Arc<SessionManager>,
    pub users: Arc<dyn UserDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Cancelled when the server stops; every socket task watches it.
    pub stop: CancellationToken,
    sockets: TaskTracker,
}

impl AppState {
    pub fn new(backends: Backends, verifier: Arc<dyn TokenVerifier>, limits: SessionLimits) -> Self {
        let access = Arc::new(AccessControl::new(backends.access, backends.content));
        let invitations = Arc::new(Invitations::new(access.clone(), backends.users.clone()));
        let sessions = Arc::new(
            SessionManager::new(access.clone(), backends.cache, limits.room_capacity)
                .with_cache_timeout(limits.cache_timeout),
        );
        Self {
            access,
            invitations,
            sessions,
            users: backends.users,
            verifier,
            stop: CancellationToken::new(),
            sockets: TaskTracker::new(),
        }
    }

    /// Socket tasks still running.
    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Closes every socket and waits up to `grace` for their sessions to
    /// disconnect. Returns false if some were still running.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop.cancel();
        self.sockets.close();
        info!(sockets = self.sockets.len(), "closing sockets");
        tokio::time::timeout(grace, self.sockets.wait()).await.is_ok()
    }
}

/// Authenticated caller, from `Authorization: Bearer` or `?token=`.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user: User,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let token = match header {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|q| q.0.token)
                .ok_or_else(|| ApiError::unauthenticated("You are not logged in."))?,
        };
        let claims = state
            .verifier
            .verify(&token)
            .await
            .ok_or_else(|| ApiError::unauthenticated("Invalid or expired token."))?;
        let user = claims.user();
        if let Err(e) = state.users.remember(&user).await {
            warn!(user = %user.id, "failed to record user: {e:#}");
        }
        Ok(Self { user })
    }
}

/// Success envelope: `{"status": "success", "data": ...}`.
pub fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "status": "success", "data": data }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/documents",
            post(documents::create).get(documents::list),
        )
        .route(
            "/api/documents/{id}",
            get(documents::get_one)
                .patch(documents::rename)
                .delete(documents::remove),
        )
        .route("/api/documents/{id}/share", post(documents::share))
        .route("/api/documents/{id}/permissions", get(documents::permissions))
        .route(
            "/api/documents/{id}/permissions/{user_id}",
            delete(documents::revoke),
        )
        .route("/api/documents/{id}/visibility", put(documents::visibility))
        .route("/api/documents/{id}/enroll", post(documents::enroll))
        .route("/api/invitations", get(invitations::pending))
        .route("/api/invitations/{id}/accept", post(invitations::accept))
        .route("/api/invitations/{id}/decline", post(invitations::decline))
        .route("/ws", get(collab_ws::upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    success(json!({ "ok": true }))
}
