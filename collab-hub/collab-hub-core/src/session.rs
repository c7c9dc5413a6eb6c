//! Per-connection collaboration sessions.
//!
//! A [`CollabSession`] is owned by the task driving one socket. It is either
//! idle or in exactly one document room. Room traffic reaches the session
//! through a single [`RoomSubscription`], which is torn down before any
//! other room is entered and when the connection goes away.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::AccessControl;
use crate::chat::{ChatChannel, REPLAY_ON_JOIN};
use crate::model::{ChatMessage, Role, User};
use crate::presence::PresenceTracker;
use crate::storage::CacheStore;

/// Default per-room broadcast buffer. Each connection's outbound queue is
/// bounded by the same value.
pub const DEFAULT_ROOM_CAPACITY: usize = 256;

/// Frames sent by clients: `{"event": "...", "data": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    JoinDocument(Uuid),
    SendChanges(Value),
    SaveDocument(Value),
    SendChatMessage(String),
}

/// Frames sent to clients, either directly or through a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    LoadDocument(Value),
    LoadChatHistory(Vec<ChatMessage>),
    UpdatePresence(Vec<String>),
    ReceiveChanges(Value),
    DocumentSaved { message: String },
    SaveError { message: String },
    ReceiveChatMessage(ChatMessage),
    DocumentError { message: String },
    ChatError { message: String },
}

impl ServerMessage {
    fn document_error(message: &str) -> Self {
        ServerMessage::DocumentError {
            message: message.to_string(),
        }
    }

    fn save_error(message: &str) -> Self {
        ServerMessage::SaveError {
            message: message.to_string(),
        }
    }
}

/// What the transport should do after a message was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the connection: after an unauthorized join, or when the client
    /// stopped draining its outbound queue.
    Disconnect,
}

#[derive(Clone, Debug)]
pub struct RoomEvent {
    /// Connection that must not receive the event.
    pub skip: Option<Uuid>,
    pub message: ServerMessage,
}

/// One broadcast channel per document with live subscribers.
pub struct RoomHub {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<RoomEvent>>>,
    capacity: usize,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn subscribe(&self, document_id: Uuid) -> broadcast::Receiver<RoomEvent> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends to everyone in the room except `skip`. A room nobody listens to
    /// drops the event.
    pub fn publish(&self, document_id: Uuid, skip: Option<Uuid>, message: ServerMessage) {
        let sender = self.rooms.lock().get(&document_id).cloned();
        if let Some(tx) = sender {
            let _ = tx.send(RoomEvent { skip, message });
        }
    }

    pub fn member_count(&self, document_id: Uuid) -> usize {
        self.rooms
            .lock()
            .get(&document_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn prune(&self, document_id: Uuid) {
        let mut rooms = self.rooms.lock();
        if rooms
            .get(&document_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            rooms.remove(&document_id);
        }
    }
}

/// A session's membership in one room: the broadcast receiver, owned by a
/// task that forwards room events into the session's outbound queue.
///
/// The forwarder waits for queue space, so a client that stops reading
/// falls behind in the room ring and skips events instead of growing its
/// queue.
pub struct RoomSubscription {
    document_id: Uuid,
    forwarder: JoinHandle<()>,
}

impl RoomSubscription {
    fn open(
        rooms: &RoomHub,
        document_id: Uuid,
        connection_id: Uuid,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let mut rx = rooms.subscribe(document_id);
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.skip == Some(connection_id) {
                            continue;
                        }
                        if outbound.send(event.message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(document = %document_id, connection = %connection_id, missed, "room receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self {
            document_id,
            forwarder,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Stops delivery. When this returns the receiver has been dropped, so
    /// nothing published afterwards reaches this session.
    pub async fn teardown(mut self, rooms: &RoomHub) {
        self.forwarder.abort();
        let _ = (&mut self.forwarder).await;
        rooms.prune(self.document_id);
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Shared services for every session on this node.
pub struct SessionManager {
    access: Arc<AccessControl>,
    presence: PresenceTracker,
    chat: ChatChannel,
    rooms: RoomHub,
}

impl SessionManager {
    pub fn new(access: Arc<AccessControl>, cache: Arc<dyn CacheStore>, room_capacity: usize) -> Self {
        Self {
            access,
            presence: PresenceTracker::new(cache.clone()),
            chat: ChatChannel::new(cache),
            rooms: RoomHub::new(room_capacity),
        }
    }

    /// Bounds every presence and chat call made by sessions.
    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.presence = self.presence.with_timeout(timeout);
        self.chat = self.chat.with_timeout(timeout);
        self
    }

    pub fn rooms(&self) -> &RoomHub {
        &self.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    /// Starts an idle session for an authenticated connection. Everything
    /// addressed to the connection arrives on the returned receiver, which
    /// holds at most [`RoomHub::capacity`] messages.
    pub fn open(self: &Arc<Self>, user: User) -> (CollabSession, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(self.rooms.capacity());
        let connection_id = Uuid::new_v4();
        info!(connection = %connection_id, user = %user.id, "session opened");
        let session = CollabSession {
            manager: self.clone(),
            connection_id,
            user,
            outbound,
            overflowed: AtomicBool::new(false),
            state: SessionState::Idle,
        };
        (session, rx)
    }

    async fn broadcast_presence(&self, document_id: Uuid) {
        if let Some(users) = self.presence.list(document_id).await {
            self.rooms
                .publish(document_id, None, ServerMessage::UpdatePresence(users));
        }
    }
}

enum SessionState {
    Idle,
    InRoom {
        document_id: Uuid,
        role: Role,
        subscription: RoomSubscription,
    },
}

pub struct CollabSession {
    manager: Arc<SessionManager>,
    connection_id: Uuid,
    user: User,
    outbound: mpsc::Sender<ServerMessage>,
    /// Set once a direct reply found the outbound queue full.
    overflowed: AtomicBool,
    state: SessionState,
}

impl CollabSession {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// The current room and role, if any.
    pub fn room(&self) -> Option<(Uuid, Role)> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::InRoom {
                document_id, role, ..
            } => Some((*document_id, *role)),
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> Flow {
        let flow = match msg {
            ClientMessage::JoinDocument(document_id) => self.join(document_id).await,
            ClientMessage::SendChanges(delta) => {
                self.send_changes(delta);
                Flow::Continue
            }
            ClientMessage::SaveDocument(content) => {
                self.save(content).await;
                Flow::Continue
            }
            ClientMessage::SendChatMessage(text) => {
                self.send_chat(text).await;
                Flow::Continue
            }
        };
        if self.overflowed.load(Ordering::Relaxed) {
            warn!(connection = %self.connection_id, "outbound queue full; dropping slow client");
            return Flow::Disconnect;
        }
        flow
    }

    /// Leaves the current room, if any. Must run once the connection is gone.
    pub async fn disconnect(&mut self) {
        self.leave_room().await;
        info!(connection = %self.connection_id, user = %self.user.id, "session closed");
    }

    async fn join(&mut self, document_id: Uuid) -> Flow {
        self.leave_room().await;
        let manager = self.manager.clone();

        let role = match manager.access.resolve_role(document_id, &self.user.id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                info!(document = %document_id, user = %self.user.id, "join refused");
                self.send(ServerMessage::document_error(
                    "You do not have permission to access this document.",
                ));
                return Flow::Disconnect;
            }
            Err(e) => {
                error!(document = %document_id, "role lookup failed: {e:#}");
                self.send(ServerMessage::document_error("Could not open the document."));
                return Flow::Continue;
            }
        };

        let content = match manager.access.content().load(document_id).await {
            Ok(Some(record)) => record.content,
            Ok(None) => {
                warn!(document = %document_id, "document has no content record");
                self.send(ServerMessage::document_error("Document content not found."));
                return Flow::Continue;
            }
            Err(e) => {
                error!(document = %document_id, "content load failed: {e:#}");
                self.send(ServerMessage::document_error("Could not load the document."));
                return Flow::Continue;
            }
        };

        let subscription = RoomSubscription::open(
            &manager.rooms,
            document_id,
            self.connection_id,
            self.outbound.clone(),
        );
        self.state = SessionState::InRoom {
            document_id,
            role,
            subscription,
        };
        self.send(ServerMessage::LoadDocument(content));
        let history = manager.chat.recent(document_id, REPLAY_ON_JOIN).await;
        self.send(ServerMessage::LoadChatHistory(history));

        manager.presence.join(document_id, &self.user.username).await;
        manager.broadcast_presence(document_id).await;
        info!(document = %document_id, user = %self.user.id, %role, "joined document");
        Flow::Continue
    }

    fn send_changes(&self, delta: Value) {
        match &self.state {
            SessionState::InRoom {
                document_id, role, ..
            } if role.can_edit() => {
                self.manager.rooms.publish(
                    *document_id,
                    Some(self.connection_id),
                    ServerMessage::ReceiveChanges(delta),
                );
            }
            _ => debug!(connection = %self.connection_id, "changes dropped"),
        }
    }

    async fn save(&self, content: Value) {
        let document_id = match &self.state {
            SessionState::InRoom {
                document_id, role, ..
            } if role.can_edit() => *document_id,
            SessionState::InRoom { .. } => {
                self.send(ServerMessage::save_error(
                    "You do not have permission to save this document.",
                ));
                return;
            }
            SessionState::Idle => {
                self.send(ServerMessage::save_error("Join a document before saving."));
                return;
            }
        };
        match self.manager.access.content().save(document_id, &content).await {
            Ok(true) => self.send(ServerMessage::DocumentSaved {
                message: "Document saved successfully!".to_string(),
            }),
            Ok(false) => {
                warn!(document = %document_id, "save for a document without content record");
                self.send(ServerMessage::save_error("Document content not found."));
            }
            Err(e) => {
                error!(document = %document_id, "save failed: {e:#}");
                self.send(ServerMessage::save_error("Failed to save the document."));
            }
        }
    }

    async fn send_chat(&self, text: String) {
        let SessionState::InRoom { document_id, .. } = &self.state else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let document_id = *document_id;
        let message = ChatMessage::now(&self.user.username, &text);
        if !self.manager.chat.post(document_id, &message).await {
            self.send(ServerMessage::ChatError {
                message: "Your message could not be stored.".to_string(),
            });
        }
        self.manager
            .rooms
            .publish(document_id, None, ServerMessage::ReceiveChatMessage(message));
    }

    /// Tears the subscription down first, then updates presence so the
    /// leaving connection does not see its own departure.
    async fn leave_room(&mut self) {
        let SessionState::InRoom {
            document_id,
            subscription,
            ..
        } = std::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return;
        };
        subscription.teardown(&self.manager.rooms).await;
        self.manager
            .presence
            .leave(document_id, &self.user.username)
            .await;
        self.manager.broadcast_presence(document_id).await;
        info!(document = %document_id, user = %self.user.id, "left document");
    }

    fn send(&self, msg: ServerMessage) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflowed.store(true, Ordering::Relaxed),
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %self.connection_id, "outbound closed");
            }
        }
    }
}
