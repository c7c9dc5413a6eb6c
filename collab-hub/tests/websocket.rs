use collab_hub::api::{self, AppState, Backends, SessionLimits};
use collab_hub_core::auth::Hs256Verifier;
use collab_hub_core::model::User;
use collab_hub_core::storage::{FileContentStore, MemoryAccessStore, MemoryCache, MemoryUserDirectory};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const SECRET: &str = "ws-secret";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn token(id: &str, name: &str) -> String {
    let user = User {
        id: id.into(),
        username: name.into(),
    };
    Hs256Verifier::new(SECRET.into()).issue(&user, 3600).unwrap()
}

async fn start(dir: &std::path::Path) -> (SocketAddr, AppState, tokio::task::JoinHandle<std::io::Result<()>>) {
    let backends = Backends {
        access: Arc::new(MemoryAccessStore::new()),
        content: Arc::new(FileContentStore::new(dir).await.unwrap()),
        cache: Arc::new(MemoryCache::new()),
        users: Arc::new(MemoryUserDirectory::new()),
    };
    let verifier = Arc::new(Hs256Verifier::new(SECRET.into()));
    let limits = SessionLimits {
        room_capacity: 64,
        ..SessionLimits::default()
    };
    let state = AppState::new(backends, verifier, limits);
    let app = api::router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(axum::serve(listener, app).into_future());
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state, server)
}

async fn create_doc(addr: SocketAddr, token: &str) -> String {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/documents"))
        .bearer_auth(token)
        .json(&json!({"title": "Live"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let body: Value = resp.json().await.unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

async fn open(addr: SocketAddr, token: &str) -> Socket {
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("Authorization", format!("Bearer {token}").parse().unwrap());
    let (ws, _) = connect_async(req).await.unwrap();
    ws
}

async fn emit(ws: &mut Socket, event: &str, data: Value) {
    let frame = json!({"event": event, "data": data}).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Next JSON frame, or `None` once the server closed the socket.
async fn recv(ws: &mut Socket) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn expect_event(ws: &mut Socket, event: &str) -> Value {
    let frame = recv(ws).await.expect("socket closed");
    assert_eq!(frame["event"], event, "unexpected frame {frame}");
    frame["data"].clone()
}

#[tokio::test]
async fn collaborators_share_edits_chat_and_presence() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _state, server) = start(dir.path()).await;
    let ann = token("u1", "ann");
    let bob = token("u2", "bob");
    let doc = create_doc(addr, &ann).await;

    // bob must have hit the API once to be found by username
    let client = reqwest::Client::new();
    client
        .get(format!("http://{addr}/api/invitations"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    let resp: Value = client
        .post(format!("http://{addr}/api/documents/{doc}/share"))
        .bearer_auth(&ann)
        .json(&json!({"username": "bob", "role": "editor"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let invitation = resp["data"]["id"].as_str().unwrap().to_string();
    let accepted = client
        .post(format!("http://{addr}/api/invitations/{invitation}/accept"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert!(accepted.status().is_success());

    let mut ws_ann = open(addr, &ann).await;
    emit(&mut ws_ann, "joinDocument", json!(doc)).await;
    assert_eq!(expect_event(&mut ws_ann, "loadDocument").await, json!(""));
    assert_eq!(expect_event(&mut ws_ann, "loadChatHistory").await, json!([]));
    assert_eq!(expect_event(&mut ws_ann, "updatePresence").await, json!(["ann"]));

    let mut ws_bob = open(addr, &bob).await;
    emit(&mut ws_bob, "joinDocument", json!(doc)).await;
    expect_event(&mut ws_bob, "loadDocument").await;
    expect_event(&mut ws_bob, "loadChatHistory").await;
    assert_eq!(expect_event(&mut ws_bob, "updatePresence").await, json!(["ann", "bob"]));
    assert_eq!(expect_event(&mut ws_ann, "updatePresence").await, json!(["ann", "bob"]));

    emit(&mut ws_bob, "sendChanges", json!({"ops": ["x"]})).await;
    assert_eq!(expect_event(&mut ws_ann, "receiveChanges").await, json!({"ops": ["x"]}));

    emit(&mut ws_ann, "sendChatMessage", json!("hi bob")).await;
    let chat = expect_event(&mut ws_bob, "receiveChatMessage").await;
    assert_eq!(chat["username"], "ann");
    assert_eq!(chat["content"], "hi bob");
    expect_event(&mut ws_ann, "receiveChatMessage").await;

    emit(&mut ws_bob, "saveDocument", json!({"text": "final"})).await;
    expect_event(&mut ws_bob, "documentSaved").await;

    ws_ann.close(None).await.unwrap();
    assert_eq!(expect_event(&mut ws_bob, "updatePresence").await, json!(["bob"]));

    let mut ws_late = open(addr, &ann).await;
    emit(&mut ws_late, "joinDocument", json!(doc)).await;
    assert_eq!(expect_event(&mut ws_late, "loadDocument").await, json!({"text": "final"}));
    let history = expect_event(&mut ws_late, "loadChatHistory").await;
    assert_eq!(history.as_array().unwrap().len(), 1);

    server.abort();
}

#[tokio::test]
async fn unauthorized_join_closes_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _state, server) = start(dir.path()).await;
    let ann = token("u1", "ann");
    let eve = token("u9", "eve");
    let doc = create_doc(addr, &ann).await;

    // token in the query string is accepted too
    let url = format!("ws://{addr}/ws?token={eve}");
    let (mut ws, _) = connect_async(url).await.unwrap();
    emit(&mut ws, "joinDocument", json!(doc)).await;
    expect_event(&mut ws, "documentError").await;
    assert!(recv(&mut ws).await.is_none());

    server.abort();
}

#[tokio::test]
async fn upgrade_requires_a_token() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _state, server) = start(dir.path()).await;
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    server.abort();
}

#[tokio::test]
async fn shutdown_disconnects_open_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, state, server) = start(dir.path()).await;
    let ann = token("u1", "ann");
    let doc = create_doc(addr, &ann).await;
    let doc_id: Uuid = doc.parse().unwrap();

    let mut ws = open(addr, &ann).await;
    emit(&mut ws, "joinDocument", json!(doc)).await;
    expect_event(&mut ws, "loadDocument").await;
    expect_event(&mut ws, "loadChatHistory").await;
    expect_event(&mut ws, "updatePresence").await;
    assert_eq!(state.sessions.presence().list(doc_id).await, Some(vec!["ann".to_string()]));
    assert_eq!(state.open_sockets(), 1);

    assert!(state.shutdown(Duration::from_secs(2)).await);
    assert_eq!(state.open_sockets(), 0);
    assert_eq!(state.sessions.presence().list(doc_id).await, Some(vec![]));
    assert_eq!(state.sessions.rooms().room_count(), 0);
    assert!(recv(&mut ws).await.is_none());

    server.abort();
}
