use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::*;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{TimeZone, Utc};
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use tokio::net::TcpListener;

#[derive(Clone)]
struct EchoState {
    connected_users: mpsc::UnboundedSender<String>,
}

async fn echo_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<EchoState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let user_id = query.get("user_id").cloned().unwrap_or_default();
    let _ = state.connected_users.send(user_id);
    ws.on_upgrade(echo_typing_as_message)
}

/// Answers every typing frame with noise the client must skip, followed by
/// a `message-created` event from the same pair.
async fn echo_typing_as_message(mut socket: WebSocket) {
    while let Some(Ok(frame)) = socket.recv().await {
        let AxumWsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(ClientRequest::TypingStarted {
            sender_id,
            receiver_id,
            project_id,
        }) = serde_json::from_str::<ClientRequest>(&text)
        else {
            continue;
        };
        let rejected = ServerEvent::Error(ApiError::new(ErrorCode::Validation, "bad frame"));
        let created = ServerEvent::MessageCreated {
            message: MessagePayload {
                id: MessageId::from("srv-1"),
                sender_id,
                receiver_id,
                project_id,
                body: "typed".into(),
                created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                updated_at: None,
                read_at: None,
                client_ref: None,
                sender_profile_image: None,
                receiver_profile_image: None,
            },
        };
        for frame in [
            "not json".to_string(),
            serde_json::to_string(&rejected).unwrap(),
            serde_json::to_string(&created).unwrap(),
        ] {
            if socket.send(AxumWsMessage::Text(frame)).await.is_err() {
                return;
            }
        }
    }
}

async fn hang_up(ws: WebSocketUpgrade, State(connections): State<Arc<AtomicUsize>>) -> Response {
    connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|socket| async move { drop(socket) })
}

async fn serve(app: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn fast_settings(server_url: String) -> SyncSettings {
    SyncSettings {
        server_url,
        reconnect_initial_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(50),
        ..SyncSettings::default()
    }
}

async fn wait_for_state(
    connection: &mut watch::Receiver<ConnectionState>,
    wanted: ConnectionState,
) {
    tokio::time::timeout(
        Duration::from_secs(5),
        connection.wait_for(|state| *state == wanted),
    )
    .await
    .expect("connection state timeout")
    .expect("connection watch open");
}

#[test]
fn ws_url_switches_scheme_and_adds_user() {
    let url = WsLiveChannel::ws_url("http://127.0.0.1:8443/", UserId(7)).unwrap();
    assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws?user_id=7");

    let url = WsLiveChannel::ws_url("https://chat.example.com/api", UserId(7)).unwrap();
    assert_eq!(url.as_str(), "wss://chat.example.com/api/ws?user_id=7");

    assert!(WsLiveChannel::ws_url("ftp://chat.example.com", UserId(7)).is_err());
}

#[tokio::test]
async fn offline_channel_never_connects_and_refuses_emit() {
    let channel = OfflineLiveChannel::new();
    assert_eq!(*channel.connection().borrow(), ConnectionState::Disconnected);
    let request = ClientRequest::TypingStopped {
        sender_id: UserId(1),
        receiver_id: UserId(2),
        project_id: None,
    };
    assert!(channel.emit(request).await.is_err());
}

#[tokio::test]
async fn emits_frames_and_delivers_validated_events() {
    let (connected_users, mut connected_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(echo_upgrade))
        .with_state(EchoState { connected_users });
    let server_url = serve(app).await;

    let channel = WsLiveChannel::connect(&fast_settings(server_url), UserId(7)).expect("connect");
    let mut events = channel.subscribe();
    let mut connection = channel.connection();
    wait_for_state(&mut connection, ConnectionState::Connected).await;
    assert_eq!(connected_rx.recv().await.as_deref(), Some("7"));

    channel
        .emit(ClientRequest::TypingStarted {
            sender_id: UserId(7),
            receiver_id: UserId(8),
            project_id: None,
        })
        .await
        .expect("emit");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timeout")
        .expect("event");
    let LiveEvent::Created(message) = event else {
        panic!("expected message-created, got {event:?}");
    };
    assert_eq!(message.id, MessageId::from("srv-1"));
    assert_eq!(message.sender_id, UserId(7));
    assert!(events.try_recv().is_err());

    channel.shutdown().await;
    assert_eq!(*connection.borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnects_after_server_hangs_up() {
    let connections = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/ws", get(hang_up))
        .with_state(Arc::clone(&connections));
    let server_url = serve(app).await;

    let channel = WsLiveChannel::connect(&fast_settings(server_url), UserId(7)).expect("connect");
    tokio::time::timeout(Duration::from_secs(5), async {
        while connections.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client kept reconnecting");
    drop(channel);
}

#[tokio::test]
async fn emit_fails_while_disconnected() {
    let channel = WsLiveChannel::connect(
        &fast_settings("http://127.0.0.1:1".to_string()),
        UserId(7),
    )
    .expect("connect");
    let err = channel
        .emit(ClientRequest::TypingStopped {
            sender_id: UserId(7),
            receiver_id: UserId(8),
            project_id: None,
        })
        .await
        .expect_err("must fail");
    assert!(err.to_string().contains("disconnected"));
    assert!(!channel.connection().borrow().is_connected());
}
