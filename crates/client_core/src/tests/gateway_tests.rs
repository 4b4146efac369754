use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{Identity, UserId, SYSTEM_SENDER},
    protocol::{
        ChannelRecord, ConnectRequest, ConnectResponse, CreateChannelRequest, SendMessageRequest,
    },
};
use tokio::net::TcpListener;

use super::*;

#[derive(Clone)]
struct TestBackendState {
    channels: Arc<Mutex<Vec<ChannelRecord>>>,
    history: Arc<Mutex<Vec<MessageRecord>>>,
    create_calls: Arc<Mutex<Vec<String>>>,
    read_calls: Arc<Mutex<Vec<String>>>,
    frames: broadcast::Sender<String>,
}

async fn handle_connect(Json(request): Json<ConnectRequest>) -> Json<ConnectResponse> {
    Json(ConnectResponse {
        user_id: request.user_id,
    })
}

async fn handle_list_channels(
    State(state): State<TestBackendState>,
) -> Json<Vec<ChannelRecord>> {
    Json(state.channels.lock().await.clone())
}

async fn handle_create_channel(
    State(state): State<TestBackendState>,
    Json(request): Json<CreateChannelRequest>,
) -> Json<ChannelRecord> {
    state.create_calls.lock().await.push(request.name.clone());
    let record = ChannelRecord {
        channel_url: format!("{}-url", request.name),
        name: request.name,
        member_count: 1,
        unread_message_count: 0,
        last_message: None,
    };
    state.channels.lock().await.push(record.clone());
    Json(record)
}

async fn handle_history(
    State(state): State<TestBackendState>,
    Path(_channel_url): Path<String>,
) -> Json<Vec<MessageRecord>> {
    Json(state.history.lock().await.clone())
}

async fn handle_send(
    Path(channel_url): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Json<MessageRecord> {
    Json(MessageRecord::User {
        message_id: 501,
        channel_url,
        text: request.text,
        sender_id: request.sender_id,
        sender_nickname: Some("alice".to_string()),
        created_at: "2024-05-01T10:00:00Z".parse().expect("timestamp"),
    })
}

async fn handle_read(
    State(state): State<TestBackendState>,
    Path(channel_url): Path<String>,
) -> StatusCode {
    state.read_calls.lock().await.push(channel_url);
    StatusCode::NO_CONTENT
}

async fn handle_events(
    State(state): State<TestBackendState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_frames(socket, state))
}

async fn stream_frames(mut socket: WebSocket, state: TestBackendState) {
    let mut frames = state.frames.subscribe();
    while let Ok(frame) = frames.recv().await {
        if frame == "__shutdown__" {
            break;
        }
        if socket.send(AxumWsMessage::Text(frame)).await.is_err() {
            break;
        }
    }
}

async fn spawn_backend() -> (String, TestBackendState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (frames, _) = broadcast::channel(16);
    let state = TestBackendState {
        channels: Arc::new(Mutex::new(Vec::new())),
        history: Arc::new(Mutex::new(Vec::new())),
        create_calls: Arc::new(Mutex::new(Vec::new())),
        read_calls: Arc::new(Mutex::new(Vec::new())),
        frames,
    };
    let app = Router::new()
        .route("/connect", post(handle_connect))
        .route(
            "/channels",
            get(handle_list_channels).post(handle_create_channel),
        )
        .route(
            "/channels/:channel_url/messages",
            get(handle_history).post(handle_send),
        )
        .route("/channels/:channel_url/read", post(handle_read))
        .route("/events", get(handle_events))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn test_identity() -> Identity {
    Identity {
        user_id: UserId("user_ab12cd".to_string()),
        nickname: "Ada".to_string(),
    }
}

fn user_record(message_id: i64, text: &str, created_at: &str) -> MessageRecord {
    MessageRecord::User {
        message_id,
        channel_url: "room-a".to_string(),
        text: text.to_string(),
        sender_id: "user_1".to_string(),
        sender_nickname: Some("alice".to_string()),
        created_at: created_at.parse().expect("timestamp"),
    }
}

/// The backend's socket task subscribes shortly after the client handshake
/// completes; frames sent before that would be dropped.
async fn wait_for_push_subscriber(state: &TestBackendState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.frames.receiver_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("push stream never attached");
}

async fn recv_event(rx: &mut broadcast::Receiver<MessageEvent>) -> MessageEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for gateway event")
        .expect("gateway event stream closed")
}

#[tokio::test]
async fn connect_then_receive_decoded_push_events() {
    let (base_url, state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    let mut rx = gateway.subscribe();

    gateway.connect(&test_identity()).await.expect("connect");
    wait_for_push_subscriber(&state).await;

    let frame = serde_json::to_string(&PushFrame::MessageReceived {
        message: user_record(9, "hello", "2024-05-01T10:00:00Z"),
    })
    .expect("encode frame");
    state.frames.send(frame).expect("push frame");

    match recv_event(&mut rx).await {
        MessageEvent::Message(message) => {
            assert_eq!(message.id, MessageId(9));
            assert_eq!(message.sender, "alice");
            assert_eq!(message.channel_url, ChannelUrl("room-a".to_string()));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn push_stream_end_emits_disconnected() {
    let (base_url, state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    let mut rx = gateway.subscribe();

    gateway.connect(&test_identity()).await.expect("connect");
    wait_for_push_subscriber(&state).await;
    state
        .frames
        .send("__shutdown__".to_string())
        .expect("shutdown");

    assert!(matches!(
        recv_event(&mut rx).await,
        MessageEvent::Disconnected
    ));
}

#[tokio::test]
async fn history_is_normalized_oldest_first_and_skips_unsupported() {
    let (base_url, state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    gateway.connect(&test_identity()).await.expect("connect");

    // the backend serves most-recent-first, with a record type this client
    // does not understand in the middle
    *state.history.lock().await = vec![
        user_record(3, "third", "2024-05-01T10:02:00Z"),
        MessageRecord::Unsupported,
        user_record(2, "second", "2024-05-01T10:01:00Z"),
        user_record(1, "first", "2024-05-01T10:00:00Z"),
    ];

    let messages = gateway
        .fetch_history(&ChannelUrl("room-a".to_string()), 10, Utc::now())
        .await
        .expect("fetch");
    let ids: Vec<i64> = messages.iter().map(|m| m.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn resolve_default_channel_creates_it_exactly_once() {
    let (base_url, state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    gateway.connect(&test_identity()).await.expect("connect");

    let channel = gateway
        .resolve_default_channel()
        .await
        .expect("first resolve");
    assert_eq!(channel.name, DEFAULT_CHANNEL_NAME);

    let channel_again = gateway
        .resolve_default_channel()
        .await
        .expect("second resolve");
    assert_eq!(channel_again.url, channel.url);
    assert_eq!(
        state.create_calls.lock().await.as_slice(),
        &[DEFAULT_CHANNEL_NAME.to_string()]
    );
}

#[tokio::test]
async fn send_returns_the_backends_normalized_message() {
    let (base_url, _state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    gateway.connect(&test_identity()).await.expect("connect");

    let message = gateway
        .send(&ChannelUrl("room-a".to_string()), "hello")
        .await
        .expect("send");
    assert_eq!(message.id, MessageId(501));
    assert_eq!(message.text, "hello");
    assert_eq!(message.sender, "alice");
}

#[tokio::test]
async fn mark_read_posts_to_the_backend() {
    let (base_url, state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);
    gateway.connect(&test_identity()).await.expect("connect");

    gateway
        .mark_read(&ChannelUrl("room-a".to_string()))
        .await
        .expect("mark read");
    assert_eq!(
        state.read_calls.lock().await.as_slice(),
        &["room-a".to_string()]
    );
}

#[tokio::test]
async fn operations_before_connect_are_rejected() {
    let (base_url, _state) = spawn_backend().await;
    let gateway = HttpChannelGateway::new(base_url);

    let err = gateway
        .fetch_history(&ChannelUrl("room-a".to_string()), 10, Utc::now())
        .await
        .expect_err("must require a connected session");
    assert!(err.to_string().contains("not connected"));
}

#[test]
fn admin_frames_decode_with_the_system_sender() {
    let frame = PushFrame::MessageReceived {
        message: MessageRecord::Admin {
            message_id: 11,
            channel_url: "room-a".to_string(),
            text: "server maintenance".to_string(),
            created_at: "2024-05-01T10:00:00Z".parse().expect("timestamp"),
        },
    };
    match event_from_frame(frame) {
        MessageEvent::Message(message) => assert_eq!(message.sender, SYSTEM_SENDER),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn deleted_frames_carry_the_scoped_identity() {
    let frame = PushFrame::MessageDeleted {
        channel_url: "room-a".to_string(),
        message_id: 12,
    };
    match event_from_frame(frame) {
        MessageEvent::Deleted { channel_url, id } => {
            assert_eq!(channel_url, ChannelUrl("room-a".to_string()));
            assert_eq!(id, MessageId(12));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn unsupported_frames_decode_to_unsupported() {
    assert!(matches!(
        event_from_frame(PushFrame::Unsupported),
        MessageEvent::Unsupported
    ));
}
