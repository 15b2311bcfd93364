//! Remote request channel integration: a real websocket client against a
//! server bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parley_agent::{ConfirmationRequest, FeedbackRequest, PermissionRequest};
use parley_schema::PermissionLevel;
use parley_server::{ClientFrame, RequestClient, RequestServer, ServerFrame};
use parley_user::{RequestHandler, User, UserRegistry};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestServer {
    server: RequestServer,
    users: Arc<UserRegistry>,
    url: String,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let users = Arc::new(
        UserRegistry::open(dir.path().join("users.json"))
            .await
            .unwrap(),
    );
    users
        .register(User::new("alice"), "correct-horse")
        .await
        .unwrap();

    let server = RequestServer::new(users.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        server,
        users,
        url: format!("ws://{addr}"),
        _dir: dir,
    }
}

type RawSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str, username: &str) -> RawSocket {
    let (ws, _) = connect_async(format!("{url}/ws/{username}")).await.unwrap();
    ws
}

async fn send(ws: &mut RawSocket, frame: &ClientFrame) {
    let json = serde_json::to_string(frame).unwrap();
    ws.send(WsMessage::Text(json.into())).await.unwrap();
}

async fn recv(ws: &mut RawSocket) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn login(ws: &mut RawSocket, username: &str, password: &str) -> ServerFrame {
    send(
        ws,
        &ClientFrame::Login {
            username: username.into(),
            password: password.into(),
        },
    )
    .await;
    recv(ws).await
}

#[tokio::test]
async fn login_succeeds_with_valid_credentials() {
    let ts = start_server().await;
    let mut ws = connect(&ts.url, "alice").await;
    let reply = login(&mut ws, "alice", "correct-horse").await;
    assert!(matches!(reply, ServerFrame::LoginResponse { success: true, .. }));
    assert!(ts.users.authenticated("alice"));
    assert!(ts.server.connected("alice").await);
}

#[tokio::test]
async fn login_fails_with_wrong_password() {
    let ts = start_server().await;
    let mut ws = connect(&ts.url, "alice").await;
    let reply = login(&mut ws, "alice", "wrong").await;
    match reply {
        ServerFrame::LoginResponse { success, message } => {
            assert!(!success);
            assert_eq!(message.as_deref(), Some("Authentication failed"));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn first_frame_must_be_login() {
    let ts = start_server().await;
    let mut ws = connect(&ts.url, "alice").await;
    send(
        &mut ws,
        &ClientFrame::PermissionResponse {
            request_id: "r1".into(),
            granted: 1,
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerFrame::LoginResponse { success, message } => {
            assert!(!success);
            assert_eq!(message.as_deref(), Some("First message must be login"));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn second_connection_for_same_user_is_rejected() {
    let ts = start_server().await;
    let mut first = connect(&ts.url, "alice").await;
    let reply = login(&mut first, "alice", "correct-horse").await;
    assert!(matches!(reply, ServerFrame::LoginResponse { success: true, .. }));

    let mut second = connect(&ts.url, "alice").await;
    match login(&mut second, "alice", "correct-horse").await {
        ServerFrame::LoginResponse { success, message } => {
            assert!(!success);
            assert_eq!(message.as_deref(), Some("User already connected"));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn permission_request_roundtrip() {
    let ts = start_server().await;
    let mut ws = connect(&ts.url, "alice").await;
    login(&mut ws, "alice", "correct-horse").await;

    let (request, response) = PermissionRequest::new("shell", vec![], serde_json::Map::new());
    let server = ts.server.clone();
    tokio::spawn(async move {
        server
            .handle_permission_request(request, "bot", "alice", "s1")
            .await;
    });

    let request_id = match recv(&mut ws).await {
        ServerFrame::PermissionRequest {
            request_id,
            tool_name,
            sender,
            session_id,
            ..
        } => {
            assert_eq!(tool_name, "shell");
            assert_eq!(sender, "bot");
            assert_eq!(session_id, "s1");
            request_id
        }
        other => panic!("unexpected frame {other:?}"),
    };

    send(
        &mut ws,
        &ClientFrame::PermissionResponse {
            request_id,
            granted: 3,
        },
    )
    .await;
    assert_eq!(response.await.unwrap(), PermissionLevel::Always);
}

#[tokio::test]
async fn offline_receiver_gets_auto_responses() {
    let ts = start_server().await;

    let (permission, permission_rx) =
        PermissionRequest::new("shell", vec![], serde_json::Map::new());
    ts.server
        .handle_permission_request(permission, "bot", "alice", "s1")
        .await;
    assert_eq!(permission_rx.await.unwrap(), PermissionLevel::Deny);

    let (feedback, feedback_rx) = FeedbackRequest::new("why?");
    ts.server
        .handle_feedback_request(feedback, "bot", "alice", "s1")
        .await;
    assert_eq!(feedback_rx.await.unwrap(), "");

    let (confirmation, confirmation_rx) = ConfirmationRequest::new("bot", "do it", vec![]);
    ts.server
        .handle_confirmation_request(confirmation, "bot", "alice", "s1")
        .await;
    let response = confirmation_rx.await.unwrap();
    assert!(!response.confirmed);
    assert_eq!(response.comment.as_deref(), Some("User not connected"));
}

#[tokio::test]
async fn disconnect_deauthenticates_user() {
    let ts = start_server().await;
    let mut ws = connect(&ts.url, "alice").await;
    login(&mut ws, "alice", "correct-horse").await;
    assert!(ts.users.authenticated("alice"));

    ws.close(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ts.users.authenticated("alice") {
        assert!(
            tokio::time::Instant::now() < deadline,
            "user not deauthenticated after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!ts.server.connected("alice").await);
}

struct AutoHandler;

#[async_trait]
impl RequestHandler for AutoHandler {
    async fn handle_permission_request(
        &self,
        request: PermissionRequest,
        _sender: &str,
        _receiver: &str,
        _session_id: &str,
    ) {
        request.grant_session();
    }

    async fn handle_feedback_request(
        &self,
        request: FeedbackRequest,
        _sender: &str,
        _receiver: &str,
        _session_id: &str,
    ) {
        request.respond("use the latest version");
    }

    async fn handle_confirmation_request(
        &self,
        request: ConfirmationRequest,
        _sender: &str,
        _receiver: &str,
        _session_id: &str,
    ) {
        request.confirm();
    }
}

#[tokio::test]
async fn request_client_serves_requests_through_local_handler() {
    let ts = start_server().await;

    let mut client = RequestClient::new(Arc::new(AutoHandler), ts.url.clone());
    assert!(client.authenticate("alice", "correct-horse").await.unwrap());

    let (permission, permission_rx) =
        PermissionRequest::new("shell", vec![], serde_json::Map::new());
    ts.server
        .handle_permission_request(permission, "bot", "alice", "s1")
        .await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), permission_rx)
            .await
            .unwrap()
            .unwrap(),
        PermissionLevel::Session
    );

    let (feedback, feedback_rx) = FeedbackRequest::new("which version?");
    ts.server
        .handle_feedback_request(feedback, "bot", "alice", "s1")
        .await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), feedback_rx)
            .await
            .unwrap()
            .unwrap(),
        "use the latest version"
    );

    let (confirmation, confirmation_rx) = ConfirmationRequest::new("bot", "run it", vec![]);
    ts.server
        .handle_confirmation_request(confirmation, "bot", "alice", "s1")
        .await;
    assert!(
        tokio::time::timeout(Duration::from_secs(5), confirmation_rx)
            .await
            .unwrap()
            .unwrap()
            .confirmed
    );
}

#[tokio::test]
async fn request_client_rejects_bad_credentials() {
    let ts = start_server().await;
    let mut client = RequestClient::new(Arc::new(AutoHandler), ts.url.clone());
    assert!(!client.authenticate("alice", "nope").await.unwrap());
}
