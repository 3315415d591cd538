//! HTTP bootstrap and `/ws` relay against a live server on an ephemeral
//! port, with the reference agent as the bridged process.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use uplink::acp::envelope::{Envelope, Message, RequestId};
use uplink::acp::spawner::SpawnConfig;
use uplink::bridge::{BridgeState, CLOSE_GOING_AWAY, CLOSE_UNAUTHORIZED};
use uplink::server::token::TokenStore;
use uplink::server::{self, AppState, CreateSessionResponse};

use super::test_helpers::{mock_agent_bin, TIMEOUT};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    ct: CancellationToken,
    handle: JoinHandle<uplink::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().canonicalize().expect("canonical");
        let mut spawn = SpawnConfig::new(mock_agent_bin(), Vec::new(), cwd);
        spawn.kill_grace = Duration::from_millis(500);
        let state = AppState::new(spawn, TokenStore::new(Duration::from_secs(60)));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let ct = CancellationToken::new();
        let handle = tokio::spawn(server::serve(listener, state.clone(), ct.clone()));

        Self {
            addr,
            state,
            ct,
            handle,
            _dir: dir,
        }
    }

    fn token(&self) -> String {
        self.state.tokens.issue(self.state.spawn.cwd.clone()).token
    }

    async fn connect(&self, token: &str) -> Ws {
        let url = format!("ws://{}/ws?token={token}", self.addr);
        let (ws, _response) = connect_async(url.as_str()).await.expect("websocket upgrade");
        ws
    }

    async fn stop(self) {
        self.ct.cancel();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("server stops in time")
            .expect("join")
            .expect("clean shutdown");
    }
}

/// Minimal HTTP/1.1 exchange; returns the status code and body.
async fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut raw = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut raw))
        .await
        .expect("response in time")
        .expect("read");
    let (head, body) = raw.split_once("\r\n\r\n").expect("http response");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    (status, body.to_owned())
}

async fn next_ws(ws: &mut Ws) -> WsMessage {
    tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .expect("message in time")
        .expect("stream open")
        .expect("valid frame")
}

async fn expect_close(ws: &mut Ws) -> u16 {
    loop {
        match next_ws(ws).await {
            WsMessage::Close(Some(frame)) => return u16::from(frame.code),
            WsMessage::Close(None) => panic!("close without a code"),
            _ => {}
        }
    }
}

/// Send a request and collect messages until its response arrives.
async fn call(ws: &mut Ws, id: i64, method: &str, params: Value) -> (Vec<Message>, Value) {
    let line = Envelope::request(RequestId::Number(id), method, params)
        .to_line()
        .expect("encode");
    ws.send(WsMessage::text(line)).await.expect("send");

    let mut seen = Vec::new();
    loop {
        let WsMessage::Text(text) = next_ws(ws).await else {
            continue;
        };
        let message = Envelope::parse(text.as_str())
            .expect("envelope")
            .into_message()
            .expect("message");
        match message {
            Message::Response { id: rid, outcome } if rid == RequestId::Number(id) => {
                return (seen, outcome.expect("success"));
            }
            other => seen.push(other),
        }
    }
}

async fn wait_for_state(state: &AppState, want: impl Fn(BridgeState) -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !want(state.bridge.state()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bridge state reached");
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_responds() {
    let server = TestServer::start().await;

    let (status, body) = http(server.addr, "GET", "/health", "").await;

    assert_eq!(status, 200);
    assert_eq!(body, "ok");
    server.stop().await;
}

#[tokio::test]
async fn session_endpoint_issues_tokens() {
    let server = TestServer::start().await;

    let (status, body) = http(server.addr, "POST", "/api/session", "").await;
    assert_eq!(status, 200);
    let issued: CreateSessionResponse = serde_json::from_str(&body).expect("json body");
    assert_eq!(issued.cwd, server.state.spawn.cwd.display().to_string());
    assert_eq!(server.state.tokens.outstanding(), 1);

    let other = tempfile::tempdir().expect("tempdir");
    let body = json!({"cwd": other.path()}).to_string();
    let (status, body) = http(server.addr, "POST", "/api/session", &body).await;
    assert_eq!(status, 200);
    let issued: CreateSessionResponse = serde_json::from_str(&body).expect("json body");
    assert_eq!(
        issued.cwd,
        other.path().canonicalize().expect("canonical").display().to_string()
    );

    server.stop().await;
}

#[tokio::test]
async fn session_endpoint_rejects_bad_input() {
    let server = TestServer::start().await;

    let (status, _) = http(server.addr, "POST", "/api/session", "{not json").await;
    assert_eq!(status, 400);

    let body = json!({"cwd": "/definitely/not/here"}).to_string();
    let (status, _) = http(server.addr, "POST", "/api/session", &body).await;
    assert_eq!(status, 400);

    assert_eq!(server.state.tokens.outstanding(), 0);
    server.stop().await;
}

// ── WebSocket ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_token_is_closed_with_4001() {
    let server = TestServer::start().await;

    let mut ws = server.connect("bogus").await;

    assert_eq!(expect_close(&mut ws).await, CLOSE_UNAUTHORIZED);
    assert_eq!(server.state.bridge.state(), BridgeState::Idle);
    server.stop().await;
}

#[tokio::test]
async fn missing_token_is_closed_with_4001() {
    let server = TestServer::start().await;

    let url = format!("ws://{}/ws", server.addr);
    let (mut ws, _) = connect_async(url.as_str()).await.expect("upgrade");

    assert_eq!(expect_close(&mut ws).await, CLOSE_UNAUTHORIZED);
    server.stop().await;
}

#[tokio::test]
async fn token_cannot_be_reused() {
    let server = TestServer::start().await;
    let token = server.token();

    let mut first = server.connect(&token).await;
    let (_, result) = call(&mut first, 1, "initialize", json!({"protocolVersion": 1})).await;
    assert_eq!(result["agentInfo"]["name"], "mock-agent");

    let mut second = server.connect(&token).await;
    assert_eq!(expect_close(&mut second).await, CLOSE_UNAUTHORIZED);

    let (_, result) = call(&mut first, 2, "initialize", json!({"protocolVersion": 1})).await;
    assert_eq!(result["protocolVersion"], 1, "first client is unaffected");
    server.stop().await;
}

#[tokio::test]
async fn full_prompt_turn_over_websocket() {
    let server = TestServer::start().await;
    let (_, body) = http(server.addr, "POST", "/api/session", "").await;
    let issued: CreateSessionResponse = serde_json::from_str(&body).expect("json body");
    let mut ws = server.connect(&issued.token).await;

    call(&mut ws, 1, "initialize", json!({"protocolVersion": 1})).await;
    let (_, created) = call(&mut ws, 2, "session/new", json!({"cwd": issued.cwd, "mcpServers": []})).await;
    let session_id = created["sessionId"].as_str().expect("session id").to_owned();

    let (updates, result) = call(
        &mut ws,
        3,
        "session/prompt",
        json!({"sessionId": session_id, "prompt": [{"type": "text", "text": "simple"}]}),
    )
    .await;

    assert_eq!(result, json!({"stopReason": "end_turn"}));
    let texts: Vec<String> = updates
        .iter()
        .filter_map(|m| match m {
            Message::Notification { params, .. } => params["update"]["content"]["text"]
                .as_str()
                .map(str::to_owned),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Hello ", "from ", "mock agent!"]);

    ws.close(None).await.expect("close");
    wait_for_state(&server.state, |s| s == BridgeState::Idle).await;
    server.stop().await;
}

#[tokio::test]
async fn second_client_replaces_the_first() {
    let server = TestServer::start().await;
    let mut first = server.connect(&server.token()).await;
    call(&mut first, 1, "initialize", json!({"protocolVersion": 1})).await;

    let mut second = server.connect(&server.token()).await;

    assert_eq!(expect_close(&mut first).await, 1000);
    let (_, result) = call(&mut second, 1, "initialize", json!({"protocolVersion": 1})).await;
    assert_eq!(result["agentInfo"]["name"], "mock-agent");
    server.stop().await;
}

#[tokio::test]
async fn server_shutdown_closes_the_client_with_going_away() {
    let server = TestServer::start().await;
    let mut ws = server.connect(&server.token()).await;
    call(&mut ws, 1, "initialize", json!({"protocolVersion": 1})).await;
    let state = server.state.clone();

    server.stop().await;

    assert_eq!(expect_close(&mut ws).await, CLOSE_GOING_AWAY);
    assert_eq!(state.bridge.state(), BridgeState::Idle);
}
