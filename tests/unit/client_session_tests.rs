//! Unit tests for [`ClientSession`] envelope handling, driven without a
//! transport: outbound lines are read straight from the session's channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use uplink::acp::envelope::{
    Envelope, Message, RequestId, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use uplink::acp::types::PermissionOutcome;
use uplink::client::ClientSession;
use uplink::AppError;

fn session() -> (Arc<ClientSession>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ClientSession::new(tx)), rx)
}

fn permission_request(id: i64) -> Envelope {
    Envelope::request(
        RequestId::Number(id),
        "session/request_permission",
        json!({
            "sessionId": "s1",
            "toolCallId": "tc1",
            "title": "Writing notes.txt",
            "options": [
                {"optionId": "allow", "name": "Allow", "kind": "allow_once"},
                {"optionId": "reject", "name": "Reject", "kind": "reject_once"}
            ]
        }),
    )
}

fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> Message {
    let line = rx.try_recv().expect("an outbound line");
    Envelope::parse(&line)
        .expect("valid envelope")
        .into_message()
        .expect("classifiable")
}

fn response_result(message: Message) -> (RequestId, Value) {
    match message {
        Message::Response {
            id,
            outcome: Ok(result),
        } => (id, result),
        other => panic!("expected success response, got {other:?}"),
    }
}

// ── Permission requests ──────────────────────────────────────────────────────

#[test]
fn permission_request_is_surfaced_and_answered_once() {
    let (session, mut rx) = session();
    session.handle_envelope(permission_request(4));

    let pending = session.with_conversation(|c| c.pending_permissions().to_vec());
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_call_id, "tc1");
    assert_eq!(pending[0].options.len(), 2);

    assert!(session.select_permission(&RequestId::Number(4), "allow"));
    assert!(!session.select_permission(&RequestId::Number(4), "reject"));

    let (id, result) = response_result(next_message(&mut rx));
    assert_eq!(id, RequestId::Number(4));
    assert_eq!(
        result,
        json!({"outcome": {"outcome": "selected", "optionId": "allow"}})
    );
    assert!(rx.try_recv().is_err(), "exactly one response is sent");

    let label = session.with_conversation(|c| c.resolved_permissions()[0].label());
    assert_eq!(label, "Approved");
}

#[test]
fn cancel_racing_a_new_request_leaves_both_views_in_agreement() {
    for round in 0..200 {
        let (session, _rx) = session();
        std::thread::scope(|scope| {
            scope.spawn(|| session.handle_envelope(permission_request(round)));
            scope.spawn(|| {
                session.cancel_all_permissions();
            });
        });

        let tracked = session.with_conversation(|c| c.pending_permissions().len());
        let correlated = session.correlation().pending_permissions().len();
        assert_eq!(tracked, correlated, "round {round}");
    }
}

#[test]
fn selection_racing_a_new_request_leaves_both_views_in_agreement() {
    for round in 0..200 {
        let (session, _rx) = session();
        let id = RequestId::Number(round);
        std::thread::scope(|scope| {
            scope.spawn(|| session.handle_envelope(permission_request(round)));
            scope.spawn(|| {
                session.select_permission(&id, "allow");
            });
        });

        let tracked = session.with_conversation(|c| c.pending_permissions().len());
        let correlated = session.correlation().pending_permissions().len();
        assert_eq!(tracked, correlated, "round {round}");
    }
}

#[test]
fn unknown_option_is_rejected_and_request_stays_pending() {
    let (session, mut rx) = session();
    session.handle_envelope(permission_request(1));

    assert!(!session.select_permission(&RequestId::Number(1), "maybe"));

    assert!(rx.try_recv().is_err());
    assert_eq!(session.correlation().pending_permissions().len(), 1);
}

#[test]
fn cancel_all_permissions_answers_cancelled_once() {
    let (session, mut rx) = session();
    session.handle_envelope(permission_request(1));
    session.handle_envelope(permission_request(2));

    let cancelled = session.cancel_all_permissions();
    assert_eq!(cancelled, vec![RequestId::Number(1), RequestId::Number(2)]);
    assert!(session.cancel_all_permissions().is_empty());

    for expected in [1, 2] {
        let (id, result) = response_result(next_message(&mut rx));
        assert_eq!(id, RequestId::Number(expected));
        assert_eq!(result, json!({"outcome": {"outcome": "cancelled"}}));
    }
    assert!(rx.try_recv().is_err());

    let outcomes: Vec<PermissionOutcome> = session.with_conversation(|c| {
        c.resolved_permissions()
            .iter()
            .map(|r| r.outcome.clone())
            .collect()
    });
    assert_eq!(outcomes, vec![PermissionOutcome::Cancelled; 2]);
}

#[test]
fn malformed_permission_request_gets_invalid_params() {
    let (session, mut rx) = session();
    session.handle_envelope(Envelope::request(
        RequestId::Str("bad".into()),
        "session/request_permission",
        json!({"title": 5}),
    ));

    match next_message(&mut rx) {
        Message::Response {
            id,
            outcome: Err(err),
        } => {
            assert_eq!(id, RequestId::Str("bad".into()));
            assert_eq!(err.code, INVALID_PARAMS);
        }
        other => panic!("expected error response, got {other:?}"),
    }
    assert!(session.with_conversation(|c| c.pending_permissions().is_empty()));
}

#[test]
fn unsupported_agent_request_gets_method_not_found() {
    let (session, mut rx) = session();
    session.handle_envelope(Envelope::request(
        RequestId::Number(9),
        "fs/read_text_file",
        json!({"path": "/etc/hosts"}),
    ));

    match next_message(&mut rx) {
        Message::Response {
            id,
            outcome: Err(err),
        } => {
            assert_eq!(id, RequestId::Number(9));
            assert_eq!(err.code, METHOD_NOT_FOUND);
        }
        other => panic!("expected error response, got {other:?}"),
    }
}

// ── Updates and responses ────────────────────────────────────────────────────

#[test]
fn session_update_is_folded_into_the_conversation() {
    let (session, _rx) = session();
    for text in ["Hello ", "world"] {
        session.handle_envelope(Envelope::notification(
            "session/update",
            json!({
                "sessionId": "s1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": text}
                }
            }),
        ));
    }

    let texts: Vec<String> = session.with_conversation(|c| c.messages().iter().map(|m| m.text()).collect());
    assert_eq!(texts, vec!["Hello world".to_owned()]);
}

#[test]
fn malformed_session_update_is_dropped() {
    let (session, _rx) = session();
    session.handle_envelope(Envelope::notification(
        "session/update",
        json!({"update": "nope"}),
    ));
    assert_eq!(session.with_conversation(|c| c.revision()), 0);
}

#[test]
fn unmatched_response_is_ignored() {
    let (session, mut rx) = session();
    session.handle_envelope(Envelope::response(RequestId::Number(77), json!({})));
    assert!(rx.try_recv().is_err());
    assert!(session.correlation().is_empty());
}

#[tokio::test]
async fn request_is_resolved_by_matching_response() {
    let (session, mut rx) = session();
    let call = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.request("custom/echo", json!({"x": 1})).await }
    });

    let line = rx.recv().await.expect("request line");
    let Message::Request { id, method, params } = Envelope::parse(&line)
        .expect("envelope")
        .into_message()
        .expect("message")
    else {
        panic!("expected a request: {line}");
    };
    assert_eq!(method, "custom/echo");
    assert_eq!(params, json!({"x": 1}));

    session.handle_envelope(Envelope::response(id, json!({"x": 2})));
    let value = call.await.expect("join").expect("response");
    assert_eq!(value, json!({"x": 2}));
}

#[tokio::test]
async fn error_response_is_returned_as_rpc_error() {
    let (session, mut rx) = session();
    let call = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.request("custom/fail", json!({})).await }
    });

    let line = rx.recv().await.expect("request line");
    let id = Envelope::parse(&line).expect("envelope").id.expect("has id");
    session.handle_envelope(Envelope::error_response(id, RpcError::new(-32_000, "boom")));

    let err = call.await.expect("join").expect_err("must fail");
    assert_eq!(
        err,
        AppError::Rpc {
            code: -32_000,
            message: "boom".into()
        }
    );
}

#[tokio::test]
async fn close_fails_outstanding_requests() {
    let (session, mut rx) = session();
    let call = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.request("custom/slow", json!({})).await }
    });
    let _ = rx.recv().await.expect("request line");

    session.close();

    let err = call.await.expect("join").expect_err("must fail");
    assert!(matches!(err, AppError::TransportClosed(_)));
}

#[tokio::test]
async fn dropped_request_future_abandons_its_waiter() {
    let (session, mut rx) = session();
    let call = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.request("custom/slow", json!({})).await }
    });
    let line = rx.recv().await.expect("request line");
    call.abort();
    let _ = call.await;

    let id = Envelope::parse(&line).expect("envelope").id.expect("has id");
    assert!(session.correlation().is_empty());
    session.handle_envelope(Envelope::response(id, json!({})));
}

#[tokio::test]
async fn dropped_prompt_future_clears_the_prompting_flag() {
    let (session, mut rx) = session();
    let created = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.new_session("/tmp", Vec::new()).await }
    });
    let line = rx.recv().await.expect("session/new line");
    let id = Envelope::parse(&line).expect("envelope").id.expect("has id");
    session.handle_envelope(Envelope::response(id, json!({"sessionId": "s1"})));
    created.await.expect("join").expect("session created");

    let outcome = tokio::time::timeout(Duration::from_millis(50), session.prompt("simple")).await;

    assert!(outcome.is_err(), "no response was ever sent");
    assert!(rx.try_recv().is_ok(), "the prompt went out");
    assert!(!session.with_conversation(|c| c.is_prompting()));
    assert!(session.correlation().is_empty());
}

// ── Preconditions ────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_and_cancel_require_a_session() {
    let (session, mut rx) = session();

    assert!(matches!(
        session.prompt("simple").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(session.cancel(), Err(AppError::NotFound(_))));
    assert!(rx.try_recv().is_err(), "nothing is sent without a session");
    assert!(session.session_id().is_none());
}
