//! Unit tests for single-use session tokens.

use std::path::PathBuf;
use std::time::Duration;

use uplink::server::token::TokenStore;
use uplink::AppError;

#[test]
fn token_is_consumed_exactly_once() {
    let store = TokenStore::new(Duration::from_secs(60));
    let issued = store.issue(PathBuf::from("/work/project"));

    assert_eq!(store.outstanding(), 1);
    assert_eq!(
        store.consume(&issued.token).expect("first use"),
        PathBuf::from("/work/project")
    );
    assert!(matches!(
        store.consume(&issued.token),
        Err(AppError::Unauthorized(_))
    ));
    assert_eq!(store.outstanding(), 0);
}

#[test]
fn tokens_are_unique() {
    let store = TokenStore::new(Duration::from_secs(60));
    let a = store.issue(PathBuf::from("/a"));
    let b = store.issue(PathBuf::from("/b"));

    assert_ne!(a.token, b.token);
    assert_eq!(store.consume(&b.token).expect("b"), PathBuf::from("/b"));
    assert_eq!(store.consume(&a.token).expect("a"), PathBuf::from("/a"));
}

#[test]
fn unknown_token_is_unauthorized() {
    let store = TokenStore::new(Duration::from_secs(60));
    assert!(matches!(
        store.consume("nope"),
        Err(AppError::Unauthorized(_))
    ));
}

#[test]
fn expired_token_is_rejected_and_removed() {
    let store = TokenStore::new(Duration::ZERO);
    let issued = store.issue(PathBuf::from("/work"));

    let result = store.consume(&issued.token);

    assert!(matches!(result, Err(AppError::Unauthorized(msg)) if msg.contains("expired")));
    assert_eq!(store.outstanding(), 0);
}

#[test]
fn issuing_purges_expired_tokens() {
    let store = TokenStore::new(Duration::ZERO);
    store.issue(PathBuf::from("/one"));
    store.issue(PathBuf::from("/two"));

    assert_eq!(store.outstanding(), 1, "only the newest token remains");
}

#[test]
fn issued_token_serialises_with_camel_case_timestamp() {
    let store = TokenStore::new(Duration::from_secs(60));
    let issued = store.issue(PathBuf::from("/work"));

    let value = serde_json::to_value(&issued).expect("serialise");

    assert_eq!(value["token"], issued.token.as_str());
    assert!(value.get("issuedAt").is_some());
}
