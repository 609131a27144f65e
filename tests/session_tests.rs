mod common;

use common::{MockGitLab, GOOD_TOKEN};
use std::sync::Arc;
use std::time::Duration;
use GitfleetServer::config::Settings;
use GitfleetServer::errors::ApiError;
use GitfleetServer::session::SessionStore;
use GitfleetServer::upstream::GitLabApi;

fn store_with(settings: &Settings) -> SessionStore {
    let api: Arc<dyn GitLabApi> = Arc::new(MockGitLab::new());
    SessionStore::new(&settings.session, api)
}

#[tokio::test]
async fn create_validates_the_token_upstream() {
    let settings = Settings::default();
    let store = store_with(&settings);

    let (id, user) = store
        .create("https://gitlab.example.com/".to_string(), GOOD_TOKEN.to_string())
        .await
        .expect("session create");
    assert_eq!(user.username, "tester");

    let info = store.get(&id).await.expect("session exists");
    // Trailing slash is normalized away.
    assert_eq!(info.base_url, "https://gitlab.example.com");

    let err = store
        .create("https://gitlab.example.com".to_string(), "wrong".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "bad-credentials");
}

#[tokio::test]
async fn revoked_session_fails_every_token_borrow() {
    let settings = Settings::default();
    let store = store_with(&settings);
    let (id, _) = store
        .create("https://gitlab.example.com".to_string(), GOOD_TOKEN.to_string())
        .await
        .unwrap();

    assert!(store.revoke(&id).await);
    assert!(!store.revoke(&id).await);

    let result: Result<(), ApiError> = store.with_token(&id, |_auth| async { Ok(()) }).await;
    assert_eq!(result.unwrap_err().kind(), "bad-credentials");
    assert!(store.get(&id).await.is_none());
}

#[tokio::test]
async fn idle_sessions_expire_and_sweep() {
    let mut settings = Settings::default();
    settings.session.idle_ttl_secs = 0;
    let store = store_with(&settings);

    let (id, _) = store
        .create("https://gitlab.example.com".to_string(), GOOD_TOKEN.to_string())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.get(&id).await.is_none());
    assert_eq!(store.touch(&id).await.unwrap_err().kind(), "bad-credentials");

    assert_eq!(store.sweep().await, 1);
    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn coarse_request_window_limits_per_session() {
    let mut settings = Settings::default();
    settings.session.request_limit = 2;
    let store = store_with(&settings);

    let (id, _) = store
        .create("https://gitlab.example.com".to_string(), GOOD_TOKEN.to_string())
        .await
        .unwrap();

    store.touch(&id).await.expect("first request");
    store.touch(&id).await.expect("second request");
    let err = store.touch(&id).await.unwrap_err();
    assert_eq!(err.kind(), "rate-limited");

    // Engine-side token borrows are not throttled by the gateway window.
    let ok: Result<(), ApiError> = store.with_token(&id, |_auth| async { Ok(()) }).await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn token_never_escapes_the_store() {
    let settings = Settings::default();
    let store = store_with(&settings);
    let (id, _) = store
        .create("https://gitlab.example.com".to_string(), GOOD_TOKEN.to_string())
        .await
        .unwrap();

    // The public view carries no token field at all; the only way to use
    // the credential is the scoped borrow.
    let seen = store
        .with_token(&id, |auth| async move { Ok(auth.token) })
        .await
        .unwrap();
    assert_eq!(seen, GOOD_TOKEN);

    let debug = format!("{:?}", store.get(&id).await.unwrap());
    assert!(!debug.contains(GOOD_TOKEN));
}
