mod common;

use axum::http::StatusCode;
use common::{access_token, refresh_token, MailKind, TestApp, PASSWORD};
use identity_service::{
    models::{AccountToken, SecurityEventKind, TokenPurpose},
    services::{error::INVALID_ACCOUNT_TOKEN, IdentityStore},
};
use serde_json::json;

const NEW_PASSWORD: &str = "N3w!passw0rd";

async fn request_reset(app: &TestApp, email: &str) -> StatusCode {
    app.json(
        "POST",
        "/auth/password-reset/request",
        None,
        json!({ "email": email }),
    )
    .await
    .status
}

async fn confirm_reset(app: &TestApp, token: &str, password: &str) -> common::TestResponse {
    app.json(
        "POST",
        "/auth/password-reset/confirm",
        None,
        json!({ "token": token, "new_password": password }),
    )
    .await
}

async fn login(app: &TestApp, email: &str, password: &str) -> StatusCode {
    app.json(
        "POST",
        "/auth/login",
        None,
        json!({ "email": email, "password": password }),
    )
    .await
    .status
}

#[tokio::test]
async fn registration_mails_a_verification_link() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    assert_eq!(session["account"]["email_verified"], false);

    let sent = app.mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MailKind::Verification);
    assert!(sent[0]
        .link
        .starts_with("https://id.example.test/auth/verify-email?token="));

    let res = app.verify_email("alice@example.com").await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["email_verified"], true);

    // Links work once.
    let res = app.verify_email("alice@example.com").await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], INVALID_ACCOUNT_TOKEN);

    let profile = app.get("/users/me", Some(&access_token(&session))).await;
    assert_eq!(profile.body["email_verified"], true);
}

#[tokio::test]
async fn resent_link_replaces_the_previous_one() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);
    let first = app
        .mail
        .last_token(MailKind::Verification, "alice@example.com")
        .unwrap();

    let res = app
        .json("POST", "/users/me/email-verification", Some(&bearer), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::ACCEPTED);

    let stale = app
        .get(&format!("/auth/verify-email?token={}", first), None)
        .await;
    assert_eq!(stale.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.verify_email("alice@example.com").await.status, StatusCode::OK);

    let res = app
        .json("POST", "/users/me/email-verification", Some(&bearer), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn expired_verification_link_is_rejected() {
    let app = TestApp::new();
    app.register("alice@example.com").await;
    let account = app
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();

    let raw = "expired-verification-token";
    app.store
        .replace_account_token(&AccountToken::new(
            account.account_id,
            AccountToken::digest(raw),
            TokenPurpose::EmailVerification,
            chrono::Duration::seconds(-1),
        ))
        .await
        .unwrap();

    let res = app
        .get(&format!("/auth/verify-email?token={}", raw), None)
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], INVALID_ACCOUNT_TOKEN);
}

#[tokio::test]
async fn password_reset_sets_the_password_and_ends_sessions() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;

    assert_eq!(request_reset(&app, "Alice@Example.com").await, StatusCode::ACCEPTED);
    let token = app
        .mail
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .expect("reset mail");

    let weak = confirm_reset(&app, &token, "short").await;
    assert_eq!(weak.status, StatusCode::UNPROCESSABLE_ENTITY);

    let res = confirm_reset(&app, &token, NEW_PASSWORD).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);

    assert_eq!(login(&app, "alice@example.com", PASSWORD).await, StatusCode::UNAUTHORIZED);
    assert_eq!(login(&app, "alice@example.com", NEW_PASSWORD).await, StatusCode::OK);

    let refreshed = app
        .json(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token(&session) }),
        )
        .await;
    assert_eq!(refreshed.status, StatusCode::UNAUTHORIZED);

    // The link proved control of the mailbox.
    let account = app
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(account.email_verified);

    let replay = confirm_reset(&app, &token, "An0ther!pass").await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reset_token_is_stored_hashed_and_superseded() {
    let app = TestApp::new();
    app.register("alice@example.com").await;

    request_reset(&app, "alice@example.com").await;
    let first = app
        .mail
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .unwrap();
    assert!(app
        .store
        .take_account_token(&first, TokenPurpose::PasswordReset)
        .await
        .unwrap()
        .is_none());

    request_reset(&app, "alice@example.com").await;
    let second = app
        .mail
        .last_token(MailKind::PasswordReset, "alice@example.com")
        .unwrap();
    assert_ne!(first, second);

    assert_eq!(confirm_reset(&app, &first, NEW_PASSWORD).await.status, StatusCode::BAD_REQUEST);
    assert_eq!(confirm_reset(&app, &second, NEW_PASSWORD).await.status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_address_gets_the_same_answer_and_no_mail() {
    let app = TestApp::new();
    assert_eq!(request_reset(&app, "nobody@example.com").await, StatusCode::ACCEPTED);
    assert!(app.mail.sent().is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(app
        .store
        .events()
        .iter()
        .any(|e| e.kind == SecurityEventKind::PasswordResetRequested && !e.success));
}

#[tokio::test]
async fn reset_requests_are_throttled_per_address() {
    let app = TestApp::new();
    app.register("alice@example.com").await;

    for _ in 0..3 {
        assert_eq!(request_reset(&app, "alice@example.com").await, StatusCode::ACCEPTED);
    }
    assert_eq!(
        request_reset(&app, "alice@example.com").await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(request_reset(&app, "bob@example.com").await, StatusCode::ACCEPTED);
}
