mod common;

use axum::http::{header, StatusCode};
use chrono::{Duration, Utc};
use common::{access_token, TestApp};
use identity_service::{
    middleware::BASIC_CHALLENGE,
    models::SecurityEventKind,
    services::{error::INVALID_CREDENTIALS, IdentityStore},
};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn issued_credential_authenticates_protocol_requests() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    let bearer = access_token(&session);

    let (username, secret, id) = app
        .create_credential(
            &bearer,
            json!({ "label": "phone", "username": "alice_cred_username" }),
        )
        .await;
    assert_eq!(username, "alice_cred_username");
    assert_eq!(secret.len(), 43);

    let res = app
        .get_basic("/protocol/principal", &username, &secret)
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["account"]["email"], "alice@example.com");
    assert_eq!(res.body["credential_id"], id.as_str());
    assert_eq!(res.body["scope"]["access"], "read-write");

    // The plaintext secret is never listed again.
    let listed = app.get("/credentials", Some(&bearer)).await;
    assert_eq!(listed.status, StatusCode::OK);
    let credentials = listed.body["credentials"].as_array().unwrap();
    assert_eq!(credentials.len(), 1);
    assert!(credentials[0].get("secret").is_none());
}

#[tokio::test]
async fn scoped_credential_reports_its_scope() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("carol@example.com").await);

    let (username, secret, _) = app
        .create_credential(
            &bearer,
            json!({
                "label": "calendar sync",
                "username": "carol_cal",
                "scope": { "access": "read", "resource": "calendars" }
            }),
        )
        .await;

    let res = app
        .get_basic("/protocol/principal", &username, &secret)
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["scope"], json!({ "access": "read", "resource": "calendars" }));
}

#[tokio::test]
async fn wrong_unknown_revoked_and_expired_all_look_the_same() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);

    let (username, secret, id) = app
        .create_credential(&bearer, json!({ "label": "phone", "username": "alice_phone" }))
        .await;

    let wrong = app
        .get_basic("/protocol/principal", &username, "not-the-secret")
        .await;
    let unknown = app
        .get_basic("/protocol/principal", "nobody_here", &secret)
        .await;

    let revoked = app
        .json("DELETE", &format!("/credentials/{}", id), Some(&bearer), json!({}))
        .await;
    assert_eq!(revoked.status, StatusCode::OK);
    assert!(revoked.body["revoked_utc"].is_string());
    let after_revoke = app
        .get_basic("/protocol/principal", &username, &secret)
        .await;

    let (exp_user, exp_secret, exp_id) = app
        .create_credential(&bearer, json!({ "label": "tablet", "username": "alice_tablet" }))
        .await;
    let mut credential = app
        .store
        .find_credential(Uuid::parse_str(&exp_id).unwrap())
        .await
        .unwrap()
        .unwrap();
    credential.expires_utc = Some(Utc::now() - Duration::minutes(1));
    app.store.update_credential(&credential).await.unwrap();
    let after_expiry = app
        .get_basic("/protocol/principal", &exp_user, &exp_secret)
        .await;

    for res in [&wrong, &unknown, &after_revoke, &after_expiry] {
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body, json!({ "error": INVALID_CREDENTIALS }));
        assert_eq!(
            res.headers.get(header::WWW_AUTHENTICATE).unwrap(),
            BASIC_CHALLENGE
        );
    }
}

#[tokio::test]
async fn missing_basic_header_gets_a_challenge() {
    let app = TestApp::new();
    let res = app.get("/protocol/principal", None).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert!(res.headers.get(header::WWW_AUTHENTICATE).is_some());
}

#[tokio::test]
async fn another_account_cannot_revoke_or_remove() {
    let app = TestApp::new();
    let alice = access_token(&app.register("alice@example.com").await);
    let bob = access_token(&app.register("bob@example.com").await);

    let (username, secret, id) = app
        .create_credential(&alice, json!({ "label": "phone", "username": "alice_phone" }))
        .await;

    let res = app
        .json("DELETE", &format!("/credentials/{}", id), Some(&bob), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    let res = app
        .json("DELETE", &format!("/credentials/{}/history", id), Some(&bob), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);

    // Still usable by its owner.
    let res = app
        .get_basic("/protocol/principal", &username, &secret)
        .await;
    assert_eq!(res.status, StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(app
        .store
        .events()
        .iter()
        .any(|e| e.kind == SecurityEventKind::CredentialOwnershipDenied && !e.success));
}

#[tokio::test]
async fn only_dead_credentials_can_be_removed() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);
    let (_, _, id) = app
        .create_credential(&bearer, json!({ "label": "phone", "username": "alice_phone" }))
        .await;

    let res = app
        .json("DELETE", &format!("/credentials/{}/history", id), Some(&bearer), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    app.json("DELETE", &format!("/credentials/{}", id), Some(&bearer), json!({}))
        .await;
    let res = app
        .json("DELETE", &format!("/credentials/{}/history", id), Some(&bearer), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::NO_CONTENT);

    let listed = app.get("/credentials", Some(&bearer)).await;
    assert!(listed.body["credentials"].as_array().unwrap().is_empty());

    let res = app
        .json("DELETE", &format!("/credentials/{}", id), Some(&bearer), json!({}))
        .await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn credential_username_cannot_shadow_another_account() {
    let app = TestApp::new();
    let alice = access_token(&app.register("alice@example.com").await);
    let bob_session = app.register("bob@example.com").await;
    let bob_username = bob_session["account"]["username"].as_str().unwrap().to_string();

    let res = app
        .json(
            "POST",
            "/credentials",
            Some(&alice),
            json!({ "label": "phone", "username": bob_username }),
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn past_expiry_is_rejected_at_creation() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);

    let res = app
        .json(
            "POST",
            "/credentials",
            Some(&bearer),
            json!({
                "label": "phone",
                "expires_utc": (Utc::now() - Duration::hours(1)).to_rfc3339()
            }),
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn successful_protocol_auth_stamps_usage() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);
    let (username, secret, _) = app
        .create_credential(&bearer, json!({ "label": "phone", "username": "alice_phone" }))
        .await;

    app.get_basic("/protocol/principal", &username, &secret)
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let listed = app.get("/credentials", Some(&bearer)).await;
    let credential = &listed.body["credentials"][0];
    assert!(credential["last_used_utc"].is_string());
    assert_eq!(credential["last_used_ip"], "203.0.113.7");
}
