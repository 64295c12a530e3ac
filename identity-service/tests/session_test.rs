mod common;

use axum::http::StatusCode;
use common::{access_token, refresh_token, TestApp, PASSWORD};
use identity_service::{
    models::{ClientContext, SecurityEventKind},
    services::{error::SESSION_EXPIRED, IdentityStore},
    utils::Password,
};
use serde_json::json;

#[tokio::test]
async fn register_then_login() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    assert_eq!(session["token_type"], "Bearer");
    assert_eq!(session["expires_in"], 600);
    assert_eq!(session["account"]["display_name"], "alice");

    let res = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "ALICE@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["account"]["account_id"], session["account"]["account_id"]);
}

#[tokio::test]
async fn duplicate_registration_conflicts_and_weak_password_is_rejected() {
    let app = TestApp::new();
    app.register("alice@example.com").await;

    let dup = app
        .json(
            "POST",
            "/auth/register",
            None,
            json!({ "email": "alice@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(dup.status, StatusCode::CONFLICT);

    let weak = app
        .json(
            "POST",
            "/auth/register",
            None,
            json!({ "email": "bob@example.com", "password": "alllowercase" }),
        )
        .await;
    assert_eq!(weak.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_password_and_unknown_email_look_the_same() {
    let app = TestApp::new();
    app.register("alice@example.com").await;

    let wrong = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": "Wr0ng!pass" }),
        )
        .await;
    let unknown = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "nobody@example.com", "password": PASSWORD }),
        )
        .await;

    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.status, unknown.status);
    assert_eq!(wrong.body, unknown.body);
}

#[tokio::test]
async fn refresh_rotates_and_replay_revokes_the_family() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    let first_refresh = refresh_token(&session);

    let rotated = app
        .json("POST", "/auth/refresh", None, json!({ "refresh_token": first_refresh }))
        .await;
    assert_eq!(rotated.status, StatusCode::OK);
    let second_refresh = refresh_token(&rotated.body);
    assert_ne!(first_refresh, second_refresh);

    let replay = app
        .json("POST", "/auth/refresh", None, json!({ "refresh_token": first_refresh }))
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.body["error"], SESSION_EXPIRED);

    // The legitimate holder's newer token died with the family.
    let after = app
        .json("POST", "/auth/refresh", None, json!({ "refresh_token": second_refresh }))
        .await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(app
        .store
        .events()
        .iter()
        .any(|e| e.kind == SecurityEventKind::TokenReplayDetected));
}

#[tokio::test]
async fn access_token_is_not_a_refresh_token() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;

    let res = app
        .json(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": access_token(&session) }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = app.get("/users/me", Some(&refresh_token(&session))).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_ends_the_refresh_family() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;

    let res = app
        .json(
            "POST",
            "/auth/logout",
            None,
            json!({ "refresh_token": refresh_token(&session) }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let res = app
        .json(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token(&session) }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_change_invalidates_existing_sessions() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    let old_access = access_token(&session);

    let changed = app
        .json(
            "POST",
            "/users/me/password",
            Some(&old_access),
            json!({ "current_password": PASSWORD, "new_password": "N3w!passw0rd" }),
        )
        .await;
    assert_eq!(changed.status, StatusCode::OK, "{}", changed.body);

    let res = app.get("/users/me", Some(&old_access)).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    let res = app
        .json(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token(&session) }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = app.get("/users/me", Some(&access_token(&changed.body))).await;
    assert_eq!(res.status, StatusCode::OK);

    let res = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": "N3w!passw0rd" }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn profile_update_from_stale_snapshot_keeps_the_new_password() {
    let app = TestApp::new();
    app.register("alice@example.com").await;
    let snapshot = app
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    let ctx = ClientContext::default();

    app.state
        .auth_service
        .change_password(
            &snapshot,
            &Password::new(PASSWORD.to_string()),
            &Password::new("N3w!passw0rd".to_string()),
            &ctx,
        )
        .await
        .unwrap();
    // Still holding the account as it was before the password change.
    let renamed = app
        .state
        .auth_service
        .update_profile(&snapshot, "Alice", &ctx)
        .await
        .unwrap();
    assert_eq!(renamed.display_name, "Alice");

    let res = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = app
        .json(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "alice@example.com", "password": "N3w!passw0rd" }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["account"]["display_name"], "Alice");
}

#[tokio::test]
async fn wrong_current_password_is_rejected() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);

    let res = app
        .json(
            "POST",
            "/users/me/password",
            Some(&bearer),
            json!({ "current_password": "Wr0ng!pass", "new_password": "N3w!passw0rd" }),
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn profile_can_be_read_and_renamed() {
    let app = TestApp::new();
    let bearer = access_token(&app.register("alice@example.com").await);

    let res = app
        .json(
            "PATCH",
            "/users/me",
            Some(&bearer),
            json!({ "display_name": "Alice Example" }),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["display_name"], "Alice Example");

    let res = app.get("/users/me", Some(&bearer)).await;
    assert_eq!(res.body["display_name"], "Alice Example");
    assert_eq!(res.body["email"], "alice@example.com");
}

#[tokio::test]
async fn account_deletion_needs_confirmation_and_ends_everything() {
    let app = TestApp::new();
    let session = app.register("alice@example.com").await;
    let bearer = access_token(&session);
    let (username, secret, _) = app
        .create_credential(&bearer, json!({ "label": "phone", "username": "alice_phone" }))
        .await;

    let res = app
        .json(
            "DELETE",
            "/users/me",
            Some(&bearer),
            json!({ "confirmation": "delete", "password": PASSWORD }),
        )
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .json(
            "DELETE",
            "/users/me",
            Some(&bearer),
            json!({ "confirmation": "DELETE", "password": PASSWORD }),
        )
        .await;
    assert_eq!(res.status, StatusCode::NO_CONTENT);

    assert_eq!(app.store.account_count(), 0);
    assert_eq!(
        app.get("/users/me", Some(&bearer)).await.status,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        app.get_basic("/protocol/principal", &username, &secret)
            .await
            .status,
        StatusCode::UNAUTHORIZED
    );
    assert!(app
        .store
        .events()
        .iter()
        .any(|e| e.kind == SecurityEventKind::AccountDeleted));
}
