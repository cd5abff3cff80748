//! API tests against the in-process router
//!
//! Every test runs on an in-memory user store and the simulated backend.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use vmcaptain_common::Database;
use vmcaptain_server::config::VcenterConfig;
use vmcaptain_server::hypervisor::SimulatedConnector;
use vmcaptain_server::{AppState, BackendKind, ServerConfig, WebServer};

fn app() -> Router {
    let config = ServerConfig {
        backend: BackendKind::Simulated,
        vcenter: VcenterConfig {
            url: Some("https://vc.lab.local/sdk".into()),
            username: Some("administrator@vsphere.local".into()),
            password: Some("s3cret-vc-pass".into()),
            ignore_ssl: true,
        },
        ..Default::default()
    };
    let state = AppState::new(
        Database::open_memory().unwrap(),
        Arc::new(SimulatedConnector::new()),
        config,
    );
    WebServer::new(state).router()
}

struct Call<'a> {
    method: Method,
    uri: &'a str,
    token: Option<&'a str>,
    session: Option<&'a str>,
    body: Option<Value>,
}

impl<'a> Call<'a> {
    fn new(method: Method, uri: &'a str) -> Self {
        Self {
            method,
            uri,
            token: None,
            session: None,
            body: None,
        }
    }

    fn token(mut self, token: &'a str) -> Self {
        self.token = Some(token);
        self
    }

    fn session(mut self, session: &'a str) -> Self {
        self.session = Some(session);
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    async fn send(self, app: &Router) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(self.method).uri(self.uri);
        if let Some(token) = self.token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        if let Some(session) = self.session {
            builder = builder.header("x-vcenter-session", session);
        }
        let request = match self.body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = Call::new(Method::POST, "/api/auth/login")
        .json(json!({"username": username, "password": password}))
        .send(app)
        .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn login_flow() {
    let app = app();

    let (status, body) = Call::new(Method::POST, "/api/auth/login")
        .json(json!({"username": "admin", "password": "123456"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "admin");
    assert_eq!(body["user"]["role"], "ADMIN");
    assert!(body["user"].get("password").is_none());
    assert!(body["expires_at"].as_i64().unwrap() > 0);

    let (status, body) = Call::new(Method::POST, "/api/auth/login")
        .json(json!({"username": "admin", "password": "wrong"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid credentials");

    let (status, body) = Call::new(Method::POST, "/api/auth/login")
        .json(json!({"username": "admin"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Username and password are required");
}

#[tokio::test]
async fn logout_invalidates_token() {
    let app = app();
    let token = login(&app, "user", "123456").await;

    let (status, body) = Call::new(Method::GET, "/api/auth/whoami")
        .token(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "user");

    let (status, _) = Call::new(Method::POST, "/api/auth/logout")
        .token(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = Call::new(Method::GET, "/api/auth/whoami")
        .token(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let app = app();
    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Authorization header required");
}

#[tokio::test]
async fn user_management_is_admin_only() {
    let app = app();
    let user = login(&app, "user", "123456").await;

    let (status, body) = Call::new(Method::GET, "/api/users").token(&user).send(&app).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Unauthorized");

    let (status, _) = Call::new(Method::PUT, "/api/users/user-1/vms/vm-001")
        .token(&user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn add_and_delete_users() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, created) = Call::new(Method::POST, "/api/users")
        .token(&admin)
        .json(json!({"username": "carol", "password": "pw", "role": "USER"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["username"], "carol");
    assert_eq!(created["assigned_vms"], json!([]));
    let carol_id = created["id"].as_str().unwrap().to_string();

    let (status, body) = Call::new(Method::POST, "/api/users")
        .token(&admin)
        .json(json!({"username": "carol", "password": "pw", "role": "USER"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Username already exists");

    let (status, body) = Call::new(Method::POST, "/api/users")
        .token(&admin)
        .json(json!({"username": "dave", "password": "pw"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Username, password, and role are required");

    let (_, users) = Call::new(Method::GET, "/api/users").token(&admin).send(&app).await;
    assert_eq!(users.as_array().unwrap().len(), 3);

    let (status, body) = Call::new(Method::DELETE, "/api/users/admin-1")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Cannot delete yourself");

    let (status, _) = Call::new(Method::DELETE, "/api/users/nobody")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/api/users/{}", carol_id);
    let (status, _) = Call::new(Method::DELETE, &uri).token(&admin).send(&app).await;
    assert_eq!(status, StatusCode::OK);

    let (_, users) = Call::new(Method::GET, "/api/users").token(&admin).send(&app).await;
    assert_eq!(users.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn change_password() {
    let app = app();
    let token = login(&app, "user", "123456").await;

    let (status, body) = Call::new(Method::PUT, "/api/users/password")
        .token(&token)
        .json(json!({"currentPassword": "nope", "newPassword": "hunter22"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Current password is incorrect");

    let (status, _) = Call::new(Method::PUT, "/api/users/password")
        .token(&token)
        .json(json!({"currentPassword": "123456"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = Call::new(Method::PUT, "/api/users/password")
        .token(&token)
        .json(json!({"currentPassword": "123456", "newPassword": "hunter22"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    login(&app, "user", "hunter22").await;
}

#[tokio::test]
async fn vm_visibility_follows_grants() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;
    let user = login(&app, "user", "123456").await;

    let (status, vms) = Call::new(Method::GET, "/api/vcenter/vms").token(&admin).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vms.as_array().unwrap().len(), 8);

    let (_, vms) = Call::new(Method::GET, "/api/vcenter/vms").token(&user).send(&app).await;
    assert!(vms.as_array().unwrap().is_empty());

    let (status, _) = Call::new(Method::PUT, "/api/users/user-1/vms/vm-002")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = Call::new(Method::PUT, "/api/users/ghost/vms/vm-002")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, vms) = Call::new(Method::GET, "/api/vcenter/vms").token(&user).send(&app).await;
    let ids: Vec<&str> = vms
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["vm-002"]);

    let (status, vm) = Call::new(Method::GET, "/api/vcenter/vms/vm-002")
        .token(&user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["name"], "Database Server");

    let (status, _) = Call::new(Method::GET, "/api/vcenter/vms/vm-001")
        .token(&user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, vm) = Call::new(Method::GET, "/api/vcenter/vms/vm-002")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(vm["assigned_users"], json!(["user"]));

    let (status, _) = Call::new(Method::DELETE, "/api/users/user-1/vms/vm-002")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, vms) = Call::new(Method::GET, "/api/vcenter/vms").token(&user).send(&app).await;
    assert!(vms.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn power_operations() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, _) = Call::new(Method::POST, "/api/vcenter/vms/vm-001/power/suspend")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = Call::new(Method::POST, "/api/vcenter/vms/vm-001/power/start")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = Call::new(Method::POST, "/api/vcenter/vms/vm-001/power/stop")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, vm) = Call::new(Method::GET, "/api/vcenter/vms/vm-001")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(vm["status"], "STOPPED");
    assert_eq!(vm["cpu_usage"], 0);

    let (status, _) = Call::new(Method::POST, "/api/vcenter/vms/vm-404/power/start")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn snapshots() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, body) = Call::new(Method::POST, "/api/vcenter/vms/vm-003/snapshots")
        .token(&admin)
        .json(json!({"name": "  "}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Snapshot name is required");

    let (status, snap) = Call::new(Method::POST, "/api/vcenter/vms/vm-003/snapshots")
        .token(&admin)
        .json(json!({"name": "before-upgrade", "description": "pre 2.0"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(snap["name"], "before-upgrade");

    let (status, tree) = Call::new(Method::GET, "/api/vcenter/vms/vm-003/snapshots")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree.as_array().unwrap().len(), 1);
    assert_eq!(tree[0]["id"], snap["id"]);

    // A new snapshot hangs off the current one
    let (status, child) = Call::new(Method::POST, "/api/vcenter/vms/vm-003/snapshots")
        .token(&admin)
        .json(json!({"name": "after-upgrade"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, tree) = Call::new(Method::GET, "/api/vcenter/vms/vm-003/snapshots")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(tree.as_array().unwrap().len(), 1);
    assert_eq!(tree[0]["children"].as_array().unwrap().len(), 1);
    assert_eq!(tree[0]["children"][0]["id"], child["id"]);
    assert_eq!(tree[0]["children"][0]["name"], "after-upgrade");

    let (status, _) = Call::new(Method::GET, "/api/vcenter/vms/vm-404/snapshots")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ungranted_vms_are_hidden_from_every_route() {
    let app = app();
    let user = login(&app, "user", "123456").await;

    let routes = [
        (Method::POST, "/api/vcenter/vms/vm-001/power/stop", None),
        (Method::GET, "/api/vcenter/vms/vm-001/snapshots", None),
        (
            Method::POST,
            "/api/vcenter/vms/vm-001/snapshots",
            Some(json!({"name": "sneaky"})),
        ),
        (Method::GET, "/api/vcenter/vms/vm-001/metrics", None),
    ];
    for (method, uri, body) in routes {
        let mut call = Call::new(method, uri).token(&user);
        if let Some(body) = body {
            call = call.json(body);
        }
        let (status, body) = call.send(&app).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"], "VM not found", "{uri}");
    }

    // Nothing was changed behind the user's back
    let admin = login(&app, "admin", "123456").await;
    let (_, vm) = Call::new(Method::GET, "/api/vcenter/vms/vm-001")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(vm["status"], "RUNNING");
    let (_, tree) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/snapshots")
        .token(&admin)
        .send(&app)
        .await;
    assert!(tree.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_and_stats() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, metrics) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["cpu"].as_array().unwrap().len(), 96);

    let (_, metrics) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics?hours=2")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(metrics["memory"].as_array().unwrap().len(), 8);
    assert_eq!(metrics["memory"][1]["time"], "00:15");

    let (status, metrics) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics?hours=168")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["cpu"].as_array().unwrap().len(), 672);

    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics?hours=169")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "hours must be at most 168");

    let (status, stats) = Call::new(Method::GET, "/api/vcenter/stats")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_vms"], 8);
    assert_eq!(stats["running_vms"], 5);
}

#[tokio::test]
async fn malformed_parameters_get_json_errors() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics?hours=abc")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("query string"));

    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms/vm-001/metrics?hours=-1")
        .token(&admin)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn explicit_sessions_belong_to_their_owner() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;
    let user = login(&app, "user", "123456").await;

    let (_, body) = Call::new(Method::POST, "/api/vcenter/connect")
        .token(&admin)
        .json(json!({}))
        .send(&app)
        .await;
    let admin_session = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms")
        .token(&user)
        .session(&admin_session)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized or session expired");

    let (status, body) = Call::new(Method::POST, "/api/vcenter/disconnect")
        .token(&user)
        .session(&admin_session)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Session not found");

    // Still alive for its owner
    let (status, _) = Call::new(Method::GET, "/api/vcenter/vms")
        .token(&admin)
        .session(&admin_session)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    // Admins may close sessions opened by others
    let (_, body) = Call::new(Method::POST, "/api/vcenter/connect")
        .token(&user)
        .json(json!({}))
        .send(&app)
        .await;
    let user_session = body["session_id"].as_str().unwrap().to_string();
    let (status, _) = Call::new(Method::POST, "/api/vcenter/disconnect")
        .token(&admin)
        .session(&user_session)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn explicit_sessions() {
    let app = app();
    let admin = login(&app, "admin", "123456").await;

    let (status, body) = Call::new(Method::POST, "/api/vcenter/connect")
        .token(&admin)
        .json(json!({"url": "vc.lab.local"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid vCenter URL format");

    let (status, body) = Call::new(Method::POST, "/api/vcenter/connect")
        .token(&admin)
        .json(json!({"url": "https://other.lab.local", "username": "ops", "password": "pw"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("session-"));

    let (status, vms) = Call::new(Method::GET, "/api/vcenter/vms")
        .token(&admin)
        .session(&session_id)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vms.as_array().unwrap().len(), 8);

    let (status, _) = Call::new(Method::POST, "/api/vcenter/disconnect")
        .token(&admin)
        .session(&session_id)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = Call::new(Method::POST, "/api/vcenter/disconnect")
        .token(&admin)
        .session(&session_id)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = Call::new(Method::GET, "/api/vcenter/vms")
        .token(&admin)
        .session(&session_id)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized or session expired");
}

#[tokio::test]
async fn health_hides_password() {
    let app = app();
    let (status, body) = Call::new(Method::GET, "/health").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["vcenter_url"], "https://vc.lab.local/sdk");
    assert!(!body.to_string().contains("s3cret-vc-pass"));

    let (status, body) = Call::new(Method::GET, "/").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = Call::new(Method::GET, "/nowhere").send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
