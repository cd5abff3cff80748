//! HTTP client for the VM Captain API

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use vmcaptain_common::{
    CreateSnapshotRequest, PowerOperation, Role, Snapshot, StatsSummary, User, Vm, VmMetrics,
};

const SESSION_HEADER: &str = "x-vcenter-session";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot reach server at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("invalid response from server: {0}")]
    Decode(String),

    #[error("invalid server URL {url}: {reason}")]
    BadUrl { url: String, reason: String },
}

impl ClientError {
    /// HTTP status of an API error
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

/// Optional vCenter connection overrides; anything unset uses the server's
/// configured defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_ssl: Option<bool>,
}

impl ConnectRequest {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.ignore_ssl.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    session_id: String,
}

/// Turn an error response into a message: `{"error": msg}` yields `msg`,
/// anything else is reported with its status.
pub fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("error").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
    }
    let body = body.trim();
    format!(
        "HTTP {}: {}",
        status.as_u16(),
        if body.is_empty() {
            "No error details available"
        } else {
            body
        }
    )
}

/// Authenticated API client
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Build an endpoint URL from path segments. Each segment is
    /// percent-encoded, so ids containing `/` or spaces stay one segment.
    fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let bad_url = |reason: String| ClientError::BadUrl {
            url: self.base.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base).map_err(|e| bad_url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad_url("cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        session: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> ClientResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        debug!("{} {}", method, url);

        let mut req = self.http.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(session) = session {
            req = req.header(SESSION_HEADER, session);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|source| ClientError::Unreachable {
            url: self.base.clone(),
            source,
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message: error_message(status, &text),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &[&str],
        session: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> ClientResult<T> {
        self.send(method, path, &[], session, body)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn call_with_query<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        session: Option<&str>,
    ) -> ClientResult<T> {
        self.send(method, path, query, session, None)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn call_unit(
        &self,
        method: Method,
        path: &[&str],
        session: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> ClientResult<()> {
        self.send(method, path, &[], session, body).await?;
        Ok(())
    }

    pub async fn health(&self) -> ClientResult<serde_json::Value> {
        self.call(Method::GET, &["health"], None, None).await
    }

    // Auth

    pub async fn login(&self, username: &str, password: &str) -> ClientResult<LoginResponse> {
        let body = serde_json::json!({ "username": username, "password": password });
        self.call(Method::POST, &["api", "auth", "login"], None, Some(body)).await
    }

    pub async fn logout(&self) -> ClientResult<()> {
        self.call_unit(Method::POST, &["api", "auth", "logout"], None, None).await
    }

    pub async fn whoami(&self) -> ClientResult<User> {
        self.call(Method::GET, &["api", "auth", "whoami"], None, None).await
    }

    // Users

    pub async fn list_users(&self) -> ClientResult<Vec<User>> {
        self.call(Method::GET, &["api", "users"], None, None).await
    }

    pub async fn add_user(&self, username: &str, password: &str, role: Role) -> ClientResult<User> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
            "role": role,
        });
        self.call(Method::POST, &["api", "users"], None, Some(body)).await
    }

    pub async fn delete_user(&self, user_id: &str) -> ClientResult<()> {
        self.call_unit(Method::DELETE, &["api", "users", user_id], None, None)
            .await
    }

    pub async fn change_password(&self, current: &str, new: &str) -> ClientResult<()> {
        let body = serde_json::json!({ "currentPassword": current, "newPassword": new });
        self.call_unit(Method::PUT, &["api", "users", "password"], None, Some(body))
            .await
    }

    pub async fn assign_vm(&self, user_id: &str, vm_id: &str) -> ClientResult<()> {
        let path = ["api", "users", user_id, "vms", vm_id];
        self.call_unit(Method::PUT, &path, None, None).await
    }

    pub async fn remove_vm(&self, user_id: &str, vm_id: &str) -> ClientResult<()> {
        let path = ["api", "users", user_id, "vms", vm_id];
        self.call_unit(Method::DELETE, &path, None, None).await
    }
}

/// VM operations over a hypervisor session.
///
/// With connection overrides the session is opened on the first VM call;
/// without them the server's default session is used.
pub struct VmClient {
    api: ApiClient,
    connect: ConnectRequest,
    session_id: Option<String>,
}

impl VmClient {
    pub fn new(api: ApiClient, connect: ConnectRequest) -> Self {
        Self {
            api,
            connect,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Open a hypervisor session with the configured overrides
    pub async fn connect(&mut self) -> ClientResult<String> {
        let body = serde_json::to_value(&self.connect)
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let resp: ConnectResponse = self
            .api
            .call(Method::POST, &["api", "vcenter", "connect"], None, Some(body))
            .await?;
        debug!("Opened hypervisor session {}", resp.session_id);
        self.session_id = Some(resp.session_id.clone());
        Ok(resp.session_id)
    }

    async fn session(&mut self) -> ClientResult<Option<String>> {
        if self.session_id.is_none() && !self.connect.is_empty() {
            self.connect().await?;
        }
        Ok(self.session_id.clone())
    }

    pub async fn list_vms(&mut self) -> ClientResult<Vec<Vm>> {
        let session = self.session().await?;
        self.api
            .call(Method::GET, &["api", "vcenter", "vms"], session.as_deref(), None)
            .await
    }

    /// `None` when the VM does not exist or is not visible
    pub async fn get_vm(&mut self, vm_id: &str) -> ClientResult<Option<Vm>> {
        let session = self.session().await?;
        let path = ["api", "vcenter", "vms", vm_id];
        match self.api.call(Method::GET, &path, session.as_deref(), None).await {
            Ok(vm) => Ok(Some(vm)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn power(&mut self, vm_id: &str, op: PowerOperation) -> ClientResult<()> {
        let session = self.session().await?;
        let op = op.to_string();
        let path = ["api", "vcenter", "vms", vm_id, "power", op.as_str()];
        self.api
            .call_unit(Method::POST, &path, session.as_deref(), None)
            .await
    }

    pub async fn list_snapshots(&mut self, vm_id: &str) -> ClientResult<Vec<Snapshot>> {
        let session = self.session().await?;
        let path = ["api", "vcenter", "vms", vm_id, "snapshots"];
        self.api.call(Method::GET, &path, session.as_deref(), None).await
    }

    pub async fn create_snapshot(
        &mut self,
        vm_id: &str,
        req: &CreateSnapshotRequest,
    ) -> ClientResult<Snapshot> {
        let session = self.session().await?;
        let path = ["api", "vcenter", "vms", vm_id, "snapshots"];
        let body = serde_json::to_value(req).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.api
            .call(Method::POST, &path, session.as_deref(), Some(body))
            .await
    }

    pub async fn metrics(&mut self, vm_id: &str, hours: usize) -> ClientResult<VmMetrics> {
        let session = self.session().await?;
        let path = ["api", "vcenter", "vms", vm_id, "metrics"];
        let query = [("hours", hours.to_string())];
        self.api
            .call_with_query(Method::GET, &path, &query, session.as_deref())
            .await
    }

    pub async fn stats(&mut self) -> ClientResult<StatsSummary> {
        let session = self.session().await?;
        self.api
            .call(Method::GET, &["api", "vcenter", "stats"], session.as_deref(), None)
            .await
    }

    /// Close the hypervisor session. The local session id is dropped even
    /// if the server call fails.
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        let Some(session) = self.session_id.take() else {
            return Ok(());
        };
        debug!("Closing hypervisor session {}", session);
        self.api
            .call_unit(Method::POST, &["api", "vcenter", "disconnect"], Some(&session), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_unwraps_json() {
        assert_eq!(
            error_message(StatusCode::UNAUTHORIZED, r#"{"error": "Invalid credentials"}"#),
            "Invalid credentials"
        );
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, r#"{"message": "Session not found"}"#),
            "Session not found"
        );
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "upstream down"),
            "HTTP 502: upstream down"
        );
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, "  "),
            "HTTP 500: No error details available"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"detail": 1}"#),
            r#"HTTP 400: {"detail": 1}"#
        );
    }

    #[test]
    fn test_connect_request_serializes_only_overrides() {
        let req = ConnectRequest {
            url: Some("https://vc".into()),
            ..Default::default()
        };
        assert!(!req.is_empty());
        assert_eq!(serde_json::to_value(&req).unwrap(), serde_json::json!({"url": "https://vc"}));
        assert!(ConnectRequest::default().is_empty());
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let api = ApiClient::new("http://localhost:3001/");
        let url = api.endpoint(&["api", "users", "a b/c", "vms", "vm-001"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/api/users/a%20b%2Fc/vms/vm-001");

        let api = ApiClient::new("http://proxy.local/captain");
        let url = api.endpoint(&["api", "vcenter", "vms", "vm-../x"]).unwrap();
        assert_eq!(url.path(), "/captain/api/vcenter/vms/vm-..%2Fx");
    }

    #[test]
    fn test_endpoint_rejects_bad_base() {
        let api = ApiClient::new("not a url");
        assert!(matches!(
            api.endpoint(&["health"]).unwrap_err(),
            ClientError::BadUrl { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let mut vms = VmClient::new(ApiClient::new("http://127.0.0.1:1"), ConnectRequest::default());
        assert!(vms.disconnect().await.is_ok());
        assert!(vms.session_id().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_clears_session_on_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut vms = VmClient::new(
            ApiClient::new(&format!("http://{}", addr)),
            ConnectRequest::default(),
        );
        vms.session_id = Some("session-1-1234".into());
        let err = vms.disconnect().await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
        assert!(vms.session_id().is_none());
    }
}
