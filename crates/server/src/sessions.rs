//! Hypervisor session registry
//!
//! Sessions are keyed by `session-<unix>-<nnnn>` ids handed back to the
//! client on connect. A session expires `ttl` after it was opened; expired
//! sessions are closed the next time they are looked up or swept.
//!
//! Explicit sessions belong to the user who opened them. The default
//! session is shared and reopened when the hypervisor rejects it.

use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConnectParams, VcenterConfig};
use crate::hypervisor::{Hypervisor, HypervisorConnector, VcenterCredentials};
use vmcaptain_common::{Error, Result};

/// A live hypervisor connection
#[derive(Clone)]
pub struct HypervisorSession {
    pub id: String,
    pub backend: Arc<dyn Hypervisor>,
    /// User that opened the session; `None` for the shared default session
    pub owner: Option<String>,
    pub hostname: String,
    pub created_at: Instant,
}

impl HypervisorSession {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    /// Whether `user_id` may use or close this session
    pub fn usable_by(&self, user_id: &str, is_admin: bool) -> bool {
        is_admin || self.owner.as_deref().map_or(true, |owner| owner == user_id)
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, HypervisorSession>,
    connector: Arc<dyn HypervisorConnector>,
    ttl: Duration,
    default_session: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn HypervisorConnector>, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
            ttl,
            default_session: Mutex::new(None),
        }
    }

    /// Open a session for `owner` and return its id
    pub async fn connect(&self, creds: &VcenterCredentials, owner: Option<&str>) -> Result<String> {
        let hostname = creds.hostname()?.to_string();
        let backend = self.connector.connect(creds).await?;
        let id = self.next_id();
        self.sessions.insert(
            id.clone(),
            HypervisorSession {
                id: id.clone(),
                backend,
                owner: owner.map(str::to_string),
                hostname: hostname.clone(),
                created_at: Instant::now(),
            },
        );
        info!("Opened hypervisor session {} to {}", id, hostname);
        Ok(id)
    }

    fn next_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id = format!(
                "session-{}-{}",
                chrono::Utc::now().timestamp(),
                rng.gen_range(1000..=9999)
            );
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Look up a live session, closing it if it has expired
    pub async fn get(&self, id: &str) -> Option<HypervisorSession> {
        let session = self.sessions.get(id).map(|s| s.value().clone())?;
        if session.is_expired(self.ttl) {
            debug!("Hypervisor session {} expired", id);
            self.close(id).await;
            return None;
        }
        Some(session)
    }

    /// Close a session. Returns false if it was unknown.
    pub async fn disconnect(&self, id: &str) -> bool {
        if !self.sessions.contains_key(id) {
            return false;
        }
        self.close(id).await;
        let mut default = self.default_session.lock().await;
        if default.as_deref() == Some(id) {
            *default = None;
        }
        true
    }

    async fn close(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            if let Err(e) = session.backend.disconnect().await {
                warn!("Error closing hypervisor session {}: {}", id, e);
            }
            info!("Closed hypervisor session {} to {}", id, session.hostname);
        }
    }

    /// The server-wide session built from configured credentials, opened
    /// on first use and reopened once it expires.
    pub async fn default_session(&self, config: &VcenterConfig) -> Result<HypervisorSession> {
        let mut default = self.default_session.lock().await;
        if let Some(id) = default.clone() {
            if let Some(session) = self.get(&id).await {
                return Ok(session);
            }
        }

        let creds = config.resolve(&ConnectParams::default())?;
        let id = self.connect(&creds, None).await?;
        *default = Some(id.clone());
        self.sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::Internal("default session vanished".into()))
    }

    /// Run `op` on the default session. If the hypervisor rejects the
    /// session (vCenter drops idle sessions long before our TTL), it is
    /// closed and `op` is retried once on a fresh one.
    pub async fn with_default<T, F, Fut>(&self, config: &VcenterConfig, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Hypervisor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.default_session(config).await?;
        match op(session.backend.clone()).await {
            Err(Error::Unauthorized(reason)) => {
                warn!(
                    "Default hypervisor session {} rejected ({}); reconnecting",
                    session.id, reason
                );
                self.forget_default(&session.id).await;
                let session = self.default_session(config).await?;
                op(session.backend).await
            }
            other => other,
        }
    }

    /// Close the default session if it is still `id`
    async fn forget_default(&self, id: &str) {
        let mut default = self.default_session.lock().await;
        if default.as_deref() == Some(id) {
            *default = None;
            self.close(id).await;
        }
    }

    /// Close every expired session. Returns how many were closed.
    pub async fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(self.ttl))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.close(id).await;
        }
        if !expired.is_empty() {
            info!("Purged {} expired hypervisor sessions", expired.len());
        }
        expired.len()
    }

    /// Close everything
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.close(id).await;
        }
        *self.default_session.lock().await = None;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
