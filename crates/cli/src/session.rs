//! Console login state
//!
//! Keeps the logged-in user and token in `~/.vmcaptain/session.json` so
//! consecutive CLI invocations share one login. When the server cannot be
//! reached, login falls back to the built-in accounts by username only.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::client::{ApiClient, ClientError};
use vmcaptain_common::db::DEFAULT_USERS;
use vmcaptain_common::{Role, User, Vm};

/// What survives between invocations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub server: Option<String>,
    pub token: Option<String>,
    pub user: Option<User>,
    /// Last user list fetched by an admin
    #[serde(default)]
    pub users: Vec<User>,
}

impl SessionState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        write_private(path, content.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Write a file readable only by its owner; it holds the bearer token.
#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::fs::{OpenOptions, Permissions};
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

/// Default session file
pub fn default_session_path() -> PathBuf {
    vmcaptain_common::default_store_path().join("session.json")
}

/// Built-in account for offline login
fn builtin_user(username: &str) -> Option<User> {
    DEFAULT_USERS
        .iter()
        .find(|(_, name, _)| *name == username)
        .map(|(id, name, role)| User {
            id: id.to_string(),
            username: name.to_string(),
            role: *role,
            assigned_vms: Vec::new(),
        })
}

/// Login state plus the user-management calls that depend on it
pub struct Session {
    api: ApiClient,
    path: PathBuf,
    state: SessionState,
    users_cache: Option<Vec<User>>,
}

impl Session {
    /// Load persisted state for `server`. A login made against a different
    /// server is discarded.
    pub fn open(server: &str, path: PathBuf) -> Result<Self> {
        let mut state = SessionState::load(&path)?;
        let server = server.trim_end_matches('/').to_string();
        if state.server.as_deref().is_some_and(|s| s != server) {
            debug!("Discarding login for {:?}", state.server);
            state = SessionState::default();
        }
        state.server = Some(server.clone());

        let api = ApiClient::new(&server).with_token(state.token.clone());
        Ok(Self {
            api,
            path,
            state,
            users_cache: None,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn persist(&self) -> Result<()> {
        self.state.save(&self.path)
    }

    fn invalidate_users(&mut self) {
        self.users_cache = None;
    }

    pub fn current_user(&self) -> Option<&User> {
        self.state.user.as_ref()
    }

    pub fn is_admin(&self) -> bool {
        self.current_user().is_some_and(User::is_admin)
    }

    /// True when logged in without a server token
    pub fn is_offline(&self) -> bool {
        self.state.user.is_some() && self.state.token.is_none()
    }

    pub fn require_user(&self) -> Result<&User> {
        self.current_user()
            .ok_or_else(|| anyhow!("Not logged in. Run `vmcaptain login` first."))
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<User> {
        let user = match self.api.login(username, password).await {
            Ok(resp) => {
                self.state.token = Some(resp.token.clone());
                self.api.set_token(Some(resp.token));
                resp.user
            }
            Err(ClientError::Unreachable { url, .. }) => {
                let user = builtin_user(username)
                    .ok_or_else(|| anyhow!("Server at {} is unreachable", url))?;
                warn!(
                    "Server at {} is unreachable; logged in as built-in user '{}' without a token",
                    url, username
                );
                self.state.token = None;
                self.api.set_token(None);
                user
            }
            Err(e) => return Err(e.into()),
        };

        self.state.user = Some(user.clone());
        self.invalidate_users();
        self.persist()?;
        Ok(user)
    }

    pub async fn logout(&mut self) -> Result<()> {
        if self.api.token().is_some() {
            if let Err(e) = self.api.logout().await {
                warn!("Server logout failed: {}", e);
            }
        }
        self.state.token = None;
        self.state.user = None;
        self.state.users.clear();
        self.api.set_token(None);
        self.invalidate_users();
        self.persist()
    }

    /// Every user, for admins. Other callers get an empty list.
    pub async fn all_users(&mut self) -> Result<Vec<User>> {
        if !self.is_admin() {
            return Ok(Vec::new());
        }
        if let Some(users) = &self.users_cache {
            return Ok(users.clone());
        }

        let users = match self.api.list_users().await {
            Ok(users) => users,
            Err(ClientError::Unreachable { url, .. }) => {
                warn!("Server at {} is unreachable; showing last known users", url);
                return Ok(self.state.users.clone());
            }
            Err(e) => return Err(e.into()),
        };

        self.state.users = users.clone();
        self.persist()?;
        self.users_cache = Some(users.clone());
        Ok(users)
    }

    pub async fn add_user(&mut self, username: &str, password: &str, role: Role) -> Result<User> {
        let result = self.api.add_user(username, password, role).await;
        self.invalidate_users();
        Ok(result?)
    }

    pub async fn delete_user(&mut self, user_id: &str) -> Result<()> {
        let result = self.api.delete_user(user_id).await;
        self.invalidate_users();
        Ok(result?)
    }

    pub async fn change_password(&mut self, current: &str, new: &str) -> Result<()> {
        let result = self.api.change_password(current, new).await;
        self.invalidate_users();
        Ok(result?)
    }

    pub async fn assign_vm(&mut self, user_id: &str, vm_id: &str) -> Result<()> {
        let result = self.api.assign_vm(user_id, vm_id).await;
        self.invalidate_users();
        Ok(result?)
    }

    pub async fn remove_vm(&mut self, user_id: &str, vm_id: &str) -> Result<()> {
        let result = self.api.remove_vm(user_id, vm_id).await;
        self.invalidate_users();
        Ok(result?)
    }

    /// Refresh the stored user from the server so grants are current
    pub async fn refresh_user(&mut self) -> Result<Option<&User>> {
        if self.api.token().is_some() {
            match self.api.whoami().await {
                Ok(user) => {
                    self.state.user = Some(user);
                    self.persist()?;
                }
                Err(ClientError::Api { status: 401, .. }) => {
                    warn!("Login expired");
                    self.state.user = None;
                    self.state.token = None;
                    self.api.set_token(None);
                    self.persist()?;
                }
                Err(e) => debug!("Could not refresh user: {}", e),
            }
        }
        Ok(self.current_user())
    }

    /// The subset of `vms` the current user may see
    pub fn visible_vms(&self, vms: Vec<Vm>) -> Vec<Vm> {
        match self.current_user() {
            Some(user) => vms.into_iter().filter(|vm| user.can_access(&vm.id)).collect(),
            None => Vec::new(),
        }
    }
}
