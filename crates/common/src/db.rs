//! SQLite user store for VM Captain
//!
//! Holds console accounts, their VM grants, and login sessions. Passwords are
//! kept as salted SHA-256 digests and never leave this module.

use crate::{Error, NewUser, Result, Role, User};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Password given to the built-in accounts on first boot and on reset.
pub const DEFAULT_PASSWORD: &str = "123456";

/// Accounts seeded into an empty store: (id, username, role).
pub const DEFAULT_USERS: [(&str, &str, Role); 2] = [
    ("admin-1", "admin", Role::Admin),
    ("user-1", "user", Role::User),
];

/// Database wrapper for the user store
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of [`Database::reset_default_passwords`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordReset {
    pub admin_found: bool,
    pub user_found: bool,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;
        db.seed_default_users()?;

        info!("Opened user store at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        db.seed_default_users()?;
        Ok(db)
    }

    /// Open an existing database without creating it. Used by maintenance
    /// commands that must not silently start from an empty store.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            return Err(Error::not_found(
                "database",
                path.as_ref().display().to_string(),
            ));
        }
        Self::open(path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password TEXT NOT NULL,
                role TEXT NOT NULL,
                assigned_vms TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

            CREATE TABLE IF NOT EXISTS auth_sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_expires ON auth_sessions(expires_at);
            "#,
        )?;

        debug!("User store schema initialized");
        Ok(())
    }

    fn seed_default_users(&self) -> Result<()> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        for (id, username, role) in DEFAULT_USERS {
            conn.execute(
                "INSERT INTO users (id, username, password, role, assigned_vms, created_at)
                 VALUES (?1, ?2, ?3, ?4, '[]', ?5)",
                params![id, username, hash_password(DEFAULT_PASSWORD), role.as_str(), now],
            )?;
        }
        info!("Seeded default users");
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Find a user by username and password
    pub fn user_by_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, role, assigned_vms, password FROM users WHERE username = ?1",
                params![username],
                |row| Ok((RawUser::from_row(row)?, row.get::<_, String>(4)?)),
            )
            .optional()?;

        match row {
            Some((raw, stored)) if verify_password(&stored, password) => Ok(Some(raw.parse()?)),
            _ => Ok(None),
        }
    }

    /// Find a user by ID
    pub fn user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, role, assigned_vms FROM users WHERE id = ?1",
                params![id],
                RawUser::from_row,
            )
            .optional()?;

        row.map(RawUser::parse).transpose()
    }

    /// List all users, oldest first
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, role, assigned_vms FROM users ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], RawUser::from_row)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?.parse()?);
        }
        Ok(users)
    }

    /// Add a new user. Usernames are unique.
    pub fn add_user(&self, new_user: &NewUser) -> Result<User> {
        let username = new_user.username.trim();
        if username.is_empty() || new_user.password.is_empty() {
            return Err(Error::InvalidConfig(
                "Username, password, and role are required".to_string(),
            ));
        }

        let conn = self.conn.lock();
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Error::already_exists("user", username));
        }

        let now = chrono::Utc::now().timestamp();
        let mut id = format!("user-{}", now);
        let mut suffix = 1;
        while conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some()
        {
            id = format!("user-{}-{}", now, suffix);
            suffix += 1;
        }

        conn.execute(
            "INSERT INTO users (id, username, password, role, assigned_vms, created_at)
             VALUES (?1, ?2, ?3, ?4, '[]', ?5)",
            params![
                id,
                username,
                hash_password(&new_user.password),
                new_user.role.as_str(),
                now
            ],
        )?;

        info!("Added user {} ({}) as {}", username, id, new_user.role);
        Ok(User {
            id,
            username: username.to_string(),
            role: new_user.role,
            assigned_vms: Vec::new(),
        })
    }

    /// Delete a user and their sessions
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM auth_sessions WHERE user_id = ?1", params![id])?;
        let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if rows > 0 {
            info!("Deleted user {}", id);
        }
        Ok(rows > 0)
    }

    /// Check a password without loading the user
    pub fn verify_user_password(&self, id: &str, password: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let stored: Option<String> = conn
            .query_row(
                "SELECT password FROM users WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.map(|s| verify_password(&s, password)).unwrap_or(false))
    }

    /// Update a user's password
    pub fn update_password(&self, id: &str, new_password: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET password = ?1 WHERE id = ?2",
            params![hash_password(new_password), id],
        )?;
        Ok(rows > 0)
    }

    /// Grant a VM to a user. Granting twice is a no-op.
    pub fn assign_vm(&self, user_id: &str, vm_id: &str) -> Result<bool> {
        self.update_grants(user_id, |vms| {
            if !vms.iter().any(|v| v == vm_id) {
                vms.push(vm_id.to_string());
            }
        })
    }

    /// Revoke a VM grant. Revoking an absent grant still succeeds.
    pub fn remove_vm(&self, user_id: &str, vm_id: &str) -> Result<bool> {
        self.update_grants(user_id, |vms| vms.retain(|v| v != vm_id))
    }

    fn update_grants(&self, user_id: &str, f: impl FnOnce(&mut Vec<String>)) -> Result<bool> {
        let conn = self.conn.lock();
        let stored: Option<String> = conn
            .query_row(
                "SELECT assigned_vms FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(stored) = stored else {
            return Ok(false);
        };

        let mut vms: Vec<String> = serde_json::from_str(&stored)?;
        let before = vms.clone();
        f(&mut vms);
        if vms != before {
            conn.execute(
                "UPDATE users SET assigned_vms = ?1 WHERE id = ?2",
                params![serde_json::to_string(&vms)?, user_id],
            )?;
            debug!("Updated VM grants for {}: {:?}", user_id, vms);
        }
        Ok(true)
    }

    /// Reset the built-in accounts to the default password
    pub fn reset_default_passwords(&self) -> Result<PasswordReset> {
        let conn = self.conn.lock();
        let digest = hash_password(DEFAULT_PASSWORD);
        let admin = conn.execute(
            "UPDATE users SET password = ?1 WHERE username = 'admin'",
            params![digest],
        )?;
        let user = conn.execute(
            "UPDATE users SET password = ?1 WHERE username = 'user'",
            params![digest],
        )?;
        Ok(PasswordReset {
            admin_found: admin > 0,
            user_found: user > 0,
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a login session, returning `(token, expires_at)`
    pub fn create_session(&self, user_id: &str, ttl_secs: i64) -> Result<(String, i64)> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let token = hex::encode(rand::random::<[u8; 32]>());
        let expires_at = now + ttl_secs;
        conn.execute(
            "INSERT INTO auth_sessions (token, user_id, created_at, expires_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, user_id, now, expires_at, now],
        )?;
        Ok((token, expires_at))
    }

    /// Resolve a session token to its user. Expired sessions are removed.
    pub fn session_user(&self, token: &str) -> Result<Option<User>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT u.id, u.username, u.role, u.assigned_vms, s.expires_at
                 FROM auth_sessions s JOIN users u ON u.id = s.user_id WHERE s.token = ?1",
                params![token],
                |row| Ok((RawUser::from_row(row)?, row.get::<_, i64>(4)?)),
            )
            .optional()?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at <= now {
            conn.execute("DELETE FROM auth_sessions WHERE token = ?1", params![token])?;
            debug!("Session for {} expired", raw.id);
            return Ok(None);
        }

        conn.execute(
            "UPDATE auth_sessions SET last_seen_at = ?1 WHERE token = ?2",
            params![now, token],
        )?;
        Ok(Some(raw.parse()?))
    }

    /// Delete a session
    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM auth_sessions WHERE token = ?1", params![token])?;
        Ok(rows > 0)
    }

    /// Drop every expired session, returning how many were removed
    pub fn purge_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let rows = conn.execute(
            "DELETE FROM auth_sessions WHERE expires_at <= ?1",
            params![now],
        )?;
        if rows > 0 {
            debug!("Purged {} expired sessions", rows);
        }
        Ok(rows)
    }
}

/// Raw user row before parsing
struct RawUser {
    id: String,
    username: String,
    role: String,
    assigned_vms: String,
}

impl RawUser {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawUser {
            id: row.get(0)?,
            username: row.get(1)?,
            role: row.get(2)?,
            assigned_vms: row.get(3)?,
        })
    }

    fn parse(self) -> Result<User> {
        let role = self.role.parse::<Role>().unwrap_or_else(|_| {
            warn!("User {} has unknown role {:?}; treating as USER", self.id, self.role);
            Role::User
        });
        Ok(User {
            id: self.id,
            username: self.username,
            role,
            assigned_vms: serde_json::from_str(&self.assigned_vms)?,
        })
    }
}

fn hash_password(password: &str) -> String {
    let salt = hex::encode(rand::random::<[u8; 16]>());
    format!("{}${}", salt, digest(&salt, password))
}

fn verify_password(stored: &str, password: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, expected)) => constant_time_eq(&digest(salt, password), expected),
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, role: Role) -> NewUser {
        NewUser {
            username: username.to_string(),
            password: "hunter2".to_string(),
            role,
        }
    }

    #[test]
    fn test_seeds_default_users() {
        let db = Database::open_memory().unwrap();
        let users = db.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "admin");
        assert_eq!(users[0].role, Role::Admin);
        assert_eq!(users[1].id, "user-1");

        let admin = db.user_by_credentials("admin", DEFAULT_PASSWORD).unwrap();
        assert_eq!(admin.map(|u| u.id), Some("admin-1".to_string()));
        assert!(db.user_by_credentials("admin", "wrong").unwrap().is_none());
        assert!(db.user_by_credentials("ghost", DEFAULT_PASSWORD).unwrap().is_none());
    }

    #[test]
    fn test_reopen_does_not_reseed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("vmcaptain.db");
        {
            let db = Database::open(&path).unwrap();
            db.delete_user("user-1").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_open_existing_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Database::open_existing(dir.path().join("missing.db"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_user_crud() {
        let db = Database::open_memory().unwrap();

        let alice = db.add_user(&new_user("alice", Role::User)).unwrap();
        assert!(alice.id.starts_with("user-"));
        assert!(alice.assigned_vms.is_empty());

        let dup = db.add_user(&new_user("alice", Role::Admin));
        assert!(matches!(dup, Err(Error::AlreadyExists { .. })));

        // Same second: ids must still differ
        let bob = db.add_user(&new_user("bob", Role::User)).unwrap();
        assert_ne!(alice.id, bob.id);

        assert_eq!(db.user_by_id(&alice.id).unwrap().unwrap().username, "alice");
        assert!(db.delete_user(&alice.id).unwrap());
        assert!(!db.delete_user(&alice.id).unwrap());
        assert!(db.user_by_id(&alice.id).unwrap().is_none());
    }

    #[test]
    fn test_add_user_requires_fields() {
        let db = Database::open_memory().unwrap();
        let blank = NewUser {
            username: "  ".into(),
            password: "x".into(),
            role: Role::User,
        };
        assert!(matches!(db.add_user(&blank), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_password_change() {
        let db = Database::open_memory().unwrap();
        assert!(db.verify_user_password("user-1", DEFAULT_PASSWORD).unwrap());
        assert!(db.update_password("user-1", "s3cret").unwrap());
        assert!(!db.verify_user_password("user-1", DEFAULT_PASSWORD).unwrap());
        assert!(db.user_by_credentials("user", "s3cret").unwrap().is_some());
        assert!(!db.update_password("nobody", "x").unwrap());

        let reset = db.reset_default_passwords().unwrap();
        assert_eq!(reset, PasswordReset { admin_found: true, user_found: true });
        assert!(db.user_by_credentials("user", DEFAULT_PASSWORD).unwrap().is_some());
    }

    #[test]
    fn test_vm_grants() {
        let db = Database::open_memory().unwrap();
        assert!(db.assign_vm("user-1", "vm-001").unwrap());
        assert!(db.assign_vm("user-1", "vm-001").unwrap());
        assert!(db.assign_vm("user-1", "vm-002").unwrap());
        let user = db.user_by_id("user-1").unwrap().unwrap();
        assert_eq!(user.assigned_vms, vec!["vm-001", "vm-002"]);

        assert!(db.remove_vm("user-1", "vm-001").unwrap());
        assert!(db.remove_vm("user-1", "vm-404").unwrap());
        let user = db.user_by_id("user-1").unwrap().unwrap();
        assert_eq!(user.assigned_vms, vec!["vm-002"]);

        assert!(!db.assign_vm("nobody", "vm-001").unwrap());
        assert!(!db.remove_vm("nobody", "vm-001").unwrap());
    }

    #[test]
    fn test_sessions() {
        let db = Database::open_memory().unwrap();
        let (token, expires_at) = db.create_session("admin-1", 3600).unwrap();
        assert_eq!(token.len(), 64);
        assert!(expires_at > chrono::Utc::now().timestamp());

        let user = db.session_user(&token).unwrap().unwrap();
        assert_eq!(user.username, "admin");

        assert!(db.delete_session(&token).unwrap());
        assert!(db.session_user(&token).unwrap().is_none());
    }

    #[test]
    fn test_expired_sessions_are_dropped() {
        let db = Database::open_memory().unwrap();
        let (stale, _) = db.create_session("user-1", -1).unwrap();
        let (fresh, _) = db.create_session("user-1", 3600).unwrap();
        let (other_stale, _) = db.create_session("admin-1", 0).unwrap();

        assert!(db.session_user(&stale).unwrap().is_none());
        assert_eq!(db.purge_expired_sessions().unwrap(), 1);
        assert!(db.session_user(&other_stale).unwrap().is_none());
        assert!(db.session_user(&fresh).unwrap().is_some());
    }

    #[test]
    fn test_deleting_user_ends_sessions() {
        let db = Database::open_memory().unwrap();
        let (token, _) = db.create_session("user-1", 3600).unwrap();
        db.delete_user("user-1").unwrap();
        assert!(db.session_user(&token).unwrap().is_none());
    }

    #[test]
    fn test_password_digest_is_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password(&a, "same"));
        assert!(!verify_password(&a, "other"));
        assert!(!verify_password("no-separator", "same"));
    }
}
