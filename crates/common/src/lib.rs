//! VM Captain Common Library
//!
//! Shared records, errors, and the SQLite user store used by the
//! VM Captain server and CLI.

pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// VM Captain version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vmcaptain")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("vm_captain.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
