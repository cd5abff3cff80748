//! VM Captain API server
//!
//! Serves console logins, user management and a hypervisor proxy that
//! filters VMs by the caller's grants.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod server;
pub mod sessions;

pub use config::{BackendKind, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use server::{AppState, WebServer};
