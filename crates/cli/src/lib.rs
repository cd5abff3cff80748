//! VM Captain CLI
//!
//! Terminal console for the VM Captain API: login, VM power and
//! snapshots, and user management.

pub mod client;
pub mod commands;
pub mod output;
pub mod session;
