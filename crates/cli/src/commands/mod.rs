//! CLI Commands

pub mod auth;
pub mod snapshot;
pub mod user;
pub mod vm;

use anyhow::{bail, Result};

use crate::client::{ConnectRequest, VmClient};
use crate::output::OutputFormat;
use crate::session::Session;

/// Everything a command needs
pub struct CliContext {
    pub session: Session,
    pub connect: ConnectRequest,
    pub format: OutputFormat,
}

impl CliContext {
    /// VM client for this invocation. Requires a server login.
    pub fn vm_client(&self) -> Result<VmClient> {
        self.session.require_user()?;
        if self.session.is_offline() {
            bail!("Logged in offline; VM operations need the server. Run `vmcaptain login` again.");
        }
        Ok(VmClient::new(self.session.api().clone(), self.connect.clone()))
    }
}
