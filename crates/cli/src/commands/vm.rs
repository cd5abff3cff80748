//! VM Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use tracing::warn;

use super::CliContext;
use crate::client::VmClient;
use crate::output::{metric_rows, print_item, print_list, print_success};
use vmcaptain_common::PowerOperation;

#[derive(Subcommand)]
pub enum VmCommands {
    /// List the VMs you can see
    List,

    /// Get VM details
    Get {
        /// VM ID
        id: String,
    },

    /// Start a VM
    Start {
        /// VM ID
        id: String,
    },

    /// Stop a VM
    Stop {
        /// VM ID
        id: String,
    },

    /// Restart a VM
    Restart {
        /// VM ID
        id: String,
    },

    /// Show CPU and memory history
    Metrics {
        /// VM ID
        id: String,

        /// Hours of history
        #[arg(long, default_value = "24")]
        hours: usize,
    },

    /// Fleet summary
    Stats,
}

pub async fn execute(cmd: VmCommands, ctx: &mut CliContext) -> Result<()> {
    let mut client = ctx.vm_client()?;
    let result = run(cmd, &mut client, ctx).await;
    // Explicit sessions live for one invocation
    if let Err(e) = client.disconnect().await {
        warn!("Failed to close vCenter session: {}", e);
    }
    result
}

async fn run(cmd: VmCommands, client: &mut VmClient, ctx: &CliContext) -> Result<()> {
    match cmd {
        VmCommands::List => {
            let vms = ctx.session.visible_vms(client.list_vms().await?);
            print_list(&vms, ctx.format);
        }

        VmCommands::Get { id } => match client.get_vm(&id).await? {
            Some(vm) => print_item(&vm, ctx.format),
            None => bail!("VM '{}' not found", id),
        },

        VmCommands::Start { id } => power(client, &id, PowerOperation::Start).await?,
        VmCommands::Stop { id } => power(client, &id, PowerOperation::Stop).await?,
        VmCommands::Restart { id } => power(client, &id, PowerOperation::Restart).await?,

        VmCommands::Metrics { id, hours } => {
            let metrics = client.metrics(&id, hours).await?;
            print_list(&metric_rows(&metrics.cpu, &metrics.memory), ctx.format);
        }

        VmCommands::Stats => {
            let stats = client.stats().await?;
            print_item(&stats, ctx.format);
        }
    }
    Ok(())
}

async fn power(client: &mut VmClient, id: &str, op: PowerOperation) -> Result<()> {
    client.power(id, op).await?;
    let verb = match op {
        PowerOperation::Start => "started",
        PowerOperation::Stop => "stopped",
        PowerOperation::Restart => "restarted",
    };
    print_success(&format!("VM '{}' {}", id, verb));
    Ok(())
}
