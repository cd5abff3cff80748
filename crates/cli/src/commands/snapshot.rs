//! Snapshot Commands

use anyhow::Result;
use clap::Subcommand;
use tracing::warn;

use super::CliContext;
use crate::output::{flatten_snapshots, print_list, print_success};
use vmcaptain_common::CreateSnapshotRequest;

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Show a VM's snapshot tree
    List {
        /// VM ID
        vm_id: String,
    },

    /// Take a snapshot
    Create {
        /// VM ID to snapshot
        vm_id: String,

        /// Snapshot name
        #[arg(short, long)]
        name: String,

        /// Description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Include guest memory
        #[arg(long)]
        memory: bool,

        /// Quiesce the guest filesystem
        #[arg(long)]
        quiesce: bool,
    },
}

pub async fn execute(cmd: SnapshotCommands, ctx: &mut CliContext) -> Result<()> {
    let mut client = ctx.vm_client()?;
    let result = match cmd {
        SnapshotCommands::List { vm_id } => client
            .list_snapshots(&vm_id)
            .await
            .map(|tree| print_list(&flatten_snapshots(&tree), ctx.format)),

        SnapshotCommands::Create {
            vm_id,
            name,
            description,
            memory,
            quiesce,
        } => {
            let req = CreateSnapshotRequest {
                name,
                description,
                memory,
                quiesce,
            };
            client.create_snapshot(&vm_id, &req).await.map(|snap| {
                print_success(&format!("Snapshot '{}' ({}) created for {}", snap.name, snap.id, vm_id))
            })
        }
    };
    if let Err(e) = client.disconnect().await {
        warn!("Failed to close vCenter session: {}", e);
    }
    Ok(result?)
}
