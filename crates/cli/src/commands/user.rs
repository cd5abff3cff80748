//! User management commands

use anyhow::{bail, Result};
use clap::Subcommand;

use super::CliContext;
use crate::output::{print_list, print_success, print_warning};
use vmcaptain_common::Role;

#[derive(Subcommand)]
pub enum UserCommands {
    /// List users (admin)
    List,

    /// Add a user (admin)
    Add {
        /// Username
        username: String,

        /// Initial password
        #[arg(short, long)]
        password: String,

        /// Role: admin or user
        #[arg(short, long, default_value = "user")]
        role: Role,
    },

    /// Delete a user (admin)
    Delete {
        /// User ID
        id: String,
    },

    /// Change your own password
    Passwd {
        /// Current password
        #[arg(long)]
        current: String,

        /// New password
        #[arg(long)]
        new: String,
    },

    /// Grant a user access to a VM (admin)
    Grant {
        /// User ID
        user_id: String,
        /// VM ID
        vm_id: String,
    },

    /// Revoke a user's access to a VM (admin)
    Revoke {
        /// User ID
        user_id: String,
        /// VM ID
        vm_id: String,
    },
}

pub async fn execute(cmd: UserCommands, ctx: &mut CliContext) -> Result<()> {
    ctx.session.require_user()?;
    let session = &mut ctx.session;

    match cmd {
        UserCommands::List => {
            if !session.is_admin() {
                print_warning("Only admins can list users");
                return Ok(());
            }
            let users = session.all_users().await?;
            print_list(&users, ctx.format);
        }

        UserCommands::Add {
            username,
            password,
            role,
        } => {
            let user = session.add_user(&username, &password, role).await?;
            print_success(&format!("User '{}' created with id {}", user.username, user.id));
        }

        UserCommands::Delete { id } => {
            if session.current_user().is_some_and(|u| u.id == id) {
                bail!("Cannot delete yourself");
            }
            session.delete_user(&id).await?;
            print_success(&format!("User {} deleted", id));
        }

        UserCommands::Passwd { current, new } => {
            session.change_password(&current, &new).await?;
            print_success("Password updated");
        }

        UserCommands::Grant { user_id, vm_id } => {
            session.assign_vm(&user_id, &vm_id).await?;
            print_success(&format!("Granted {} to {}", vm_id, user_id));
        }

        UserCommands::Revoke { user_id, vm_id } => {
            session.remove_vm(&user_id, &vm_id).await?;
            print_success(&format!("Revoked {} from {}", vm_id, user_id));
        }
    }
    Ok(())
}
