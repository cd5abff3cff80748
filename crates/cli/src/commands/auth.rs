//! Login commands

use anyhow::Result;
use clap::Args;

use super::CliContext;
use crate::output::{print_item, print_success, print_warning};

#[derive(Args)]
pub struct LoginArgs {
    /// Username
    pub username: String,

    /// Password
    #[arg(short, long, env = "VMCAPTAIN_PASSWORD", hide_env_values = true)]
    pub password: String,
}

pub async fn login(args: LoginArgs, ctx: &mut CliContext) -> Result<()> {
    let user = ctx.session.login(&args.username, &args.password).await?;
    if ctx.session.is_offline() {
        print_warning("Server unreachable; using built-in account without a server session");
    }
    print_success(&format!("Logged in as {} ({})", user.username, user.role));
    Ok(())
}

pub async fn logout(ctx: &mut CliContext) -> Result<()> {
    ctx.session.logout().await?;
    print_success("Logged out");
    Ok(())
}

pub async fn whoami(ctx: &mut CliContext) -> Result<()> {
    match ctx.session.refresh_user().await? {
        Some(user) => {
            let user = user.clone();
            print_item(&user, ctx.format);
        }
        None => print_warning("Not logged in"),
    }
    Ok(())
}
