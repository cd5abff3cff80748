//! VM Captain CLI - Main Entry Point

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vmcaptain_cli::client::ConnectRequest;
use vmcaptain_cli::commands::{auth, snapshot, user, vm, CliContext};
use vmcaptain_cli::output::{self, print_error, print_success};
use vmcaptain_cli::session::{default_session_path, Session};

/// VM Captain - vCenter VM dashboard
#[derive(Parser)]
#[command(name = "vmcaptain")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// API server address
    #[arg(long, env = "VMCAPTAIN_SERVER", default_value = "http://127.0.0.1:5000", global = true)]
    server: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Session file
    #[arg(long, env = "VMCAPTAIN_SESSION_FILE", global = true)]
    session_file: Option<PathBuf>,

    /// vCenter URL for this invocation (defaults to the server's)
    #[arg(long, env = "VCENTER_URL", global = true)]
    vcenter_url: Option<String>,

    /// vCenter username
    #[arg(long, env = "VCENTER_USERNAME", global = true)]
    vcenter_username: Option<String>,

    /// vCenter password
    #[arg(long, env = "VCENTER_PASSWORD", hide_env_values = true, global = true)]
    vcenter_password: Option<String>,

    /// Skip vCenter TLS verification
    #[arg(long, global = true)]
    ignore_ssl: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the server
    Login(auth::LoginArgs),

    /// Log out
    Logout,

    /// Show the logged-in user
    Whoami,

    /// Manage virtual machines
    #[command(subcommand)]
    Vm(vm::VmCommands),

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(snapshot::SnapshotCommands),

    /// Manage users and VM grants
    #[command(subcommand)]
    User(user::UserCommands),

    /// Check server status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let session_path = cli.session_file.clone().unwrap_or_else(default_session_path);
    let mut ctx = CliContext {
        session: Session::open(&cli.server, session_path)?,
        connect: ConnectRequest {
            url: cli.vcenter_url.clone(),
            username: cli.vcenter_username.clone(),
            password: cli.vcenter_password.clone(),
            ignore_ssl: cli.ignore_ssl.then_some(true),
        },
        format: cli.format,
    };

    let result = match cli.command {
        Commands::Login(args) => auth::login(args, &mut ctx).await,
        Commands::Logout => auth::logout(&mut ctx).await,
        Commands::Whoami => auth::whoami(&mut ctx).await,
        Commands::Vm(cmd) => vm::execute(cmd, &mut ctx).await,
        Commands::Snapshot(cmd) => snapshot::execute(cmd, &mut ctx).await,
        Commands::User(cmd) => user::execute(cmd, &mut ctx).await,
        Commands::Status => match ctx.session.api().health().await {
            Ok(health) => {
                print_success(&format!("Server is running at {}", cli.server));
                if let output::OutputFormat::Json = cli.format {
                    println!("{}", serde_json::to_string_pretty(&health)?);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
