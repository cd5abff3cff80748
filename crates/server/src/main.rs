//! VM Captain server daemon

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmcaptain_common::db::DEFAULT_PASSWORD;
use vmcaptain_common::Database;
use vmcaptain_server::{AppState, BackendKind, ServerConfig, WebServer};

#[derive(Parser)]
#[command(name = "vmcaptaind")]
#[command(about = "VM Captain API server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// User store path
    #[arg(long, env = "DB_FILE")]
    db_file: Option<PathBuf>,

    /// Default vCenter URL
    #[arg(long, env = "VCENTER_URL")]
    vcenter_url: Option<String>,

    /// Default vCenter username
    #[arg(long, env = "VCENTER_USERNAME")]
    vcenter_username: Option<String>,

    /// Default vCenter password
    #[arg(long, env = "VCENTER_PASSWORD", hide_env_values = true)]
    vcenter_password: Option<String>,

    /// Skip TLS certificate verification for vCenter
    #[arg(long, env = "VCENTER_IGNORE_SSL")]
    ignore_ssl: Option<bool>,

    /// Hypervisor backend
    #[arg(long, env = "VMCAPTAIN_BACKEND", value_enum)]
    backend: Option<BackendKind>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "VMCAPTAIN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server (default)
    Serve,

    /// Reset the built-in admin and user accounts to the default password
    ResetPasswords,

    /// Write the effective configuration to the config file
    InitConfig,
}

impl Cli {
    /// Config file values, overridden by flags and environment
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let path = self.config.clone().unwrap_or_else(ServerConfig::default_path);
        let mut config = ServerConfig::load(&path)?;

        if self.host.is_some() || self.port.is_some() {
            let current: Option<SocketAddr> = config.listen.parse().ok();
            let host = self
                .host
                .clone()
                .or_else(|| current.map(|a| a.ip().to_string()))
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = self.port.or(current.map(|a| a.port())).unwrap_or(5000);
            config.listen = format!("{}:{}", host, port);
        }
        if let Some(db_file) = &self.db_file {
            config.db_path = db_file.clone();
        }
        if let Some(url) = &self.vcenter_url {
            config.vcenter.url = Some(url.clone());
        }
        if let Some(username) = &self.vcenter_username {
            config.vcenter.username = Some(username.clone());
        }
        if let Some(password) = &self.vcenter_password {
            config.vcenter.password = Some(password.clone());
        }
        if let Some(ignore_ssl) = self.ignore_ssl {
            config.vcenter.ignore_ssl = ignore_ssl;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let config = cli.server_config()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("VM Captain server v{}", vmcaptain_common::VERSION);
            info!(
                "Backend: {}, vCenter: {}",
                config.backend,
                config.vcenter.url.as_deref().unwrap_or("(per request)")
            );
            let addr: SocketAddr = config.listen.parse()?;
            let state = AppState::from_config(config)?;
            WebServer::new(state).serve(addr).await
        }
        Commands::ResetPasswords => {
            let db = Database::open_existing(&config.db_path)?;
            let reset = db.reset_default_passwords()?;
            for (name, found) in [("admin", reset.admin_found), ("user", reset.user_found)] {
                if found {
                    println!("Reset password for '{}' to '{}'", name, DEFAULT_PASSWORD);
                } else {
                    warn!("Account '{}' not found", name);
                }
            }
            Ok(())
        }
        Commands::InitConfig => {
            let path = cli.config.clone().unwrap_or_else(ServerConfig::default_path);
            config.save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}
