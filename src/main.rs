use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use platform_connect::config::ConnectConfig;
use platform_connect::models::Platform;

mod cmd;

#[derive(Parser)]
#[command(name = "platform-connect")]
#[command(version, about = "Connect messaging platforms and provision webhook accounts")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to confirmations and take defaults
    #[arg(long, global = true)]
    pub yes: bool,

    /// Directory holding connect.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Tenant to act for. Overrides connect.toml and CONNECT_TENANT_ID.
    #[arg(long, global = true)]
    pub tenant: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authorize a platform and connect one of its pages or channels
    Connect {
        /// facebook, instagram, whatsapp or telegram
        platform: Platform,

        /// Pick this resource (external id) instead of prompting
        #[arg(long)]
        resource: Option<String>,

        /// Enable AI replies on the new account
        #[arg(long)]
        ai: bool,

        /// Disable automatic replies on the new account
        #[arg(long)]
        no_auto_reply: bool,
    },
    /// Re-authorize an existing account flagged for reconnection
    Repair {
        account_id: i64,

        #[arg(long)]
        resource: Option<String>,
    },
    /// Finish an authorization whose window completed while nothing was listening
    Resume {
        platform: Platform,

        #[arg(long)]
        resource: Option<String>,
    },
    /// List and manage connected accounts
    Accounts {
        #[command(subcommand)]
        command: Option<AccountsCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AccountsCommands {
    /// List accounts and flag those needing reconnection
    List,
    /// Change AI / auto-reply flags
    Set {
        account_id: i64,
        #[arg(long)]
        ai_enabled: Option<bool>,
        #[arg(long)]
        auto_reply: Option<bool>,
    },
    /// Delete an account and its routing mapping
    Delete {
        account_id: i64,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default connect.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config_dir {
        Some(dir) => ConnectConfig::new(dir.clone())?,
        None => ConnectConfig::from_default_dir()?,
    };
    if let Some(tenant) = &cli.tenant {
        config = config.with_tenant(tenant.clone());
    }

    let mut logging = config.toml.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _guard = platform_connect::telemetry::init_tracing(&logging)?;

    match &cli.command {
        Commands::Connect {
            platform,
            resource,
            ai,
            no_auto_reply,
        } => {
            let flags = cmd::connect::flags_from_args(&config, *ai, *no_auto_reply);
            cmd::cmd_connect(&config, &cli, *platform, resource.as_deref(), flags).await?
        }
        Commands::Repair {
            account_id,
            resource,
        } => cmd::cmd_repair(&config, &cli, *account_id, resource.as_deref()).await?,
        Commands::Resume { platform, resource } => {
            cmd::cmd_resume(&config, &cli, *platform, resource.as_deref()).await?
        }
        Commands::Accounts { command } => cmd::cmd_accounts(&config, &cli, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
