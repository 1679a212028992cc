//! Configuration view and validation commands (`platform-connect config`).

use anyhow::Result;

use platform_connect::config::{CONFIG_FILE_NAME, ConnectConfig, ConnectToml};

use crate::ConfigCommands;

pub fn cmd_config(config: &ConnectConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Connect Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = &config.toml;
            println!("[backend]");
            println!("  base_url = \"{}\"", toml.backend.base_url);
            if let Some(tenant) = &toml.backend.tenant_id {
                println!("  tenant_id = \"{}\"", tenant);
            }
            println!("  request_timeout_secs = {}", toml.backend.request_timeout_secs);
            println!();

            let o = &toml.orchestrator;
            println!("[orchestrator]");
            println!("  poll_interval_ms = {}", o.poll_interval_ms);
            println!("  session_timeout_secs = {}", o.session_timeout_secs);
            println!("  fallback_read_interval_ms = {}", o.fallback_read_interval_ms);
            println!("  auto_select_delay_ms = {}", o.auto_select_delay_ms);
            println!("  resume_window_secs = {}", o.resume_window_secs);
            println!();

            let a = &toml.accounts;
            let always_on: Vec<&str> = a.always_on_platforms.iter().map(|p| p.as_str()).collect();
            println!("[accounts]");
            println!("  default_ai_enabled = {}", a.default_ai_enabled);
            println!("  default_auto_reply = {}", a.default_auto_reply);
            println!("  always_on_platforms = {:?}", always_on);
            println!("  mapping_grace_secs = {}", a.mapping_grace_secs);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  base_url = \"{}\"", toml.base_url());
            match config.tenant_id() {
                Ok(tenant) => println!("  tenant_id = \"{}\"", tenant),
                Err(_) => println!("  tenant_id = (not set)"),
            }
            println!(
                "  api_token = {}",
                if toml.api_token().is_some() { "(set)" } else { "(not set)" }
            );
            println!("  fallback_dir = \"{}\"", config.fallback_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.config_dir)?;
            ConnectToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [backend] base_url, tenant_id");
            println!("  - [orchestrator] timers and fallback_dir");
            println!("  - [accounts] default flags and always_on_platforms");
            println!();
        }
    }

    Ok(())
}
