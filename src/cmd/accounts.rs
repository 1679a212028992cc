//! Account listing and management (`platform-connect accounts`).

use std::sync::Arc;

use anyhow::Result;
use console::style;

use platform_connect::accounts::AccountManager;
use platform_connect::backend::{ConnectBackend, HttpBackend};
use platform_connect::config::ConnectConfig;
use platform_connect::detector::ReconnectionDetector;
use platform_connect::events::EVENT_BUFFER;
use platform_connect::models::AccountUpdate;

use crate::{AccountsCommands, Cli};

fn manager(config: &ConnectConfig) -> Result<AccountManager> {
    let backend: Arc<dyn ConnectBackend> = Arc::new(HttpBackend::from_config(config)?);
    let detector = Arc::new(
        ReconnectionDetector::new(backend.clone(), config.always_on_platforms().to_vec())
            .with_mapping_grace(config.mapping_grace()),
    );
    let (events, _) = tokio::sync::broadcast::channel(EVENT_BUFFER);
    Ok(AccountManager::new(backend, detector, events))
}

pub async fn cmd_accounts(config: &ConnectConfig, cli: &Cli, command: Option<AccountsCommands>) -> Result<()> {
    let manager = manager(config)?;

    match command {
        None | Some(AccountsCommands::List) => {
            let listing = manager.load().await?;
            if listing.accounts.is_empty() {
                println!("No connected accounts.");
                return Ok(());
            }

            println!();
            for account in &listing.accounts {
                let status = if account.verification_status.requires_reconnect() {
                    style(account.verification_status.as_str()).red()
                } else {
                    style(account.verification_status.as_str()).green()
                };
                println!(
                    "  {:>5}  {:<10} {:<32} {:<16} ai={} auto_reply={}{}",
                    account.id,
                    account.platform,
                    account.display_name,
                    status,
                    account.ai_enabled,
                    account.auto_reply,
                    if account.is_active { "" } else { "  (inactive)" }
                );
            }
            println!();

            if let Some(notice) = listing.notice {
                println!("{} {}", style("!").yellow(), notice.summary());
                println!("Run 'platform-connect repair <account-id>' to reconnect.");
                println!();
            }
        }
        Some(AccountsCommands::Set {
            account_id,
            ai_enabled,
            auto_reply,
        }) => {
            if ai_enabled.is_none() && auto_reply.is_none() {
                println!("Nothing to change. Pass --ai-enabled and/or --auto-reply.");
                return Ok(());
            }
            let account = match (ai_enabled, auto_reply) {
                (Some(ai), None) => manager.set_ai_enabled(account_id, ai).await?,
                (None, Some(reply)) => manager.set_auto_reply(account_id, reply).await?,
                (ai, reply) => {
                    let update = AccountUpdate {
                        ai_enabled: ai,
                        auto_reply: reply,
                        ..AccountUpdate::default()
                    };
                    manager.update(account_id, update).await?
                }
            };
            println!(
                "Account {}: ai={} auto_reply={}",
                account.id, account.ai_enabled, account.auto_reply
            );
        }
        Some(AccountsCommands::Delete { account_id, force }) => {
            use dialoguer::Confirm;

            if !force && !cli.yes {
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete account {} and its message routing?", account_id))
                    .default(false)
                    .interact()
                    .unwrap_or(false);

                if !confirm {
                    println!("Delete cancelled");
                    return Ok(());
                }
            }

            manager.delete(account_id).await?;
            println!("Account {} deleted", account_id);
        }
    }

    Ok(())
}
