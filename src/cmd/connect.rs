//! Interactive connection flow (`platform-connect connect|repair|resume`).

use anyhow::{Context, Result, bail};
use console::style;
use tokio::sync::broadcast::error::RecvError;

use platform_connect::Coordinator;
use platform_connect::config::ConnectConfig;
use platform_connect::events::ConnectEvent;
use platform_connect::models::{AccountFlags, ConnectableResource, Platform};
use platform_connect::session::{SessionSnapshot, SessionState};

use crate::Cli;

/// Explicit flags only when the user passed one; otherwise the configured defaults apply.
pub fn flags_from_args(config: &ConnectConfig, ai: bool, no_auto_reply: bool) -> Option<AccountFlags> {
    if !ai && !no_auto_reply {
        return None;
    }
    let defaults = config.orchestrator_settings().default_flags;
    Some(AccountFlags {
        ai_enabled: ai || defaults.ai_enabled,
        auto_reply: !no_auto_reply && defaults.auto_reply,
    })
}

pub async fn cmd_connect(
    config: &ConnectConfig,
    cli: &Cli,
    platform: Platform,
    resource: Option<&str>,
    flags: Option<AccountFlags>,
) -> Result<()> {
    let coordinator = Coordinator::from_config(config)?;
    println!("Connecting {}...", style(platform).cyan());
    let events = coordinator.subscribe_events();
    // A resumed session has no authorization link of its own.
    let snapshot = coordinator.resume_or_start(platform).await?;
    if snapshot.authorization_url.is_none() {
        println!("Resumed an earlier authorization.");
    }
    complete(&coordinator, events, cli, resource, flags).await
}

pub async fn cmd_repair(config: &ConnectConfig, cli: &Cli, account_id: i64, resource: Option<&str>) -> Result<()> {
    let coordinator = Coordinator::from_config(config)?;
    println!("Reconnecting account {}...", style(account_id).cyan());
    let events = coordinator.subscribe_events();
    coordinator.start_repair(account_id).await?;
    complete(&coordinator, events, cli, resource, None).await
}

pub async fn cmd_resume(config: &ConnectConfig, cli: &Cli, platform: Platform, resource: Option<&str>) -> Result<()> {
    let coordinator = Coordinator::from_config(config)?;
    let events = coordinator.subscribe_events();
    if coordinator.resume_abandoned(platform).await.is_none() {
        println!("Nothing to resume.");
        return Ok(());
    }
    println!("Resumed an earlier authorization.");
    complete(&coordinator, events, cli, resource, None).await
}

/// Wait for resources, pick one, and finalize.
async fn complete(
    coordinator: &Coordinator,
    mut events: tokio::sync::broadcast::Receiver<ConnectEvent>,
    cli: &Cli,
    resource: Option<&str>,
    flags: Option<AccountFlags>,
) -> Result<()> {
    let mut state = coordinator.subscribe_state();

    loop {
        let snapshot = state.borrow_and_update().clone();
        match snapshot.state {
            SessionState::Configuring => break,
            SessionState::PagesReady if snapshot.selected_resource.is_none() => {
                if let Some(choice) = choose(&snapshot, resource, cli.yes).await? {
                    coordinator.select_resource(&choice).await?;
                    continue;
                }
            }
            SessionState::Failed => {
                bail!(
                    "{}",
                    snapshot
                        .last_error
                        .unwrap_or_else(|| "Authorization failed".to_string())
                );
            }
            SessionState::Idle => bail!("The session ended before an account was connected"),
            _ => {}
        }

        tokio::select! {
            changed = state.changed() => changed.context("Coordinator stopped")?,
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Coordinator stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                coordinator.cancel().await;
                bail!("Cancelled");
            }
        }
    }

    match coordinator.finalize(flags).await {
        Ok(account) => {
            println!(
                "{} Connected {} ({}) as account {}",
                style("✓").green(),
                style(&account.display_name).bold(),
                account.platform,
                account.id
            );
            Ok(())
        }
        Err(e) if e.is_partial_success() => {
            println!("{} Account connected. {}", style("!").yellow(), style(e).dim());
            println!("Message routing will be flagged for reconnection on the next account listing.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn report(event: &ConnectEvent) {
    match event {
        ConnectEvent::AuthorizationStarted {
            authorization_url, ..
        } => {
            println!("Complete authorization in your browser:");
            println!("  {}", style(authorization_url).underlined());
        }
        ConnectEvent::PopupBlocked {
            authorization_url, ..
        } => {
            println!(
                "{} Could not open a browser. Open this link to continue:",
                style("!").yellow()
            );
            println!("  {}", authorization_url);
        }
        ConnectEvent::ResourcesReady { count, .. } => {
            println!("Authorization complete, {} resource(s) available.", count);
        }
        ConnectEvent::ResourceSelected {
            external_id,
            automatic: true,
            ..
        } => {
            println!("Selected the only available resource ({}).", external_id);
        }
        _ => {}
    }
}

/// `None` while waiting on auto-selection of a single resource.
async fn choose(snapshot: &SessionSnapshot, requested: Option<&str>, yes: bool) -> Result<Option<String>> {
    if let Some(id) = requested {
        return Ok(Some(id.to_string()));
    }
    if snapshot.resources.len() <= 1 {
        return Ok(None);
    }
    if yes {
        bail!("Several resources are available; pass --resource <id> to pick one");
    }

    let resources = snapshot.resources.clone();
    let picked = tokio::task::spawn_blocking(move || prompt(&resources))
        .await
        .context("Prompt task failed")??;
    Ok(Some(picked))
}

fn prompt(resources: &[ConnectableResource]) -> Result<String> {
    use dialoguer::Select;

    let labels: Vec<String> = resources
        .iter()
        .map(|r| format!("{} ({})", r.display_name, r.external_id))
        .collect();
    let index = Select::new()
        .with_prompt("Which one should be connected?")
        .items(&labels)
        .interact()
        .context("No resource selected")?;
    Ok(resources[index].external_id.clone())
}
