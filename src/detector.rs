//! Reconnection detection for provisioned accounts.
//!
//! An account needs the user's attention when its credential expired, the
//! backend marked it for reconnection or a check, it is inactive on a
//! platform that is supposed to stay on, or it has no routing mapping. The
//! last case is how a partially failed finalize surfaces: the scan persists
//! `needs_reconnect` on such accounts so the state survives reloads.
//!
//! A finalize writes the account before its mapping, so an account written
//! within the mapping grace period is not considered unmapped yet, and the
//! mappings are read again right before any status is persisted.
//!
//! All flagged accounts are reported together in one [`ReconnectNotice`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::ConnectBackend;
use crate::errors::ConnectError;
use crate::events::{ConnectEvent, broadcast_event};
use crate::models::{AccountUpdate, Platform, RoutingMapping, VerificationStatus, WebhookAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    TokenExpired,
    NeedsReconnect,
    NeedsCheck,
    Inactive,
    MissingMapping,
}

impl ReconnectReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::TokenExpired => "access token expired",
            Self::NeedsReconnect => "needs to be reconnected",
            Self::NeedsCheck => "connection needs to be checked",
            Self::Inactive => "inactive",
            Self::MissingMapping => "message routing not configured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedAccount {
    pub account_id: i64,
    pub platform: Platform,
    pub display_name: String,
    pub reason: ReconnectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectNotice {
    pub accounts: Vec<FlaggedAccount>,
}

impl ReconnectNotice {
    /// One line for the whole batch.
    pub fn summary(&self) -> String {
        let names: Vec<String> = self
            .accounts
            .iter()
            .map(|a| format!("{} ({}, {})", a.display_name, a.platform, a.reason.describe()))
            .collect();
        match self.accounts.len() {
            1 => format!("1 account needs to be reconnected: {}", names.join(", ")),
            n => format!("{} accounts need to be reconnected: {}", n, names.join(", ")),
        }
    }
}

/// Result of one scan against the backend.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Accounts as they are after any status the scan persisted.
    pub accounts: Vec<WebhookAccount>,
    pub notice: Option<ReconnectNotice>,
}

pub const DEFAULT_MAPPING_GRACE: Duration = Duration::from_secs(60);

pub struct ReconnectionDetector {
    backend: Arc<dyn ConnectBackend>,
    always_on: Vec<Platform>,
    mapping_grace: Duration,
}

impl ReconnectionDetector {
    pub fn new(backend: Arc<dyn ConnectBackend>, always_on: Vec<Platform>) -> Self {
        Self {
            backend,
            always_on,
            mapping_grace: DEFAULT_MAPPING_GRACE,
        }
    }

    pub fn with_mapping_grace(mut self, grace: Duration) -> Self {
        self.mapping_grace = grace;
        self
    }

    /// Written (created or updated) within the grace period. A timestamp in
    /// the future counts as recent.
    fn recently_written(&self, account: &WebhookAccount, now: DateTime<Utc>) -> bool {
        if self.mapping_grace.is_zero() {
            return false;
        }
        let last_write = account.updated_at.unwrap_or(account.created_at);
        (now - last_write)
            .to_std()
            .map_or(true, |age| age < self.mapping_grace)
    }

    fn reason_for(
        &self,
        account: &WebhookAccount,
        mapped: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Option<ReconnectReason> {
        match account.verification_status {
            VerificationStatus::TokenExpired => return Some(ReconnectReason::TokenExpired),
            VerificationStatus::NeedsReconnect => return Some(ReconnectReason::NeedsReconnect),
            VerificationStatus::NeedsCheck => return Some(ReconnectReason::NeedsCheck),
            _ => {}
        }
        if !mapped.contains(&account.id) {
            if !self.recently_written(account, now) {
                return Some(ReconnectReason::MissingMapping);
            }
            tracing::debug!(account_id = account.id, "unmapped account is within the mapping grace period");
        }
        if !account.is_active && self.always_on.contains(&account.platform) {
            return Some(ReconnectReason::Inactive);
        }
        None
    }

    /// Flag accounts without touching the backend.
    pub fn evaluate(
        &self,
        accounts: &[WebhookAccount],
        mappings: &[RoutingMapping],
        now: DateTime<Utc>,
    ) -> Vec<FlaggedAccount> {
        let mapped = mapped_accounts(mappings);
        accounts
            .iter()
            .filter_map(|account| {
                self.reason_for(account, &mapped, now).map(|reason| FlaggedAccount {
                    account_id: account.id,
                    platform: account.platform,
                    display_name: account.display_name.clone(),
                    reason,
                })
            })
            .collect()
    }

    /// Load accounts and mappings, persist `needs_reconnect` on unmapped
    /// accounts, and build the aggregated notice.
    pub async fn scan(&self) -> Result<ScanReport, ConnectError> {
        let mut accounts = self.backend.list_accounts().await?;
        let mappings = self.backend.list_mappings().await?;
        let mut flagged = self.evaluate(&accounts, &mappings, Utc::now());

        // A finalize may have written the mapping since the first read.
        if flagged.iter().any(|f| f.reason == ReconnectReason::MissingMapping) {
            let mapped = mapped_accounts(&self.backend.list_mappings().await?);
            flagged.retain(|f| f.reason != ReconnectReason::MissingMapping || !mapped.contains(&f.account_id));
        }

        for flag in flagged.iter().filter(|f| f.reason == ReconnectReason::MissingMapping) {
            let update = AccountUpdate::status(VerificationStatus::NeedsReconnect);
            match self.backend.update_account(flag.account_id, &update).await {
                Ok(updated) => {
                    tracing::info!(account_id = flag.account_id, "account without routing mapping marked needs_reconnect");
                    if let Some(slot) = accounts.iter_mut().find(|a| a.id == updated.id) {
                        *slot = updated;
                    }
                }
                Err(e) => {
                    tracing::warn!(account_id = flag.account_id, error = %e, "failed to persist needs_reconnect");
                }
            }
        }

        if !flagged.is_empty() {
            tracing::info!(count = flagged.len(), "accounts need reconnection");
        }

        Ok(ScanReport {
            accounts,
            notice: (!flagged.is_empty()).then_some(ReconnectNotice { accounts: flagged }),
        })
    }

    /// Scan on a fixed interval until cancelled, broadcasting each notice.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        events: broadcast::Sender<ConnectEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.scan().await {
                    Ok(ScanReport {
                        notice: Some(notice), ..
                    }) => broadcast_event(&events, ConnectEvent::ReconnectRequired { notice }),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "reconnection scan failed"),
                }
            }
        })
    }
}

fn mapped_accounts(mappings: &[RoutingMapping]) -> HashSet<i64> {
    mappings.iter().map(|m| m.account_id).collect()
}
