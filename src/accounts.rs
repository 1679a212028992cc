//! Provisioned account management: listing, flag toggles, removal.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::backend::ConnectBackend;
use crate::detector::{ReconnectNotice, ReconnectionDetector};
use crate::errors::{BackendError, ConnectError};
use crate::events::{ConnectEvent, broadcast_event};
use crate::models::{AccountFlags, AccountUpdate, WebhookAccount};

#[derive(Debug, Clone)]
pub struct AccountListing {
    pub accounts: Vec<WebhookAccount>,
    pub notice: Option<ReconnectNotice>,
}

pub struct AccountManager {
    backend: Arc<dyn ConnectBackend>,
    detector: Arc<ReconnectionDetector>,
    events: broadcast::Sender<ConnectEvent>,
}

impl AccountManager {
    pub fn new(
        backend: Arc<dyn ConnectBackend>,
        detector: Arc<ReconnectionDetector>,
        events: broadcast::Sender<ConnectEvent>,
    ) -> Self {
        Self {
            backend,
            detector,
            events,
        }
    }

    /// List accounts. Every load runs a reconnection scan.
    pub async fn load(&self) -> Result<AccountListing, ConnectError> {
        let report = self.detector.scan().await?;
        if let Some(notice) = &report.notice {
            broadcast_event(
                &self.events,
                ConnectEvent::ReconnectRequired {
                    notice: notice.clone(),
                },
            );
        }
        Ok(AccountListing {
            accounts: report.accounts,
            notice: report.notice,
        })
    }

    pub async fn set_flags(&self, account_id: i64, flags: AccountFlags) -> Result<WebhookAccount, ConnectError> {
        self.update(account_id, AccountUpdate::flags(flags)).await
    }

    pub async fn set_ai_enabled(&self, account_id: i64, enabled: bool) -> Result<WebhookAccount, ConnectError> {
        let update = AccountUpdate {
            ai_enabled: Some(enabled),
            ..AccountUpdate::default()
        };
        self.update(account_id, update).await
    }

    pub async fn set_auto_reply(&self, account_id: i64, enabled: bool) -> Result<WebhookAccount, ConnectError> {
        let update = AccountUpdate {
            auto_reply: Some(enabled),
            ..AccountUpdate::default()
        };
        self.update(account_id, update).await
    }

    pub async fn update(&self, account_id: i64, update: AccountUpdate) -> Result<WebhookAccount, ConnectError> {
        let account = self
            .backend
            .update_account(account_id, &update)
            .await
            .map_err(|e| not_found_as_account(account_id, e))?;
        tracing::info!(account_id, ai_enabled = account.ai_enabled, auto_reply = account.auto_reply, "account updated");
        broadcast_event(
            &self.events,
            ConnectEvent::AccountUpdated {
                account: account.clone(),
            },
        );
        Ok(account)
    }

    /// Remove an account's mappings, then the account itself.
    pub async fn delete(&self, account_id: i64) -> Result<(), ConnectError> {
        let mappings = self.backend.list_mappings().await?;
        for mapping in mappings.iter().filter(|m| m.account_id == account_id) {
            match self.backend.delete_mapping(mapping.id).await {
                Ok(()) | Err(BackendError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.backend
            .delete_account(account_id)
            .await
            .map_err(|e| not_found_as_account(account_id, e))?;
        tracing::info!(account_id, "account deleted");
        broadcast_event(&self.events, ConnectEvent::AccountDeleted { account_id });
        Ok(())
    }
}

fn not_found_as_account(account_id: i64, e: BackendError) -> ConnectError {
    match e {
        BackendError::NotFound => ConnectError::AccountNotFound { id: account_id },
        other => other.into(),
    }
}
