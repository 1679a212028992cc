//! Account finalization: the two dependent writes that provision a connection.
//!
//! Create mode writes a new webhook account and then a routing mapping that
//! references it. There is no transaction across the two calls: when the
//! mapping write fails the account row stays behind and the error says so
//! (`is_partial_success()`). The reconnection detector picks it up later.
//!
//! Repair mode updates an existing account in place and then updates its
//! mapping, creating one if it is missing. It never inserts a second account.

use std::sync::Arc;

use crate::backend::ConnectBackend;
use crate::errors::{BackendError, ConnectError, FinalizeStage};
use crate::models::{
    AccountFlags, AccountUpdate, ConnectableResource, MappingUpdate, NewRoutingMapping,
    NewWebhookAccount, Platform, RoutingMapping, VerificationStatus, WebhookAccount,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTarget {
    Create,
    Repair { account_id: i64 },
}

#[derive(Debug, Clone)]
pub struct FinalizeRequest<'a> {
    pub platform: Platform,
    pub resource: &'a ConnectableResource,
    /// `None` keeps existing flags on repair and applies defaults on create.
    pub flags: Option<AccountFlags>,
    pub target: FinalizeTarget,
}

#[derive(Clone)]
pub struct AccountFinalizer {
    backend: Arc<dyn ConnectBackend>,
    tenant_id: String,
    default_flags: AccountFlags,
}

impl AccountFinalizer {
    pub fn new(backend: Arc<dyn ConnectBackend>, tenant_id: impl Into<String>, default_flags: AccountFlags) -> Self {
        Self {
            backend,
            tenant_id: tenant_id.into(),
            default_flags,
        }
    }

    pub async fn finalize(&self, request: FinalizeRequest<'_>) -> Result<WebhookAccount, ConnectError> {
        match request.target {
            FinalizeTarget::Create => self.create(&request).await,
            FinalizeTarget::Repair { account_id } => self.repair(account_id, &request).await,
        }
    }

    async fn create(&self, request: &FinalizeRequest<'_>) -> Result<WebhookAccount, ConnectError> {
        let flags = request.flags.unwrap_or(self.default_flags);
        let payload = NewWebhookAccount {
            tenant_id: self.tenant_id.clone(),
            platform: request.platform,
            external_resource_id: request.resource.external_id.clone(),
            display_name: request.resource.display_name.clone(),
            credential_token: request.resource.access_token.clone(),
            is_active: true,
            verification_status: VerificationStatus::Verified,
            ai_enabled: flags.ai_enabled,
            auto_reply: flags.auto_reply,
        };

        let account = self
            .backend
            .create_account(&payload)
            .await
            .map_err(|e| account_failure(None, e))?;
        tracing::info!(account_id = account.id, platform = %request.platform, "webhook account created");

        self.create_mapping(&account, request).await?;
        Ok(account)
    }

    async fn repair(&self, account_id: i64, request: &FinalizeRequest<'_>) -> Result<WebhookAccount, ConnectError> {
        let update = AccountUpdate {
            external_resource_id: Some(request.resource.external_id.clone()),
            display_name: Some(request.resource.display_name.clone()),
            credential_token: request.resource.access_token.clone(),
            is_active: Some(true),
            verification_status: Some(VerificationStatus::Verified),
            ai_enabled: request.flags.map(|f| f.ai_enabled),
            auto_reply: request.flags.map(|f| f.auto_reply),
        };

        let account = match self.backend.update_account(account_id, &update).await {
            Ok(account) => account,
            Err(BackendError::NotFound) => return Err(ConnectError::AccountNotFound { id: account_id }),
            Err(e) => return Err(account_failure(Some(account_id), e)),
        };
        tracing::info!(account_id, "webhook account repaired");

        let existing = self
            .backend
            .list_mappings()
            .await
            .map_err(|e| mapping_failure(account_id, e))?
            .into_iter()
            .find(|m| m.account_id == account_id);

        match existing {
            Some(mapping) if mapping.external_resource_id == request.resource.external_id => {
                tracing::debug!(account_id, mapping_id = mapping.id, "routing mapping already current");
            }
            Some(mapping) => {
                let update = MappingUpdate {
                    external_resource_id: request.resource.external_id.clone(),
                };
                self.backend
                    .update_mapping(mapping.id, &update)
                    .await
                    .map_err(|e| mapping_failure(account_id, e))?;
                tracing::info!(account_id, mapping_id = mapping.id, "routing mapping updated");
            }
            None => {
                self.create_mapping(&account, request).await?;
            }
        }

        Ok(account)
    }

    async fn create_mapping(
        &self,
        account: &WebhookAccount,
        request: &FinalizeRequest<'_>,
    ) -> Result<RoutingMapping, ConnectError> {
        let payload = NewRoutingMapping {
            tenant_id: self.tenant_id.clone(),
            account_id: account.id,
            platform: request.platform,
            external_resource_id: request.resource.external_id.clone(),
        };
        let mapping = self.backend.create_mapping(&payload).await.map_err(|e| {
            tracing::warn!(account_id = account.id, error = %e, "routing mapping write failed; account left without mapping");
            mapping_failure(account.id, e)
        })?;
        tracing::info!(account_id = account.id, mapping_id = mapping.id, "routing mapping created");
        Ok(mapping)
    }
}

fn account_failure(account_id: Option<i64>, e: BackendError) -> ConnectError {
    ConnectError::FinalizationFailure {
        stage: FinalizeStage::Account,
        account_id,
        message: e.to_string(),
    }
}

fn mapping_failure(account_id: i64, e: BackendError) -> ConnectError {
    ConnectError::FinalizationFailure {
        stage: FinalizeStage::Mapping,
        account_id: Some(account_id),
        message: e.to_string(),
    }
}
