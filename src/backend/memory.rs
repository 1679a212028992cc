//! In-process backend.
//!
//! Keeps accounts and mappings in memory, hands out sequential session ids
//! (`session-1`, `session-2`, ...) and answers polls from a per-session
//! script. Failures can be injected per operation. Used for offline runs and
//! throughout the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::ConnectBackend;
use crate::errors::BackendError;
use crate::models::{
    AccountUpdate, AuthorizationInit, MappingUpdate, NewRoutingMapping, NewWebhookAccount,
    Platform, PollResponse, RoutingMapping, WebhookAccount,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InitAuthorization,
    PollSession,
    CreateAccount,
    CreateMapping,
    ListAccounts,
    ListMappings,
    UpdateAccount,
    UpdateMapping,
    DeleteAccount,
    DeleteMapping,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    next_session: u64,
    accounts: Vec<WebhookAccount>,
    mappings: Vec<RoutingMapping>,
    /// Responses handed out in order; the last one repeats.
    polls: HashMap<String, VecDeque<PollResponse>>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    calls: HashMap<Operation, usize>,
}

impl MemoryState {
    fn record(&mut self, op: Operation) -> Result<(), BackendError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct InMemoryBackend {
    tenant_id: String,
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script the poll answers for a session. Unscripted sessions stay pending.
    pub fn script_poll(&self, session_id: &str, responses: Vec<PollResponse>) {
        self.state()
            .polls
            .insert(session_id.to_string(), responses.into());
    }

    /// Make the next call of `op` fail with `error`. Queues up.
    pub fn fail_next(&self, op: Operation, error: BackendError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn accounts(&self) -> Vec<WebhookAccount> {
        self.state().accounts.clone()
    }

    pub fn mappings(&self) -> Vec<RoutingMapping> {
        self.state().mappings.clone()
    }

    /// Insert an account directly, bypassing failure injection.
    pub fn seed_account(&self, account: NewWebhookAccount) -> WebhookAccount {
        let mut state = self.state();
        let id = state.allocate_id();
        let account = account_from(id, account);
        state.accounts.push(account.clone());
        account
    }

    /// Insert a mapping directly, bypassing failure injection.
    pub fn seed_mapping(&self, mapping: NewRoutingMapping) -> RoutingMapping {
        let mut state = self.state();
        let id = state.allocate_id();
        let mapping = mapping_from(id, mapping);
        state.mappings.push(mapping.clone());
        mapping
    }
}

fn account_from(id: i64, new: NewWebhookAccount) -> WebhookAccount {
    WebhookAccount {
        id,
        tenant_id: new.tenant_id,
        platform: new.platform,
        external_resource_id: new.external_resource_id,
        display_name: new.display_name,
        credential_token: new.credential_token,
        is_active: new.is_active,
        verification_status: new.verification_status,
        ai_enabled: new.ai_enabled,
        auto_reply: new.auto_reply,
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn mapping_from(id: i64, new: NewRoutingMapping) -> RoutingMapping {
    RoutingMapping {
        id,
        tenant_id: new.tenant_id,
        account_id: new.account_id,
        platform: new.platform,
        external_resource_id: new.external_resource_id,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl ConnectBackend for InMemoryBackend {
    async fn init_authorization(&self, platform: Platform) -> Result<AuthorizationInit, BackendError> {
        let mut state = self.state();
        state.record(Operation::InitAuthorization)?;
        state.next_session += 1;
        let session_id = format!("session-{}", state.next_session);
        Ok(AuthorizationInit {
            authorization_url: format!("https://auth.example.com/{}?state={}", platform, session_id),
            session_id,
        })
    }

    async fn poll_session(&self, session_id: &str) -> Result<PollResponse, BackendError> {
        let mut state = self.state();
        state.record(Operation::PollSession)?;
        let Some(queue) = state.polls.get_mut(session_id) else {
            return Ok(PollResponse::default());
        };
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(response.unwrap_or_default())
    }

    async fn create_account(&self, account: &NewWebhookAccount) -> Result<WebhookAccount, BackendError> {
        let mut state = self.state();
        state.record(Operation::CreateAccount)?;
        let id = state.allocate_id();
        let account = account_from(id, account.clone());
        state.accounts.push(account.clone());
        Ok(account)
    }

    async fn create_mapping(&self, mapping: &NewRoutingMapping) -> Result<RoutingMapping, BackendError> {
        let mut state = self.state();
        state.record(Operation::CreateMapping)?;
        if !state.accounts.iter().any(|a| a.id == mapping.account_id) {
            return Err(BackendError::Status {
                status: 422,
                message: format!("account {} does not exist", mapping.account_id),
            });
        }
        let id = state.allocate_id();
        let mapping = mapping_from(id, mapping.clone());
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, BackendError> {
        let mut state = self.state();
        state.record(Operation::ListAccounts)?;
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.tenant_id == self.tenant_id)
            .cloned()
            .collect())
    }

    async fn list_mappings(&self) -> Result<Vec<RoutingMapping>, BackendError> {
        let mut state = self.state();
        state.record(Operation::ListMappings)?;
        Ok(state
            .mappings
            .iter()
            .filter(|m| m.tenant_id == self.tenant_id)
            .cloned()
            .collect())
    }

    async fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<WebhookAccount, BackendError> {
        let mut state = self.state();
        state.record(Operation::UpdateAccount)?;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(BackendError::NotFound)?;

        let update = update.clone();
        if let Some(v) = update.external_resource_id {
            account.external_resource_id = v;
        }
        if let Some(v) = update.display_name {
            account.display_name = v;
        }
        if let Some(v) = update.credential_token {
            account.credential_token = Some(v);
        }
        if let Some(v) = update.is_active {
            account.is_active = v;
        }
        if let Some(v) = update.verification_status {
            account.verification_status = v;
        }
        if let Some(v) = update.ai_enabled {
            account.ai_enabled = v;
        }
        if let Some(v) = update.auto_reply {
            account.auto_reply = v;
        }
        account.updated_at = Some(Utc::now());
        Ok(account.clone())
    }

    async fn update_mapping(&self, id: i64, update: &MappingUpdate) -> Result<RoutingMapping, BackendError> {
        let mut state = self.state();
        state.record(Operation::UpdateMapping)?;
        let mapping = state
            .mappings
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(BackendError::NotFound)?;
        mapping.external_resource_id = update.external_resource_id.clone();
        Ok(mapping.clone())
    }

    async fn delete_account(&self, id: i64) -> Result<(), BackendError> {
        let mut state = self.state();
        state.record(Operation::DeleteAccount)?;
        let before = state.accounts.len();
        state.accounts.retain(|a| a.id != id);
        if state.accounts.len() == before {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    async fn delete_mapping(&self, id: i64) -> Result<(), BackendError> {
        let mut state = self.state();
        state.record(Operation::DeleteMapping)?;
        let before = state.mappings.len();
        state.mappings.retain(|m| m.id != id);
        if state.mappings.len() == before {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }
}
