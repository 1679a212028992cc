//! REST collaborator contract.
//!
//! The orchestrator only talks to the backend through [`ConnectBackend`].
//! Implementations: [`HttpBackend`] for the REST API and [`InMemoryBackend`]
//! for offline runs and tests.

pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::errors::BackendError;
use crate::models::{
    AccountUpdate, AuthorizationInit, MappingUpdate, NewRoutingMapping, NewWebhookAccount,
    Platform, PollResponse, RoutingMapping, WebhookAccount,
};

pub use http::HttpBackend;
pub use memory::{InMemoryBackend, Operation};

#[async_trait]
pub trait ConnectBackend: Send + Sync {
    /// Start an authorization session with the platform's identity provider.
    async fn init_authorization(&self, platform: Platform) -> Result<AuthorizationInit, BackendError>;

    /// Read the server-side session. `BackendError::NotFound` means the session
    /// has not been created yet, which callers treat as "not ready".
    async fn poll_session(&self, session_id: &str) -> Result<PollResponse, BackendError>;

    async fn create_account(&self, account: &NewWebhookAccount) -> Result<WebhookAccount, BackendError>;

    async fn create_mapping(&self, mapping: &NewRoutingMapping) -> Result<RoutingMapping, BackendError>;

    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, BackendError>;

    async fn list_mappings(&self) -> Result<Vec<RoutingMapping>, BackendError>;

    async fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<WebhookAccount, BackendError>;

    async fn update_mapping(&self, id: i64, update: &MappingUpdate) -> Result<RoutingMapping, BackendError>;

    async fn delete_account(&self, id: i64) -> Result<(), BackendError>;

    async fn delete_mapping(&self, id: i64) -> Result<(), BackendError>;
}
