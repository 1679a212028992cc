use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::ConnectBackend;
use crate::config::ConnectConfig;
use crate::errors::BackendError;
use crate::models::{
    AccountUpdate, AuthorizationInit, MappingUpdate, NewRoutingMapping, NewWebhookAccount,
    Platform, PollResponse, RoutingMapping, WebhookAccount,
};

const USER_AGENT: &str = concat!("platform-connect/", env!("CARGO_PKG_VERSION"));

/// `ConnectBackend` over the tenant REST API.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    tenant_id: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        tenant_id: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).with_context(|| format!("Invalid backend URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Backend URL cannot carry a path: {}", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            tenant_id: tenant_id.into(),
            api_token,
        })
    }

    pub fn from_config(config: &ConnectConfig) -> anyhow::Result<Self> {
        Self::new(
            config.toml.base_url(),
            config.tenant_id()?,
            config.toml.api_token(),
            Duration::from_secs(config.toml.backend.request_timeout_secs),
        )
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Append path segments to the base URL. Segments are percent-encoded,
    /// so opaque ids cannot change the route.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Transport(format!("Backend URL cannot carry a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let resp = self
            .authorized(req)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Pull `{"error": "..."}` or `{"message": "..."}` out of an error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl ConnectBackend for HttpBackend {
    async fn init_authorization(&self, platform: Platform) -> Result<AuthorizationInit, BackendError> {
        let req = self
            .client
            .post(self.url(&["oauth", platform.as_str(), "init"])?)
            .json(&serde_json::json!({ "tenant_id": self.tenant_id }));
        self.send_json(req).await
    }

    async fn poll_session(&self, session_id: &str) -> Result<PollResponse, BackendError> {
        let req = self.client.get(self.url(&["oauth", "sessions", session_id])?);
        self.send_json(req).await
    }

    async fn create_account(&self, account: &NewWebhookAccount) -> Result<WebhookAccount, BackendError> {
        let req = self.client.post(self.url(&["webhook-accounts"])?).json(account);
        self.send_json(req).await
    }

    async fn create_mapping(&self, mapping: &NewRoutingMapping) -> Result<RoutingMapping, BackendError> {
        let req = self.client.post(self.url(&["webhook-mappings"])?).json(mapping);
        self.send_json(req).await
    }

    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, BackendError> {
        let req = self
            .client
            .get(self.url(&["webhook-accounts"])?)
            .query(&[("tenant_id", self.tenant_id.as_str())]);
        self.send_json(req).await
    }

    async fn list_mappings(&self) -> Result<Vec<RoutingMapping>, BackendError> {
        let req = self
            .client
            .get(self.url(&["webhook-mappings"])?)
            .query(&[("tenant_id", self.tenant_id.as_str())]);
        self.send_json(req).await
    }

    async fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<WebhookAccount, BackendError> {
        let req = self
            .client
            .patch(self.url(&["webhook-accounts", &id.to_string()])?)
            .json(update);
        self.send_json(req).await
    }

    async fn update_mapping(&self, id: i64, update: &MappingUpdate) -> Result<RoutingMapping, BackendError> {
        let req = self
            .client
            .patch(self.url(&["webhook-mappings", &id.to_string()])?)
            .json(update);
        self.send_json(req).await
    }

    async fn delete_account(&self, id: i64) -> Result<(), BackendError> {
        let req = self.client.delete(self.url(&["webhook-accounts", &id.to_string()])?);
        self.send(req).await.map(|_| ())
    }

    async fn delete_mapping(&self, id: i64) -> Result<(), BackendError> {
        let req = self.client.delete(self.url(&["webhook-mappings", &id.to_string()])?);
        self.send(req).await.map(|_| ())
    }
}
