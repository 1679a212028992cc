//! External authorization window abstraction.
//!
//! The coordinator opens the provider's authorization page through an
//! [`ExternalAuthorizationChannel`] and listens for the completion message the
//! window posts back. The window itself is platform-specific (a browser popup,
//! the system browser plus a loopback listener, an embedded web view); the
//! coordinator only sees `open`, `subscribe` and `close`.
//!
//! - [`loopback`]: system browser + local HTTP listener implementation
//!
//! ## Message Contract
//!
//! | `type`          | Fields                                               |
//! |-----------------|------------------------------------------------------|
//! | `connect_ready` | `sessionId`, `resources` (or `pages`), `externalIdentity` (or `user`) |
//! | `connect_error` | `sessionId`, `error`                                 |
//!
//! Anything else on the transport is ignored.

pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::ChannelError;
use crate::fallback::FallbackEntry;
use crate::models::{ConnectableResource, ExternalIdentity};

pub use loopback::LoopbackChannel;

#[async_trait]
pub trait ExternalAuthorizationChannel: Send + Sync {
    /// Show the authorization page. Fails with `PopupBlocked` if no window could be opened.
    async fn open(&self, url: &str) -> Result<(), ChannelError>;

    /// Raw messages posted by the window. Receivers must tolerate unrelated traffic.
    fn subscribe(&self) -> broadcast::Receiver<serde_json::Value>;

    /// Close the window. Calling this when nothing is open is a no-op.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// A completion message posted by the authorization window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowMessage {
    ConnectReady {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, alias = "pages")]
        resources: Vec<ConnectableResource>,
        #[serde(default, rename = "externalIdentity", alias = "user")]
        external_identity: Option<ExternalIdentity>,
    },
    ConnectError {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        error: String,
    },
}

impl WindowMessage {
    /// Parse a raw transport message; `None` for anything that isn't ours.
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        let message = serde_json::from_value::<Self>(value.clone()).ok()?;
        (!message.session_id().is_empty()).then_some(message)
    }

    pub fn session_id(&self) -> &str {
        match self {
            WindowMessage::ConnectReady { session_id, .. } => session_id,
            WindowMessage::ConnectError { session_id, .. } => session_id,
        }
    }

    /// The equivalent fallback cache entry the window leaves behind.
    pub fn to_fallback_entry(&self) -> FallbackEntry {
        match self {
            WindowMessage::ConnectReady {
                session_id,
                resources,
                external_identity,
            } => FallbackEntry::ready(session_id.clone(), resources.clone(), external_identity.clone()),
            WindowMessage::ConnectError { session_id, error } => {
                FallbackEntry::denied(session_id.clone(), error.clone())
            }
        }
    }
}
