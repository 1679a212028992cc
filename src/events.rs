//! UI-facing notifications.
//!
//! State changes are observable through the session `watch` snapshot; these
//! events carry the one-off things a snapshot can't express (a blocked popup,
//! a partial success, an aggregated reconnect notice). They serialize as
//! `{"type": "...", "data": {...}}` for a UI bridge.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::detector::ReconnectNotice;
use crate::models::{Platform, WebhookAccount};
use crate::session::DeliveryChannel;

pub const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConnectEvent {
    AuthorizationStarted {
        session_id: String,
        platform: Platform,
        authorization_url: String,
    },
    /// No window could be opened; the UI should offer the link instead.
    PopupBlocked {
        session_id: String,
        authorization_url: String,
    },
    ResourcesReady {
        session_id: String,
        count: usize,
        channel: DeliveryChannel,
    },
    ResourceSelected {
        session_id: String,
        external_id: String,
        automatic: bool,
    },
    SessionResumed {
        session_id: String,
    },
    SessionFailed {
        kind: &'static str,
        message: String,
    },
    SessionCancelled,
    AccountConnected {
        account: WebhookAccount,
    },
    /// The account exists but its mapping does not yet.
    AccountPartiallyConnected {
        account_id: i64,
        message: String,
    },
    FinalizationFailed {
        message: String,
    },
    AccountUpdated {
        account: WebhookAccount,
    },
    AccountDeleted {
        account_id: i64,
    },
    ReconnectRequired {
        notice: ReconnectNotice,
    },
}

impl ConnectEvent {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Send an event to all subscribers. Having none is fine.
pub fn broadcast_event(tx: &broadcast::Sender<ConnectEvent>, event: ConnectEvent) {
    tracing::trace!(?event, "broadcasting event");
    let _ = tx.send(event);
}
