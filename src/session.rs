//! Session store: the single in-flight orchestration session.
//!
//! The store is owned by the coordinator. Every mutation goes through a
//! [`SessionGuard`], which republishes a [`SessionSnapshot`] on a `watch`
//! channel when it is dropped so UI observers always see the latest state.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::errors::ConnectError;
use crate::models::{ConnectableResource, ExternalIdentity, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initiating,
    AwaitingAuthorization,
    PagesReady,
    Configuring,
    Finalized,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Initiating => "Initiating",
            SessionState::AwaitingAuthorization => "AwaitingAuthorization",
            SessionState::PagesReady => "PagesReady",
            SessionState::Configuring => "Configuring",
            SessionState::Finalized => "Finalized",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// The delivery path a session-ready payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Server-side session status poll.
    Poll,
    /// Message posted by the authorization window.
    Message,
    /// Entry left in the persistent fallback cache.
    Fallback,
}

/// Whether the session provisions a new account or repairs an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Create,
    Repair { account_id: i64 },
}

#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub platform: Option<Platform>,
    pub mode: SessionMode,
    pub resources: Vec<ConnectableResource>,
    pub selected_resource: Option<ConnectableResource>,
    pub external_identity: Option<ExternalIdentity>,
    pub authorization_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed_channels: BTreeSet<DeliveryChannel>,
    /// Bumped on every start; async completions carrying an older value are stale.
    pub attempt: u64,
    pub last_error: Option<String>,
    /// Account left without a mapping by a partially failed finalize.
    pub orphaned_account_id: Option<i64>,
    pub finalizing: bool,
}

impl Default for OrchestrationSession {
    fn default() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            platform: None,
            mode: SessionMode::Create,
            resources: Vec::new(),
            selected_resource: None,
            external_identity: None,
            authorization_url: None,
            created_at: None,
            expires_at: None,
            consumed_channels: BTreeSet::new(),
            attempt: 0,
            last_error: None,
            orphaned_account_id: None,
            finalizing: false,
        }
    }
}

impl OrchestrationSession {
    /// A session holding external resources (popup, polling, pending writes).
    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Idle | SessionState::Failed)
    }

    pub fn matches(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    /// Guard a transition on the current source state.
    pub fn expect(&self, allowed: &[SessionState], expected: &'static str) -> Result<(), ConnectError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ConnectError::StaleTransition {
                expected,
                actual: self.state,
            })
        }
    }

    /// Enter `Initiating` for a new attempt. Returns the attempt number.
    pub fn begin(&mut self, platform: Platform, mode: SessionMode) -> u64 {
        let attempt = self.attempt + 1;
        *self = Self {
            state: SessionState::Initiating,
            platform: Some(platform),
            mode,
            attempt,
            ..Self::default()
        };
        attempt
    }

    /// Record the issued session id and start the expiry clock.
    pub fn authorize(&mut self, session_id: String, url: String, now: DateTime<Utc>, timeout: std::time::Duration) {
        self.session_id = Some(session_id);
        self.authorization_url = Some(url);
        self.created_at = Some(now);
        self.expires_at = Some(now + ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::seconds(300)));
        self.state = SessionState::AwaitingAuthorization;
    }

    /// Discard everything; keeps the attempt counter monotonic.
    pub fn reset(&mut self) {
        *self = Self {
            attempt: self.attempt,
            ..Self::default()
        };
    }

    /// Park in `Failed` without any live resources.
    pub fn park_failed(&mut self, error: &ConnectError) {
        let platform = self.platform;
        let mode = self.mode;
        self.reset();
        self.state = SessionState::Failed;
        self.platform = platform;
        self.mode = mode;
        self.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            platform: self.platform,
            mode: self.mode,
            resources: self.resources.clone(),
            selected_resource: self.selected_resource.clone(),
            external_identity: self.external_identity.clone(),
            authorization_url: self.authorization_url.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of the session for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub platform: Option<Platform>,
    pub mode: SessionMode,
    pub resources: Vec<ConnectableResource>,
    pub selected_resource: Option<ConnectableResource>,
    pub external_identity: Option<ExternalIdentity>,
    pub authorization_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct SessionStore {
    session: Mutex<OrchestrationSession>,
    tx: watch::Sender<SessionSnapshot>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let session = OrchestrationSession::default();
        let (tx, _rx) = watch::channel(session.snapshot());
        Self {
            session: Mutex::new(session),
            tx,
        }
    }

    pub async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            guard: self.session.lock().await,
            tx: &self.tx,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }
}

/// Exclusive access to the session; publishes a snapshot on drop.
pub struct SessionGuard<'a> {
    guard: MutexGuard<'a, OrchestrationSession>,
    tx: &'a watch::Sender<SessionSnapshot>,
}

impl std::ops::Deref for SessionGuard<'_> {
    type Target = OrchestrationSession;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl std::ops::DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let snapshot = self.guard.snapshot();
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
