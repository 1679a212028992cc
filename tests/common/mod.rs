//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use platform_connect::Coordinator;
use platform_connect::backend::InMemoryBackend;
use platform_connect::channel::ExternalAuthorizationChannel;
use platform_connect::config::OrchestratorSettings;
use platform_connect::errors::ChannelError;
use platform_connect::events::ConnectEvent;
use platform_connect::fallback::FallbackCache;
use platform_connect::models::{ConnectableResource, PollResponse};
use platform_connect::session::{SessionSnapshot, SessionState};

pub const TENANT: &str = "tenant-1";

/// Authorization window double that counts opens and closes and lets the
/// test post window messages.
pub struct RecordingChannel {
    tx: broadcast::Sender<serde_json::Value>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    blocked: AtomicBool,
    urls: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(16);
        Arc::new(Self {
            tx,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            urls: Mutex::new(Vec::new()),
        })
    }

    /// Every `open` fails as if a popup blocker intervened.
    pub fn blocked() -> Arc<Self> {
        let channel = Self::new();
        channel.blocked.store(true, Ordering::SeqCst);
        channel
    }

    pub fn post(&self, message: serde_json::Value) {
        let _ = self.tx.send(message);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalAuthorizationChannel for RecordingChannel {
    async fn open(&self, url: &str) -> Result<(), ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if self.blocked.load(Ordering::SeqCst) {
            return Err(ChannelError::PopupBlocked {
                url: url.to_string(),
                reason: "blocked by test".into(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.tx.subscribe()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub channel: Arc<RecordingChannel>,
    pub coordinator: Coordinator,
    pub events: broadcast::Receiver<ConnectEvent>,
    pub state: watch::Receiver<SessionSnapshot>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RecordingChannel::new(), None)
    }

    pub fn with_channel(channel: Arc<RecordingChannel>) -> Self {
        Self::build(channel, None)
    }

    pub fn with_fallback(cache: FallbackCache) -> Self {
        Self::build(RecordingChannel::new(), Some(cache))
    }

    fn build(channel: Arc<RecordingChannel>, fallback: Option<FallbackCache>) -> Self {
        let backend = Arc::new(InMemoryBackend::new(TENANT));
        let coordinator = Coordinator::new(
            backend.clone(),
            channel.clone(),
            fallback,
            TENANT,
            OrchestratorSettings::default(),
        );
        let events = coordinator.subscribe_events();
        let state = coordinator.subscribe_state();
        Self {
            backend,
            channel,
            coordinator,
            events,
            state,
        }
    }

    /// Wait (on the paused clock) until the session reaches `state`.
    pub async fn wait_for(&mut self, state: SessionState) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(900), self.state.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("session never reached {}", state))
            .expect("state channel closed")
            .clone()
    }

    /// Everything broadcast so far.
    pub fn drain_events(&mut self) -> Vec<ConnectEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn pages(n: usize) -> Vec<ConnectableResource> {
    (1..=n)
        .map(|i| {
            ConnectableResource::new(format!("page-{}", i), format!("Acme Page {}", i))
                .with_tag("messaging")
                .with_access_token(format!("token-{}", i))
        })
        .collect()
}

pub fn pending() -> PollResponse {
    PollResponse::default()
}

pub fn ready(resources: Vec<ConnectableResource>) -> PollResponse {
    PollResponse {
        ready: true,
        resources: Some(resources),
        ..PollResponse::default()
    }
}

pub fn ready_message(session_id: &str, resources: &[ConnectableResource]) -> serde_json::Value {
    serde_json::json!({
        "type": "connect_ready",
        "sessionId": session_id,
        "resources": resources,
        "externalIdentity": {"displayName": "Jo Admin"}
    })
}
