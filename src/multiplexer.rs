//! Reconciliation multiplexer.
//!
//! Three input adapters race to deliver the same "session ready" result:
//!
//! ```text
//!  poll adapter ──────┐   (GET session status every poll_interval)
//!  message adapter ───┼──> mpsc queue ──> coordinator ──> admit() ──> apply once
//!  fallback adapter ──┘   (read cache entry every fallback_read_interval)
//! ```
//!
//! Adapters only propose [`ChannelEvent`]s. The coordinator drains the queue
//! in arrival order and calls [`ReconciliationMultiplexer::admit`] under the
//! session lock, which applies the first matching event and discards the rest.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::ConnectBackend;
use crate::channel::{ExternalAuthorizationChannel, WindowMessage};
use crate::errors::BackendError;
use crate::fallback::{FallbackCache, FallbackEntry};
use crate::models::{ConnectableResource, ExternalIdentity, PollResponse};
use crate::session::{DeliveryChannel, OrchestrationSession, SessionState};

const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyPayload {
    pub resources: Vec<ConnectableResource>,
    pub external_identity: Option<ExternalIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    Ready(ReadyPayload),
    /// The provider reported an error instead of a result.
    Denied(String),
}

/// A proposal from one delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: DeliveryChannel,
    pub session_id: String,
    pub outcome: ChannelOutcome,
}

impl ChannelEvent {
    /// `None` while the server-side session is still pending.
    pub fn from_poll(session_id: &str, response: PollResponse) -> Option<Self> {
        let outcome = if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            ChannelOutcome::Denied(error)
        } else if response.ready {
            ChannelOutcome::Ready(ReadyPayload {
                resources: response.resources.unwrap_or_default(),
                external_identity: response.external_identity,
            })
        } else {
            return None;
        };
        Some(Self {
            channel: DeliveryChannel::Poll,
            session_id: session_id.to_string(),
            outcome,
        })
    }

    /// `None` for anything on the transport that isn't a completion message.
    pub fn from_message(raw: &serde_json::Value) -> Option<Self> {
        let event = match WindowMessage::parse(raw)? {
            WindowMessage::ConnectReady {
                session_id,
                resources,
                external_identity,
            } => Self {
                channel: DeliveryChannel::Message,
                session_id,
                outcome: ChannelOutcome::Ready(ReadyPayload {
                    resources,
                    external_identity,
                }),
            },
            WindowMessage::ConnectError { session_id, error } => Self {
                channel: DeliveryChannel::Message,
                session_id,
                outcome: ChannelOutcome::Denied(error),
            },
        };
        Some(event)
    }

    pub fn from_fallback(entry: FallbackEntry) -> Self {
        let outcome = match entry.error {
            Some(error) => ChannelOutcome::Denied(error),
            None => ChannelOutcome::Ready(ReadyPayload {
                resources: entry.resources,
                external_identity: entry.external_identity,
            }),
        };
        Self {
            channel: DeliveryChannel::Fallback,
            session_id: entry.session_id,
            outcome,
        }
    }
}

/// Verdict for one proposed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First delivery for the active session: apply it.
    Apply,
    /// The session already received its payload from some channel.
    Duplicate,
    /// Not for the active session, or the session is no longer waiting.
    Stale,
}

/// Where adapters read from.
#[derive(Clone)]
pub struct Sources {
    pub backend: Arc<dyn ConnectBackend>,
    pub channel: Arc<dyn ExternalAuthorizationChannel>,
    pub fallback: Option<FallbackCache>,
}

pub struct ReconciliationMultiplexer {
    rx: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
    adapters: Vec<JoinHandle<()>>,
}

impl ReconciliationMultiplexer {
    /// Start all adapters for one session. The message subscription is taken
    /// before this returns, so open the window afterwards.
    pub fn spawn(
        session_id: &str,
        sources: Sources,
        poll_interval: Duration,
        fallback_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut adapters = Vec::with_capacity(3);

        adapters.push(tokio::spawn(poll_adapter(
            sources.backend.clone(),
            session_id.to_string(),
            poll_interval,
            tx.clone(),
            cancel.clone(),
        )));

        adapters.push(tokio::spawn(message_adapter(
            sources.channel.subscribe(),
            tx.clone(),
            cancel.clone(),
        )));

        if let Some(cache) = sources.fallback {
            adapters.push(tokio::spawn(fallback_adapter(
                cache,
                session_id.to_string(),
                fallback_interval,
                tx,
                cancel.clone(),
            )));
        }

        Self {
            rx,
            cancel,
            adapters,
        }
    }

    /// Next proposal in arrival order; `None` once every adapter has stopped.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Stop all adapters. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Decide whether `event` is the one to apply, recording the channel.
    pub fn admit(session: &mut OrchestrationSession, event: &ChannelEvent) -> Admission {
        if !session.matches(&event.session_id) {
            return Admission::Stale;
        }
        let first = session.consumed_channels.is_empty();
        session.consumed_channels.insert(event.channel);
        if !first {
            return Admission::Duplicate;
        }
        if session.state != SessionState::AwaitingAuthorization {
            return Admission::Stale;
        }
        Admission::Apply
    }
}

impl Drop for ReconciliationMultiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in &self.adapters {
            handle.abort();
        }
    }
}

async fn poll_adapter(
    backend: Arc<dyn ConnectBackend>,
    session_id: String,
    interval: Duration,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            r = backend.poll_session(&session_id) => r,
        };

        match response {
            Ok(resp) => {
                if let Some(event) = ChannelEvent::from_poll(&session_id, resp)
                    && tx.send(event).await.is_err()
                {
                    break;
                }
            }
            // The server-side session may not exist yet.
            Err(BackendError::NotFound) => {
                tracing::debug!(%session_id, "session not found yet, still waiting");
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "session poll failed, will retry");
            }
        }
    }
}

async fn message_adapter(
    mut messages: broadcast::Receiver<serde_json::Value>,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            r = messages.recv() => r,
        };
        match raw {
            Ok(raw) => match ChannelEvent::from_message(&raw) {
                Some(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => tracing::trace!("ignoring unrelated window message"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "window message stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn fallback_adapter(
    cache: FallbackCache,
    session_id: String,
    interval: Duration,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match cache.read(&session_id) {
            Ok(Some(entry)) => {
                // One proposal is enough; the coordinator deletes the entry once applied.
                let _ = tx.send(ChannelEvent::from_fallback(entry)).await;
                break;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%session_id, error = %e, "fallback cache read failed"),
        }
    }
}
