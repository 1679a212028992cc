//! OAuth session coordinator.
//!
//! The coordinator is the only writer of session state. It drives one
//! connection attempt at a time through:
//!
//! ```text
//! Idle/Failed ─start()─> Initiating ─init ok─> AwaitingAuthorization ─ready─> PagesReady
//!                             │                       │  │                        │
//!                        init failed          timeout │  │ denied        select / auto
//!                             v                       v  v                        v
//!                           Failed <──────────────── Failed          Configuring ─finalize()─> Finalized ─> Idle
//!                                                                         │
//!                                                                  failure └─> PagesReady
//! ```
//!
//! `cancel()` returns any state to Idle. While a session is awaiting
//! authorization a watch task races the multiplexer against the session
//! deadline; whichever fires first wins and the other is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ConnectBackend, HttpBackend};
use crate::channel::{ExternalAuthorizationChannel, LoopbackChannel};
use crate::config::{ConnectConfig, OrchestratorSettings};
use crate::errors::{ConnectError, FinalizeStage};
use crate::events::{ConnectEvent, EVENT_BUFFER, broadcast_event};
use crate::fallback::{FallbackCache, PendingSession};
use crate::finalizer::{AccountFinalizer, FinalizeRequest, FinalizeTarget};
use crate::models::{AccountFlags, ConnectableResource, Platform, WebhookAccount};
use crate::multiplexer::{
    Admission, ChannelEvent, ChannelOutcome, ReconciliationMultiplexer, Sources,
};
use crate::selector::{ResourceSelector, SelectionPlan};
use crate::session::{OrchestrationSession, SessionMode, SessionSnapshot, SessionState, SessionStore};

struct Inner {
    backend: Arc<dyn ConnectBackend>,
    channel: Arc<dyn ExternalAuthorizationChannel>,
    fallback: Option<FallbackCache>,
    store: SessionStore,
    settings: OrchestratorSettings,
    selector: ResourceSelector,
    finalizer: AccountFinalizer,
    events: broadcast::Sender<ConnectEvent>,
    /// Cancels the current attempt's watch task and adapters.
    watch: Mutex<Option<CancellationToken>>,
    window_open: AtomicBool,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn ConnectBackend>,
        channel: Arc<dyn ExternalAuthorizationChannel>,
        fallback: Option<FallbackCache>,
        tenant_id: impl Into<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let finalizer = AccountFinalizer::new(backend.clone(), tenant_id, settings.default_flags);
        Self {
            inner: Arc::new(Inner {
                backend,
                channel,
                fallback,
                store: SessionStore::new(),
                selector: ResourceSelector::new(settings.auto_select_delay),
                settings,
                finalizer,
                events,
                watch: Mutex::new(None),
                window_open: AtomicBool::new(false),
            }),
        }
    }

    /// Wire the REST backend, the loopback window and the fallback cache from config.
    pub fn from_config(config: &ConnectConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn ConnectBackend> = Arc::new(HttpBackend::from_config(config)?);
        let cache = FallbackCache::open(config.fallback_dir())?;
        let channel: Arc<dyn ExternalAuthorizationChannel> =
            Arc::new(LoopbackChannel::new(0, Some(cache.clone())));
        Ok(Self::new(
            backend,
            channel,
            Some(cache),
            config.tenant_id()?,
            config.orchestrator_settings(),
        ))
    }

    /// Sender side of the event stream, for components that publish alongside the coordinator.
    pub fn events(&self) -> broadcast::Sender<ConnectEvent> {
        self.inner.events.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.store.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.store.snapshot().await
    }

    /// Begin connecting a new account on `platform`.
    pub async fn start(&self, platform: Platform) -> Result<SessionSnapshot, ConnectError> {
        self.start_with(platform, SessionMode::Create).await
    }

    /// Re-authorize an existing account, updating it in place on finalize.
    pub async fn start_repair(&self, account_id: i64) -> Result<SessionSnapshot, ConnectError> {
        let account = self
            .inner
            .backend
            .list_accounts()
            .await?
            .into_iter()
            .find(|a| a.id == account_id)
            .ok_or(ConnectError::AccountNotFound { id: account_id })?;
        self.start_with(account.platform, SessionMode::Repair { account_id })
            .await
    }

    async fn start_with(&self, platform: Platform, mode: SessionMode) -> Result<SessionSnapshot, ConnectError> {
        let attempt = loop {
            let mut session = self.inner.store.lock().await;
            if !session.is_live() {
                break session.begin(platform, mode);
            }
            if session.platform == Some(platform) && session.mode == mode {
                tracing::debug!(%platform, state = %session.state, "connection already in progress, reusing session");
                return Ok(session.snapshot());
            }
            drop(session);
            tracing::info!(%platform, "replacing the active session");
            self.cancel().await;
        };

        tracing::info!(%platform, attempt, "starting authorization");
        let init = match self.inner.backend.init_authorization(platform).await {
            Ok(init) => init,
            Err(e) => {
                let err = ConnectError::InitializationFailure(e.to_string());
                {
                    let mut session = self.inner.store.lock().await;
                    if session.attempt == attempt && session.state == SessionState::Initiating {
                        session.park_failed(&err);
                    }
                }
                tracing::warn!(%platform, error = %e, "authorization init failed");
                self.emit_failure(&err);
                return Err(err);
            }
        };

        {
            let mut session = self.inner.store.lock().await;
            if session.attempt != attempt || session.state != SessionState::Initiating {
                tracing::debug!(session_id = %init.session_id, "session changed during init, dropping result");
                return Err(ConnectError::StaleTransition {
                    expected: "Initiating",
                    actual: session.state,
                });
            }
            session.authorize(
                init.session_id.clone(),
                init.authorization_url.clone(),
                Utc::now(),
                self.inner.settings.session_timeout,
            );
        }

        self.record_pending(PendingSession::new(init.session_id.clone(), platform, mode));

        // Adapters subscribe before the window opens so no message is missed.
        self.spawn_watch(attempt, &init.session_id);
        broadcast_event(
            &self.inner.events,
            ConnectEvent::AuthorizationStarted {
                session_id: init.session_id.clone(),
                platform,
                authorization_url: init.authorization_url.clone(),
            },
        );

        match self.inner.channel.open(&init.authorization_url).await {
            Ok(()) => {
                self.inner.window_open.store(true, Ordering::SeqCst);
                if !self.is_awaiting(attempt).await {
                    self.close_window().await;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %init.session_id, error = %e, "authorization window blocked, still waiting");
                broadcast_event(
                    &self.inner.events,
                    ConnectEvent::PopupBlocked {
                        session_id: init.session_id.clone(),
                        authorization_url: init.authorization_url.clone(),
                    },
                );
            }
        }

        Ok(self.snapshot().await)
    }

    /// Abandon the current session. Safe to call in any state, any number of times.
    pub async fn cancel(&self) {
        let cleared = {
            let mut session = self.inner.store.lock().await;
            let was_active = session.state != SessionState::Idle;
            let session_id = session.session_id.clone();
            session.reset();
            was_active.then_some(session_id)
        };

        let previous = self.watch_slot().take();
        if let Some(token) = previous {
            token.cancel();
        }
        self.close_window().await;

        if let Some(session_id) = cleared {
            if let Some(id) = &session_id {
                self.discard_fallback(id);
            }
            tracing::info!(session_id = ?session_id, "session cancelled");
            broadcast_event(&self.inner.events, ConnectEvent::SessionCancelled);
        }
    }

    /// Pick one of the offered resources.
    pub async fn select_resource(&self, external_id: &str) -> Result<SessionSnapshot, ConnectError> {
        let mut session = self.inner.store.lock().await;
        session.expect(&[SessionState::PagesReady], "PagesReady")?;
        let resource = ResourceSelector::choose(&session.resources, external_id)?;
        let session_id = session.session_id.clone().unwrap_or_default();
        select_locked(&mut session, resource);
        let snapshot = session.snapshot();
        drop(session);

        broadcast_event(
            &self.inner.events,
            ConnectEvent::ResourceSelected {
                session_id,
                external_id: external_id.to_string(),
                automatic: false,
            },
        );
        Ok(snapshot)
    }

    /// Provision the selected resource. `flags = None` uses the configured
    /// defaults for a new account and keeps existing flags on repair.
    pub async fn finalize(&self, flags: Option<AccountFlags>) -> Result<WebhookAccount, ConnectError> {
        let (attempt, platform, resource, target) = {
            let mut session = self.inner.store.lock().await;
            let retry = session.state == SessionState::PagesReady && session.selected_resource.is_some();
            if (session.state != SessionState::Configuring && !retry) || session.finalizing {
                return Err(ConnectError::StaleTransition {
                    expected: "Configuring",
                    actual: session.state,
                });
            }
            let (Some(platform), Some(resource)) = (session.platform, session.selected_resource.clone()) else {
                return Err(ConnectError::StaleTransition {
                    expected: "Configuring",
                    actual: session.state,
                });
            };
            let target = match (session.mode, session.orphaned_account_id) {
                (SessionMode::Repair { account_id }, _) => FinalizeTarget::Repair { account_id },
                (SessionMode::Create, Some(account_id)) => FinalizeTarget::Repair { account_id },
                (SessionMode::Create, None) => FinalizeTarget::Create,
            };
            session.finalizing = true;
            session.state = SessionState::Configuring;
            (session.attempt, platform, resource, target)
        };

        tracing::info!(%platform, external_id = %resource.external_id, ?target, "finalizing account");
        let result = self
            .inner
            .finalizer
            .finalize(FinalizeRequest {
                platform,
                resource: &resource,
                flags,
                target,
            })
            .await;

        let mut session = self.inner.store.lock().await;
        let current = session.attempt == attempt && session.state == SessionState::Configuring;
        match result {
            Ok(account) => {
                if current {
                    session.state = SessionState::Finalized;
                }
                drop(session);

                tracing::info!(account_id = account.id, %platform, "account connected");
                broadcast_event(
                    &self.inner.events,
                    ConnectEvent::AccountConnected {
                        account: account.clone(),
                    },
                );

                if current {
                    let mut session = self.inner.store.lock().await;
                    if session.attempt == attempt && session.state == SessionState::Finalized {
                        session.reset();
                    }
                }
                Ok(account)
            }
            Err(err) => {
                if current {
                    session.finalizing = false;
                    session.state = SessionState::PagesReady;
                    session.last_error = Some(err.to_string());
                    if let ConnectError::FinalizationFailure {
                        stage: FinalizeStage::Mapping,
                        account_id: Some(id),
                        ..
                    } = &err
                    {
                        session.orphaned_account_id = Some(*id);
                    }
                }
                drop(session);

                match &err {
                    ConnectError::FinalizationFailure {
                        account_id: Some(account_id),
                        ..
                    } if err.is_partial_success() => {
                        tracing::warn!(account_id, error = %err, "account created without routing mapping");
                        broadcast_event(
                            &self.inner.events,
                            ConnectEvent::AccountPartiallyConnected {
                                account_id: *account_id,
                                message: "Account connected. Message routing is not set up yet; \
                                          the account will be flagged for reconnection."
                                    .to_string(),
                            },
                        );
                    }
                    _ => {
                        tracing::warn!(error = %err, "finalization failed");
                        broadcast_event(
                            &self.inner.events,
                            ConnectEvent::FinalizationFailed {
                                message: err.to_string(),
                            },
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Pick up a result the window delivered while no coordinator was
    /// listening (e.g. after a crash). Reads the fallback cache once; the
    /// newest entry younger than the resume window whose session was issued
    /// for `platform` is applied into a fresh session with the recorded mode.
    pub async fn resume_abandoned(&self, platform: Platform) -> Option<SessionSnapshot> {
        let cache = self.inner.fallback.as_ref()?;
        let now = Utc::now();
        let window = self.inner.settings.resume_window;

        let found = match cache.most_recent_for(platform, window, now) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read fallback cache");
                return None;
            }
        };
        match cache.purge_older_than(window, now) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "purged expired fallback entries"),
            Err(e) => tracing::debug!(error = %e, "failed to purge fallback cache"),
        }
        let pending_max_age = self.inner.settings.session_timeout + window;
        if let Err(e) = cache.purge_pending_older_than(pending_max_age, now) {
            tracing::debug!(error = %e, "failed to purge pending sessions");
        }
        let (entry, pending) = found?;

        let session_id = entry.session_id.clone();
        {
            let mut session = self.inner.store.lock().await;
            if session.is_live() {
                tracing::debug!(%session_id, "session already active, not resuming");
                return None;
            }
            session.begin(pending.platform, pending.mode);
            session.authorize(
                session_id.clone(),
                String::new(),
                pending.issued_at,
                self.inner.settings.session_timeout,
            );
            session.authorization_url = None;
        }

        tracing::info!(%session_id, platform = %pending.platform, mode = ?pending.mode, "resuming session from fallback cache");
        broadcast_event(
            &self.inner.events,
            ConnectEvent::SessionResumed {
                session_id: session_id.clone(),
            },
        );
        self.apply_event(ChannelEvent::from_fallback(entry)).await;
        Some(self.snapshot().await)
    }

    /// Resume a recent abandoned result for `platform`, or start a new
    /// authorization when there is none.
    pub async fn resume_or_start(&self, platform: Platform) -> Result<SessionSnapshot, ConnectError> {
        match self.resume_abandoned(platform).await {
            Some(snapshot) => Ok(snapshot),
            None => self.start(platform).await,
        }
    }

    fn watch_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn is_awaiting(&self, attempt: u64) -> bool {
        let session = self.inner.store.lock().await;
        session.attempt == attempt && session.state == SessionState::AwaitingAuthorization
    }

    fn spawn_watch(&self, attempt: u64, session_id: &str) {
        let cancel = CancellationToken::new();
        let previous = self.watch_slot().replace(cancel.clone());
        if let Some(token) = previous {
            token.cancel();
        }

        let sources = Sources {
            backend: self.inner.backend.clone(),
            channel: self.inner.channel.clone(),
            fallback: self.inner.fallback.clone(),
        };
        let mux = ReconciliationMultiplexer::spawn(
            session_id,
            sources,
            self.inner.settings.poll_interval,
            self.inner.settings.fallback_read_interval,
            cancel.child_token(),
        );
        let deadline = Instant::now() + self.inner.settings.session_timeout;

        let this = self.clone();
        tokio::spawn(async move {
            this.watch(attempt, mux, deadline, cancel).await;
        });
    }

    async fn watch(
        self,
        attempt: u64,
        mut mux: ReconciliationMultiplexer,
        deadline: Instant,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    self.expire(attempt).await;
                    break;
                }
                event = mux.next() => match event {
                    Some(event) => {
                        if self.apply_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        mux.shutdown();
    }

    /// Apply one proposed delivery. Returns `true` once the session has its result.
    async fn apply_event(&self, event: ChannelEvent) -> bool {
        let channel = event.channel;
        let session_id = event.session_id.clone();

        let mut session = self.inner.store.lock().await;
        match ReconciliationMultiplexer::admit(&mut session, &event) {
            Admission::Apply => {}
            Admission::Duplicate => {
                tracing::debug!(%session_id, ?channel, "duplicate delivery discarded");
                return false;
            }
            Admission::Stale => {
                tracing::debug!(%session_id, ?channel, "delivery for inactive session discarded");
                return false;
            }
        }
        tracing::info!(%session_id, ?channel, "session result received");
        let attempt = session.attempt;

        let outcome = match event.outcome {
            ChannelOutcome::Denied(message) => {
                let err = ConnectError::AuthorizationDenied(message);
                session.park_failed(&err);
                Err(err)
            }
            ChannelOutcome::Ready(payload) => {
                session.resources = payload.resources;
                session.external_identity = payload.external_identity;
                session.state = SessionState::PagesReady;
                match self.inner.selector.plan(&session.resources) {
                    SelectionPlan::Empty => {
                        let err = ConnectError::NoEligibleResources;
                        session.park_failed(&err);
                        Err(err)
                    }
                    plan => Ok((plan, session.resources.len())),
                }
            }
        };
        drop(session);

        self.close_window().await;
        self.discard_fallback(&session_id);

        match outcome {
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "authorization did not produce resources");
                self.emit_failure(&err);
            }
            Ok((plan, count)) => {
                broadcast_event(
                    &self.inner.events,
                    ConnectEvent::ResourcesReady {
                        session_id: session_id.clone(),
                        count,
                        channel,
                    },
                );
                if let SelectionPlan::AutoSelect { resource, after } = plan {
                    self.schedule_auto_select(attempt, resource, after);
                }
            }
        }
        true
    }

    fn schedule_auto_select(&self, attempt: u64, resource: ConnectableResource, after: std::time::Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut session = this.inner.store.lock().await;
            if session.attempt != attempt
                || session.state != SessionState::PagesReady
                || session.selected_resource.is_some()
            {
                tracing::debug!(attempt, "auto-select skipped, session moved on");
                return;
            }
            let session_id = session.session_id.clone().unwrap_or_default();
            let external_id = resource.external_id.clone();
            select_locked(&mut session, resource);
            drop(session);

            tracing::debug!(%session_id, %external_id, "single resource auto-selected");
            broadcast_event(
                &this.inner.events,
                ConnectEvent::ResourceSelected {
                    session_id,
                    external_id,
                    automatic: true,
                },
            );
        });
    }

    async fn expire(&self, attempt: u64) {
        let err = ConnectError::AuthorizationTimeout {
            timeout_secs: self.inner.settings.session_timeout.as_secs(),
        };
        let session_id = {
            let mut session = self.inner.store.lock().await;
            if session.attempt != attempt || session.state != SessionState::AwaitingAuthorization {
                return;
            }
            let session_id = session.session_id.clone();
            session.park_failed(&err);
            session_id
        };

        tracing::warn!(session_id = ?session_id, "authorization timed out");
        self.close_window().await;
        if let Some(id) = &session_id {
            self.discard_fallback(id);
        }
        self.emit_failure(&err);
    }

    /// Close the authorization window if this coordinator opened one.
    async fn close_window(&self) {
        if self.inner.window_open.swap(false, Ordering::SeqCst)
            && let Err(e) = self.inner.channel.close().await
        {
            tracing::warn!(error = %e, "failed to close authorization window");
        }
    }

    fn record_pending(&self, pending: PendingSession) {
        if let Some(cache) = &self.inner.fallback
            && let Err(e) = cache.record_pending(&pending)
        {
            tracing::warn!(session_id = %pending.session_id, error = %e, "failed to record pending session");
        }
    }

    fn discard_fallback(&self, session_id: &str) {
        if let Some(cache) = &self.inner.fallback
            && let Err(e) = cache.delete(session_id)
        {
            tracing::warn!(%session_id, error = %e, "failed to delete fallback entry");
        }
    }

    fn emit_failure(&self, err: &ConnectError) {
        broadcast_event(
            &self.inner.events,
            ConnectEvent::SessionFailed {
                kind: err.kind(),
                message: err.to_string(),
            },
        );
    }
}

fn select_locked(session: &mut OrchestrationSession, resource: ConnectableResource) {
    session.selected_resource = Some(resource);
    session.state = SessionState::Configuring;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::errors::ChannelError;
    use async_trait::async_trait;

    struct NullChannel {
        tx: broadcast::Sender<serde_json::Value>,
    }

    #[async_trait]
    impl ExternalAuthorizationChannel for NullChannel {
        async fn open(&self, _url: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
            self.tx.subscribe()
        }

        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn coordinator() -> Coordinator {
        let (tx, _) = broadcast::channel(8);
        Coordinator::new(
            Arc::new(InMemoryBackend::new("t1")),
            Arc::new(NullChannel { tx }),
            None,
            "t1",
            OrchestratorSettings::default(),
        )
    }

    #[tokio::test]
    async fn transitions_from_idle_are_stale() {
        let coordinator = coordinator();

        let err = coordinator.select_resource("p1").await.unwrap_err();
        assert!(err.is_silent());
        let err = coordinator.finalize(None).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::StaleTransition {
                actual: SessionState::Idle,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancel_when_idle_is_quiet() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe_events();

        coordinator.cancel().await;
        coordinator.cancel().await;

        assert_eq!(coordinator.snapshot().await.state, SessionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_issues_session_and_waits() {
        let coordinator = coordinator();
        let snapshot = coordinator.start(Platform::Telegram).await.unwrap();

        assert_eq!(snapshot.state, SessionState::AwaitingAuthorization);
        assert_eq!(snapshot.session_id.as_deref(), Some("session-1"));
        let created = snapshot.created_at.unwrap();
        assert_eq!((snapshot.expires_at.unwrap() - created).num_seconds(), 300);

        coordinator.cancel().await;
    }

    #[tokio::test]
    async fn repair_of_unknown_account_fails() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.start_repair(77).await,
            Err(ConnectError::AccountNotFound { id: 77 })
        ));
        assert_eq!(coordinator.snapshot().await.state, SessionState::Idle);
    }
}
