//! System-browser authorization window with a loopback completion listener.
//!
//! `open()` launches the authorization URL in the user's browser and makes
//! sure a small HTTP listener is running on localhost. When the provider flow
//! finishes, the landing page (or the backend on its behalf) posts the
//! completion message to `POST {callback_url}/complete`. The listener relays
//! it to subscribers and also leaves a fallback cache entry, so a message that
//! no subscriber was around to see can still be recovered.
//!
//! ## Endpoints
//!
//! | Method | Path        | Purpose                                 |
//! |--------|-------------|-----------------------------------------|
//! | GET    | `/health`   | Liveness check, returns `ok`            |
//! | POST   | `/complete` | Window completion message (JSON)        |

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, oneshot};

use super::{ExternalAuthorizationChannel, WindowMessage};
use crate::errors::ChannelError;
use crate::fallback::FallbackCache;

const MESSAGE_BUFFER: usize = 64;

/// Opens a URL in a window. The default launcher uses the system browser.
pub type Launcher = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// State shared with the HTTP handlers.
pub(crate) struct ListenerState {
    tx: broadcast::Sender<serde_json::Value>,
    fallback: Option<FallbackCache>,
}

struct RunningListener {
    shutdown_tx: oneshot::Sender<()>,
    addr: SocketAddr,
}

pub struct LoopbackChannel {
    state: Arc<ListenerState>,
    listener: Mutex<Option<RunningListener>>,
    port: u16,
    launcher: Launcher,
    window_open: AtomicBool,
}

impl LoopbackChannel {
    /// `port = 0` binds a dynamic port.
    pub fn new(port: u16, fallback: Option<FallbackCache>) -> Self {
        let launcher: Launcher = Arc::new(|url: &str| open::that(url));
        Self::with_launcher(port, fallback, launcher)
    }

    pub fn with_launcher(port: u16, fallback: Option<FallbackCache>, launcher: Launcher) -> Self {
        let (tx, _rx) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            state: Arc::new(ListenerState { tx, fallback }),
            listener: Mutex::new(None),
            port,
            launcher,
            window_open: AtomicBool::new(false),
        }
    }

    /// Start the listener if needed and return its base URL.
    pub async fn start(&self) -> Result<String, ChannelError> {
        let mut running = self.listener.lock().await;
        if let Some(listener) = running.as_ref() {
            return Ok(format!("http://{}", listener.addr));
        }

        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(ChannelError::Server)?;
        let addr = listener.local_addr().map_err(ChannelError::Server)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = build_router(self.state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "loopback listener stopped");
            }
        });

        tracing::debug!(%addr, "loopback listener started");
        *running = Some(RunningListener { shutdown_tx, addr });
        Ok(format!("http://{}", addr))
    }

    /// Stop the listener. Safe to call when it isn't running.
    pub async fn stop(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            let _ = listener.shutdown_tx.send(());
            tracing::debug!(addr = %listener.addr, "loopback listener stopped");
        }
    }

    pub async fn callback_url(&self) -> Option<String> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|l| format!("http://{}", l.addr))
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalAuthorizationChannel for LoopbackChannel {
    async fn open(&self, url: &str) -> Result<(), ChannelError> {
        self.start().await?;

        let launcher = self.launcher.clone();
        let target = url.to_string();
        let launched = tokio::task::spawn_blocking(move || launcher(&target))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|r| r);

        match launched {
            Ok(()) => {
                self.window_open.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(ChannelError::PopupBlocked {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.state.tx.subscribe()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.window_open.swap(false, Ordering::SeqCst) {
            self.stop().await;
        }
        Ok(())
    }
}

fn build_router(state: Arc<ListenerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/complete", post(complete_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Relay a completion message. Unrecognized JSON is accepted and dropped.
async fn complete_handler(
    State(state): State<Arc<ListenerState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let Some(message) = WindowMessage::parse(&body) else {
        tracing::debug!("ignoring unrecognized completion message");
        return StatusCode::ACCEPTED;
    };

    if let Some(cache) = &state.fallback
        && let Err(e) = cache.write(&message.to_fallback_entry())
    {
        tracing::warn!(session_id = message.session_id(), error = %e, "failed to write fallback entry");
    }

    // No subscribers is fine; the fallback entry covers it.
    let _ = state.tx.send(body);
    StatusCode::ACCEPTED
}
