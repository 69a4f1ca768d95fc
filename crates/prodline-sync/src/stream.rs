//! Remote push-event subscription.
//!
//! The transport itself (SSE, WebSocket, ...) lives outside this crate. It
//! hands the adapter a channel of [`TransportSignal`]s; the adapter reflects
//! connectivity and forwards decoded messages to the [`Normalizer`].
//!
//! Reconnection is the transport's business. On error the adapter only
//! reports that a reconnect is pending.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::Normalizer;

/// Status text shown while the transport is trying to come back.
pub const RECONNECT_PENDING: &str = "Connection lost. Attempting to reconnect...";

/// What the transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Session established
    Opened,
    /// One text frame
    Message(String),
    /// Transport-level failure; the transport may recover on its own
    Error(String),
    /// Session ended by the far side
    Closed,
}

/// Connectivity as seen by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: bool,
    pub error: Option<String>,
}

struct Subscription {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Owns at most one subscription to a push-event source.
pub struct RemoteStream {
    normalizer: Normalizer,
    subscription: Arc<Mutex<Subscription>>,
    status: Arc<watch::Sender<Connectivity>>,
}

impl RemoteStream {
    pub fn new(normalizer: Normalizer) -> Self {
        let (status, _) = watch::channel(Connectivity::default());
        Self {
            normalizer,
            subscription: Arc::new(Mutex::new(Subscription {
                generation: 0,
                task: None,
            })),
            status: Arc::new(status),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscription> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch connectivity changes.
    pub fn status(&self) -> watch::Receiver<Connectivity> {
        self.status.subscribe()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.status.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().task.is_some()
    }

    /// Start consuming a transport session, replacing any current one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, mut signals: mpsc::Receiver<TransportSignal>) {
        let mut sub = self.lock();
        if let Some(task) = sub.task.take() {
            debug!("replacing existing subscription");
            task.abort();
        }
        sub.generation += 1;
        let generation = sub.generation;

        let normalizer = self.normalizer.clone();
        let status = Arc::clone(&self.status);
        let shared = Arc::clone(&self.subscription);

        sub.task = Some(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                // The check and the apply happen under the subscription lock so
                // that nothing lands after `close` has returned.
                let guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.generation != generation {
                    break;
                }
                match signal {
                    TransportSignal::Opened => {
                        info!("push stream connected");
                        status.send_replace(Connectivity {
                            connected: true,
                            error: None,
                        });
                    }
                    TransportSignal::Message(text) => {
                        normalizer.ingest_text(&text);
                    }
                    TransportSignal::Error(reason) => {
                        let err = Error::Transport(reason);
                        warn!(error = %err, "push stream error");
                        status.send_replace(Connectivity {
                            connected: false,
                            error: Some(RECONNECT_PENDING.to_string()),
                        });
                    }
                    TransportSignal::Closed => {
                        info!("push stream closed by transport");
                        status.send_modify(|c| c.connected = false);
                        break;
                    }
                }
            }
            let guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.generation == generation {
                status.send_modify(|c| c.connected = false);
            }
        }));
    }

    /// Cancel the subscription. Safe to call any number of times.
    pub fn close(&self) {
        let mut sub = self.lock();
        sub.generation += 1;
        if let Some(task) = sub.task.take() {
            task.abort();
            info!("push stream disconnected");
        }
        self.status.send_modify(|c| c.connected = false);
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.close();
    }
}
