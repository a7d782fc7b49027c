//! Server-wide termination signal.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Cloneable handle to the server-wide termination signal. Triggered by an
/// operator request or by any fatal fault; every long-running loop holds a
/// receiver from `subscribe()`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx_term: Arc<watch::Sender<bool>>,
    reason: Arc<Mutex<Option<String>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx_term, _) = watch::channel(false);
        ShutdownSignal {
            tx_term: Arc::new(tx_term),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Triggers the signal. Only the first reason is kept.
    pub fn trigger(&self, reason: impl ToString) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.tx_term.send_replace(true);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.tx_term.borrow()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx_term.subscribe()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx_term = self.subscribe();
        // sender lives as long as `self`, so this only ends on trigger
        let _ = rx_term.wait_for(|term| *term).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
