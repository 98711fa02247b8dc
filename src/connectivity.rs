//! Online/offline signal and the reconnect trigger.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::SyncEngine;

/// Shared connectivity flag with change notification.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Connectivity { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; subscribers are only woken on an actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Flush the pending queue every time connectivity goes from offline to online.
///
/// The task ends when every `Connectivity` handle has been dropped.
pub fn spawn_reconnect_flush(engine: Arc<SyncEngine>, connectivity: &Connectivity) -> JoinHandle<()> {
    let mut rx = connectivity.subscribe();
    tokio::spawn(async move {
        let mut was_online = *rx.borrow_and_update();
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if online && !was_online {
                debug!("Back online, flushing pending actions");
                match engine.flush_queue().await {
                    Ok(report) => info!(applied = report.applied, remaining = report.remaining, "Reconnect flush finished"),
                    Err(e) => warn!(error = %e, "Reconnect flush failed"),
                }
            }
            was_online = online;
        }
    })
}
