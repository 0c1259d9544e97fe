//! Periodic expiry sweep task, grounded on the teacher's
//! `RegistrationManager` start/stop task-handle idiom.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::registrar::{Registrar, DEFAULT_SWEEP_INTERVAL};

pub struct ExpirySweeper {
    registrar: Arc<Registrar>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl ExpirySweeper {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        ExpirySweeper { registrar, handle: RwLock::new(None) }
    }

    pub async fn start(&self) {
        self.start_with_interval(DEFAULT_SWEEP_INTERVAL).await;
    }

    pub async fn start_with_interval(&self, period: std::time::Duration) {
        let mut slot = self.handle.write().await;
        if slot.is_some() {
            return;
        }
        let registrar = self.registrar.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let expired = registrar.sweep_expired();
                if !expired.is_empty() {
                    info!(count = expired.len(), "reaped expired registrations");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.write().await.take() {
            handle.abort();
        }
    }
}
