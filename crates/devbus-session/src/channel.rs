//! Driver loop tying a message bus endpoint to a session manager
//!
//! A [`MessageChannel`] is the single task that reads frames off the bus,
//! routes them through its [`SessionManager`] and ticks every session.
//! Application tasks use sessions concurrently while it runs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use devbus_core::{ManagerConfig, ManagerError, MessageBus};

use crate::manager::SessionManager;

/// Owns the read/update loop for one bus endpoint
pub struct MessageChannel {
    bus: Arc<dyn MessageBus>,
    manager: Arc<SessionManager>,
}

impl MessageChannel {
    /// Create a channel with a fresh manager bound to `bus`
    pub fn new(bus: Arc<dyn MessageBus>, config: ManagerConfig) -> Self {
        let manager = Arc::new(SessionManager::new(config));
        manager.bind(Arc::clone(&bus));
        Self { bus, manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// One pass: route inbound frames, waiting up to `timeout` for the
    /// first, then tick every session
    pub async fn update(&self, timeout: Duration) -> Result<usize, ManagerError> {
        let routed = self.manager.pump(timeout).await?;
        self.manager.update_sessions();
        Ok(routed)
    }

    /// Run until `cancel` fires or the bus goes away, then close every session
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ManagerError> {
        let interval = self.manager.config().update_interval;
        tracing::info!(
            "Message channel running as {} (update interval: {:?})",
            self.bus.client_id(),
            interval
        );

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Message channel shutting down");
                    break Ok(());
                }
                result = self.update(interval) => {
                    if let Err(e) = result {
                        tracing::warn!("Message channel stopped: {}", e);
                        break Err(e);
                    }
                    if !self.bus.is_connected() {
                        tracing::warn!("Bus disconnected");
                        break Ok(());
                    }
                }
            }
        };

        if self.bus.is_connected() {
            self.manager.shut_down_all_sessions().await;
        } else {
            self.manager.handle_transport_disconnect().await;
        }
        result
    }
}
