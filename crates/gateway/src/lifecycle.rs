//! Lifecycle controller: owns the shutdown sequencing the rest of the
//! gateway depends on, and the `CancellationToken` every long-lived task
//! watches to know when to stop accepting work.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wsgate_protocol::CloseReason;

use crate::registry::ConnectionRegistry;

/// Coordinates graceful shutdown: flips off inbound acceptance, broadcasts
/// a soft-close to every session, waits up to `deadline` for the registry
/// to drain, then force-closes whatever remains.
pub struct LifecycleController {
    shutdown: CancellationToken,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cloned into every accept loop, session task, and bus
    /// subscription so they can observe shutdown without polling.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs the full shutdown sequence: stop accepting (via the shared
    /// token), soft-close every session, wait for drain, force-close
    /// stragglers past the deadline.
    pub async fn shutdown(&self, registry: &ConnectionRegistry, deadline: Duration) {
        info!("lifecycle: beginning graceful shutdown");
        self.shutdown.cancel();

        let handles = registry.all_handles().await;
        info!(sessions = handles.len(), "lifecycle: broadcasting soft-close");
        for handle in &handles {
            handle.try_close(CloseReason::ServerShutdown);
        }

        if tokio::time::timeout(deadline, wait_for_drain(registry))
            .await
            .is_err()
        {
            let remaining = registry.all_handles().await;
            warn!(
                deadline_secs = deadline.as_secs(),
                remaining = remaining.len(),
                "lifecycle: shutdown deadline exceeded, forcing remaining sessions closed"
            );
            for handle in &remaining {
                handle.try_close(CloseReason::ServerShutdown);
            }
        } else {
            info!("lifecycle: all sessions drained cleanly");
        }
    }
}

async fn wait_for_drain(registry: &ConnectionRegistry) {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        if registry.global_connections() == 0 {
            return;
        }
        interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_cancels_token_immediately() {
        let controller = LifecycleController::new();
        let registry = ConnectionRegistry::new(1);
        let token = controller.token();
        assert!(!token.is_cancelled());
        controller.shutdown(&registry, Duration::from_millis(50)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_with_no_sessions_returns_before_deadline() {
        let controller = LifecycleController::new();
        let registry = ConnectionRegistry::new(1);
        let start = tokio::time::Instant::now();
        controller.shutdown(&registry, Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
