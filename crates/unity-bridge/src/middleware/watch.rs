//! Background task that notices when instances change their enabled tools.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{InstanceRoutingMiddleware, ToolSignature};

/// Handle to the running watch task. Dropping it leaves the task running;
/// call [`shutdown`](Self::shutdown) to stop it and wait for it to drain.
pub struct ToolWatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ToolWatch {
    pub fn spawn(middleware: Arc<InstanceRoutingMiddleware>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<ToolSignature> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let signature = middleware.tool_signature().await;
                if let Some(previous) = &last
                    && *previous != signature
                {
                    tracing::info!(
                        instances = signature.len(),
                        "Enabled tools changed; notifying sessions"
                    );
                    middleware.invalidate_visibility();
                    middleware.notify_tools_changed().await;
                }
                last = Some(signature);
            }
            tracing::debug!("Tool watch stopped");
        });

        tracing::debug!(period_ms = period.as_millis() as u64, "Tool watch started");
        Self { cancel, handle }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Tool watch task failed");
        }
    }
}
