//! Graceful Shutdown Module
//!
//! Turns SIGINT/SIGTERM into a drain of the lifecycle controller, bounded by
//! a deadline. Also provides the stop signal the serving engine's accept loop
//! listens on.

use crate::lifecycle::{ControllerHandle, NodeState};
use crate::{NodeError, Result};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};

/// Drives node shutdown from process signals.
pub struct ShutdownCoordinator {
    controller: ControllerHandle,
    deadline: Duration,
}

impl ShutdownCoordinator {
    /// # Arguments
    /// * `deadline` - Upper bound on deregistration, drain and cache close
    pub fn new(controller: ControllerHandle, deadline: Duration) -> Self {
        Self {
            controller,
            deadline,
        }
    }

    /// Wait for SIGINT or SIGTERM, then drain the node.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|e| NodeError::SystemError(format!("SIGINT handler: {}", e)))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| NodeError::SystemError(format!("SIGTERM handler: {}", e)))?;

        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!("{} received, draining node", received);

        self.initiate_shutdown().await
    }

    /// Ask the controller to drain and stop, waiting at most the deadline.
    pub async fn initiate_shutdown(&self) -> Result<()> {
        if self.controller.state() == NodeState::Stopped {
            info!("Node already stopped");
            return Ok(());
        }

        let drained = tokio::time::timeout(self.deadline, self.controller.shutdown()).await;
        match drained {
            Ok(result) => {
                if let Err(e) = &result {
                    error!("Node shutdown failed: {}", e);
                }
                result
            }
            Err(_) => {
                error!("Node did not stop within {:?}", self.deadline);
                Err(NodeError::TimeoutError(format!(
                    "node still {:?} after {:?}",
                    self.controller.state(),
                    self.deadline
                )))
            }
        }
    }
}

/// One-shot stop notification for a serving task.
pub struct StopSignal {
    receiver: broadcast::Receiver<()>,
}

impl StopSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Resolve once a stop was sent or the sender is gone.
    pub async fn stopped(&mut self) {
        let _ = self.receiver.recv().await;
    }
}
