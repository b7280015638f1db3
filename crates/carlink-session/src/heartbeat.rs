//! Heartbeat monitors
//!
//! One task per session covers both directions: it asks the handler to send
//! a HEARTBEAT every `interval`, and reports a timeout once the peer has
//! been silent for `timeout`. Any peer activity pushes the deadline out.
//! A timeout is reported once and ends the task.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::HeartbeatConfig;

/// Receives monitor callbacks
#[async_trait]
pub trait HeartbeatHandler: Send + Sync {
    /// Outgoing interval elapsed
    async fn send_heartbeat(&self);

    /// Peer silent for longer than the timeout
    async fn heartbeat_timed_out(&self);
}

/// Running heartbeat task. Dropping the monitor stops it.
pub struct HeartbeatMonitor {
    activity: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start monitoring. The handler is held weakly so the monitor never
    /// keeps a session alive.
    pub fn start(config: &HeartbeatConfig, handler: Weak<dyn HeartbeatHandler>) -> Self {
        let activity = Arc::new(Notify::new());
        let interval = config.interval;
        let timeout = config.timeout;
        let notified = Arc::clone(&activity);

        let task = tokio::spawn(async move {
            let mut next_send = Instant::now() + interval;
            let mut deadline = Instant::now() + timeout;

            loop {
                tokio::select! {
                    _ = notified.notified() => {
                        deadline = Instant::now() + timeout;
                    }
                    _ = sleep_until(next_send) => {
                        next_send += interval;
                        let Some(handler) = handler.upgrade() else { break };
                        debug!("Heartbeat interval elapsed");
                        handler.send_heartbeat().await;
                    }
                    _ = sleep_until(deadline) => {
                        if let Some(handler) = handler.upgrade() {
                            warn!("Heartbeat timed out after {:?}", timeout);
                            handler.heartbeat_timed_out().await;
                        }
                        break;
                    }
                }
            }
        });

        Self { activity, task }
    }

    /// Peer traffic seen; restart the timeout
    pub fn notify_activity(&self) {
        self.activity.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
