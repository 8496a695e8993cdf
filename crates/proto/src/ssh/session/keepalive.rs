//! Keepalive heartbeat.
//!
//! A background task periodically issues `keepalive@openssh.com` global
//! requests with `want_reply` set. Any reply, success or failure, proves
//! the peer is alive; a send failure or an unanswered request tears the
//! transport down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skiff_platform::SkiffResult;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Keepalive task handle.
pub struct KeepaliveTask {
    /// Probe interval.
    interval: Duration,
    /// Stop signal.
    stop_signal: Arc<AtomicBool>,
    /// Task handle.
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a keepalive task (but does not start it).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Starts the task.
    ///
    /// `probe` sends one keepalive round trip; an error stops the task.
    pub fn start<F, Fut>(&mut self, probe: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SkiffResult<()>> + Send + 'static,
    {
        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!(?interval, "keepalive task started");

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                match probe().await {
                    Ok(()) => debug!("keepalive acknowledged"),
                    Err(e) => {
                        warn!(error = %e, "keepalive failed, stopping");
                        break;
                    }
                }
            }

            debug!("keepalive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_platform::SkiffError;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_keepalive_task_creation() {
        let task = KeepaliveTask::new(Duration::from_secs(60));
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_keepalive_task_lifecycle() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut task = KeepaliveTask::new(Duration::from_millis(50));
        task.start(move || {
            let counter = Arc::clone(&counter_clone);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(180)).await;
        task.stop();

        let count = counter.load(Ordering::Relaxed);
        assert!(count >= 2, "expected at least 2 probes, got {}", count);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_keepalive_task_stops_on_error() {
        let mut task = KeepaliveTask::new(Duration::from_millis(30));
        task.start(|| async { Err(SkiffError::ConnectionLost) });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!task.is_running());
    }
}
