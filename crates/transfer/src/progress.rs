use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::manager::TransferManager;
use crate::types::TransferProgress;

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Polls a [`TransferManager`] and notifies callbacks periodically.
///
/// Only transfers that are still running or waiting are reported; finished
/// and cancelled ones are announced through the manager's events instead.
pub struct ProgressTracker {
    manager: Arc<TransferManager>,
    callbacks: Arc<RwLock<Vec<ProgressCallback>>>,
    interval: Duration,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl ProgressTracker {
    /// Creates a new tracker.
    ///
    /// If `interval` is `None`, the manager's configured interval is used.
    pub fn new(manager: Arc<TransferManager>, interval: Option<Duration>) -> Self {
        let interval = interval.unwrap_or_else(|| manager.config().progress_interval());
        Self {
            manager,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            interval,
            stop: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.callbacks.write().unwrap().push(callback);
    }

    /// Reports every live transfer once, immediately.
    pub fn notify_now(&self) {
        notify(&self.manager, &self.callbacks);
    }

    /// Starts periodic notifications in a background tokio task.
    ///
    /// Calling it again replaces the running task. Call [`stop`](Self::stop)
    /// to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            drop(stop.take());
            *stop = Some(tx);
        }

        let manager = Arc::clone(&self.manager);
        let callbacks = Arc::clone(&self.callbacks);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            debug!(?interval, "progress tracker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => notify(&manager, &callbacks),
                    _ = &mut rx => break,
                }
            }
            debug!("progress tracker stopped");
        });
    }

    /// Stops the periodic notification task.
    pub fn stop(&self) {
        // Dropping the sender ends the task.
        drop(self.stop.lock().unwrap().take());
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().unwrap().is_some()
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn notify(manager: &TransferManager, callbacks: &RwLock<Vec<ProgressCallback>>) {
    let callbacks = callbacks.read().unwrap();
    if callbacks.is_empty() {
        return;
    }
    for progress in manager.snapshot() {
        if progress.state.is_terminal() {
            continue;
        }
        for cb in callbacks.iter() {
            cb(progress.clone());
        }
    }
}
