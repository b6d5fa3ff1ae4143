//! Background polling of volatile parameters.
//!
//! One tokio task per polled device re-reads every volatile parameter with
//! `max_age = 0` each `pollinterval` seconds, purely to keep the cache warm.
//! Failures are logged and the loop continues. Ticks are skipped while the
//! session simulates; a `null` poll interval ends the task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Level};

use crate::device::Device;
use crate::mode::ModeContext;

/// Interval used when the device has no `pollinterval` parameter.
const DEFAULT_INTERVAL_SECS: f64 = 5.0;

/// Stops the poller when dropped.
pub struct PollerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop polling and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "poller task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn spawn(device: Arc<Device>, mode: ModeContext) -> PollerHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        debug!(device = %device.name(), "poller started");
        loop {
            let interval = match poll_interval(&device) {
                Some(secs) => Duration::from_secs_f64(secs),
                None => {
                    debug!(device = %device.name(), "polling disabled, poller exits");
                    break;
                }
            };
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if mode.current().is_simulation() {
                continue;
            }
            poll_once(&device).await;
        }
        debug!(device = %device.name(), "poller stopped");
    });
    PollerHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}

fn poll_interval(device: &Device) -> Option<f64> {
    if device.device_type().param("pollinterval").is_none() {
        return Some(DEFAULT_INTERVAL_SECS);
    }
    device
        .local("pollinterval")
        .and_then(|v| v.as_f64())
        .filter(|secs| *secs > 0.0)
}

async fn poll_once(device: &Arc<Device>) {
    for spec in device.device_type().params().iter().filter(|p| p.volatile) {
        if let Err(e) = device.get(&spec.name, Some(0.0)).await {
            if device.log_enabled(Level::WARN) {
                warn!(device = %device.name(), param = %spec.name, error = %e, "error polling parameter");
            }
        }
    }
}
