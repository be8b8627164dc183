use std::time::Duration;

use bubbler_common::{ControllerConfig, Relay, Switch};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::outputs::SharedOutputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternatorTiming {
    pub half_period: Duration,
    pub settle: Duration,
    pub stop_timeout: Duration,
}

impl AlternatorTiming {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            half_period: Duration::from_secs(config.alternator_half_period_min * 60),
            settle: Duration::from_secs(config.alternator_settle_secs),
            stop_timeout: Duration::from_millis(config.alternator_stop_timeout_ms),
        }
    }

    fn phases(&self) -> [(Relay, Switch, Duration); 4] {
        [
            (Relay::BubblerB, Switch::Off, self.settle),
            (Relay::BubblerA, Switch::On, self.half_period),
            (Relay::BubblerA, Switch::Off, self.settle),
            (Relay::BubblerB, Switch::On, self.half_period),
        ]
    }
}

/// Handle to the running duty cycle. Dropping it without `stop` ends the
/// task at its next wait, without waiting for it.
pub struct Alternator {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    stop_timeout: Duration,
}

impl Alternator {
    pub fn start(outputs: SharedOutputs, timing: AlternatorTiming) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        info!(
            half_period_secs = timing.half_period.as_secs(),
            "alternator started"
        );
        let task = tokio::spawn(run(outputs, timing, cancelled));
        Self {
            cancel,
            task,
            stop_timeout: timing.stop_timeout,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the task and waits for it to exit. Returns false if it did
    /// not acknowledge within the stop timeout; it is aborted then.
    pub async fn stop(mut self) -> bool {
        if self.task.is_finished() {
            return true;
        }
        let _ = self.cancel.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut self.task).await {
            Ok(_) => {
                info!("alternator stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "alternator did not stop in time; aborting"
                );
                self.task.abort();
                false
            }
        }
    }
}

async fn run(
    outputs: SharedOutputs,
    timing: AlternatorTiming,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        for (relay, desired, wait) in timing.phases() {
            if *cancelled.borrow() {
                return;
            }
            let changed = outputs.lock().await.set(relay, desired);
            debug!(?relay, ?desired, changed, "alternator phase");
            if !pause(&mut cancelled, wait).await {
                return;
            }
        }
    }
}

/// False once cancellation is requested or the handle is gone.
async fn pause(cancelled: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        _ = sleep(wait) => true,
        _ = cancelled.wait_for(|stop| *stop) => false,
    }
}
