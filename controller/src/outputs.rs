use std::sync::Arc;

use bubbler_common::{
    ControlFlags, OperatingMode, PersistedSnapshot, Relay, RelayState, Switch, Topics,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::relays::RelayDriver;

pub type SharedOutputs = Arc<Mutex<OutputController>>;

/// Fire-and-forget status publishing. Failures are logged by the implementor.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: String, retain: bool);
}

/// Receives every snapshot the output controller produces.
pub trait SnapshotSink: Send {
    fn save(&mut self, snapshot: PersistedSnapshot);
}

impl SnapshotSink for mpsc::UnboundedSender<PersistedSnapshot> {
    fn save(&mut self, snapshot: PersistedSnapshot) {
        if self.send(snapshot).is_err() {
            warn!("snapshot writer is gone; state not persisted");
        }
    }
}

/// Sole owner of the physical outputs. Keeps the two bubblers mutually
/// exclusive and mirrors every change to MQTT and the snapshot file.
pub struct OutputController {
    driver: Box<dyn RelayDriver>,
    publisher: Arc<dyn StatusPublisher>,
    snapshots: Box<dyn SnapshotSink>,
    topics: Topics,
    relays: RelayState,
    flags: ControlFlags,
    mode: OperatingMode,
}

impl OutputController {
    pub fn new(
        driver: Box<dyn RelayDriver>,
        publisher: Arc<dyn StatusPublisher>,
        snapshots: Box<dyn SnapshotSink>,
        topics: Topics,
    ) -> Self {
        Self {
            driver,
            publisher,
            snapshots,
            topics,
            relays: RelayState::default(),
            flags: ControlFlags::default(),
            mode: OperatingMode::Off,
        }
    }

    pub fn shared(self) -> SharedOutputs {
        Arc::new(Mutex::new(self))
    }

    pub fn relays(&self) -> RelayState {
        self.relays
    }

    /// De-energizes every output and announces it, regardless of what the
    /// pins were left at by a previous run.
    pub fn initialize(&mut self) {
        for relay in Relay::ALL {
            match self.driver.is_on(relay) {
                Ok(true) => info!(?relay, "output energized at startup; switching off"),
                Ok(false) => {}
                Err(err) => warn!(?relay, "relay readback failed: {err}"),
            }
            if let Err(err) = self.driver.set(relay, false) {
                warn!(?relay, "failed to de-energize output: {err}");
            }
            self.relays.set(relay, false);
            self.publisher.publish(
                &self.topics.relay_state(relay),
                Switch::Off.as_str().to_string(),
                true,
            );
        }
        self.persist();
    }

    /// Returns whether the output changed. Requests that match the current
    /// state, or that would energize both bubblers, change nothing.
    pub fn set(&mut self, relay: Relay, desired: Switch) -> bool {
        let on = desired.is_on();
        if self.relays.get(relay) == on {
            return false;
        }
        if on {
            if let Some(other) = relay.interlocked_with() {
                if self.relays.get(other) {
                    debug!(?relay, blocked_by = ?other, "interlock refused output");
                    return false;
                }
            }
        }

        if let Err(err) = self.driver.set(relay, on) {
            warn!(?relay, on, "relay driver failed: {err}");
            return false;
        }
        self.relays.set(relay, on);
        self.publisher.publish(
            &self.topics.relay_state(relay),
            desired.as_str().to_string(),
            true,
        );
        self.persist();
        true
    }

    /// Mirrors the engine's flags and mode into the snapshot and writes it.
    pub fn record_control(&mut self, flags: ControlFlags, mode: OperatingMode) {
        self.flags = flags;
        self.mode = mode;
        self.persist();
    }

    fn persist(&mut self) {
        self.snapshots
            .save(PersistedSnapshot::new(self.flags, self.mode, self.relays));
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::relays::RelayError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        pub topic: String,
        pub payload: String,
        pub retain: bool,
    }

    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        messages: StdMutex<Vec<Published>>,
    }

    impl RecordingPublisher {
        pub fn take(&self) -> Vec<Published> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }

        pub fn on_topic(&self, topic: &str) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.topic == topic)
                .map(|m| m.payload.clone())
                .collect()
        }
    }

    impl StatusPublisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: String, retain: bool) {
            self.messages.lock().unwrap().push(Published {
                topic: topic.to_string(),
                payload,
                retain,
            });
        }
    }

    /// Relay driver that records every write and asserts the interlock.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDriver {
        pub writes: Arc<StdMutex<Vec<(Relay, bool)>>>,
        pub state: Arc<StdMutex<RelayState>>,
        pub fail: Arc<StdMutex<bool>>,
    }

    impl RecordingDriver {
        pub fn writes(&self) -> Vec<(Relay, bool)> {
            self.writes.lock().unwrap().clone()
        }

        pub fn state(&self) -> RelayState {
            *self.state.lock().unwrap()
        }
    }

    impl RelayDriver for RecordingDriver {
        fn set(&mut self, relay: Relay, on: bool) -> Result<(), RelayError> {
            if *self.fail.lock().unwrap() {
                return Err(RelayError::UnexpectedValue {
                    pin: 0,
                    value: "stuck".to_string(),
                });
            }
            let mut state = self.state.lock().unwrap();
            state.set(relay, on);
            assert!(
                !(state.bubbler_a && state.bubbler_b),
                "both bubblers energized"
            );
            self.writes.lock().unwrap().push((relay, on));
            Ok(())
        }

        fn is_on(&self, relay: Relay) -> Result<bool, RelayError> {
            Ok(self.state.lock().unwrap().get(relay))
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        pub saved: Arc<StdMutex<Vec<PersistedSnapshot>>>,
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }

        pub fn last(&self) -> Option<PersistedSnapshot> {
            self.saved.lock().unwrap().last().copied()
        }
    }

    impl SnapshotSink for RecordingSink {
        fn save(&mut self, snapshot: PersistedSnapshot) {
            self.saved.lock().unwrap().push(snapshot);
        }
    }

    pub struct Rig {
        pub driver: RecordingDriver,
        pub publisher: Arc<RecordingPublisher>,
        pub sink: RecordingSink,
        pub topics: Topics,
    }

    impl Rig {
        pub fn new() -> Self {
            Self {
                driver: RecordingDriver::default(),
                publisher: Arc::new(RecordingPublisher::default()),
                sink: RecordingSink::default(),
                topics: Topics::default(),
            }
        }

        pub fn controller(&self) -> OutputController {
            OutputController::new(
                Box::new(self.driver.clone()),
                self.publisher.clone(),
                Box::new(self.sink.clone()),
                self.topics.clone(),
            )
        }
    }
}
