use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use bubbler_common::{
    config::ProbeAssignment, ControllerConfig, ProbeRole, TemperatureSnapshot,
};
use chrono::Utc;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

/// DS18B20 measurement range.
const MIN_VALID_C: f32 = -55.0;
const MAX_VALID_C: f32 = 125.0;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no probe at index {0}")]
    Missing(usize),
    #[error("probe {index}: {source}")]
    Io {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("probe {0} failed its CRC check")]
    Crc(usize),
    #[error("probe {0} returned malformed data")]
    Malformed(usize),
    #[error("probe {index} reported out-of-range {value_c} C")]
    OutOfRange { index: usize, value_c: f32 },
}

/// A set of temperature probes addressed by index.
pub trait ProbeBus: Send + 'static {
    fn probe_count(&self) -> usize;
    fn read(&mut self, index: usize) -> impl Future<Output = Result<f32, ProbeError>> + Send;
}

/// DS18B20 probes exposed by the kernel 1-Wire driver.
#[derive(Debug, Clone, Default)]
pub struct W1Bus {
    devices: Vec<PathBuf>,
}

impl W1Bus {
    /// Lists `28-*` devices under `base_dir`, sorted by id.
    pub async fn discover(base_dir: &Path) -> std::io::Result<Self> {
        let mut entries = tokio::fs::read_dir(base_dir).await?;
        let mut devices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("28-") {
                devices.push(entry.path().join("w1_slave"));
            }
        }
        devices.sort();
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[PathBuf] {
        &self.devices
    }
}

impl ProbeBus for W1Bus {
    fn probe_count(&self) -> usize {
        self.devices.len()
    }

    fn read(&mut self, index: usize) -> impl Future<Output = Result<f32, ProbeError>> + Send {
        let path = self.devices.get(index).cloned();
        async move {
            let path = path.ok_or(ProbeError::Missing(index))?;
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ProbeError::Io { index, source })?;
            parse_w1_slave(index, &raw)
        }
    }
}

/// Parses the two-line `w1_slave` format:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(index: usize, raw: &str) -> Result<f32, ProbeError> {
    let mut lines = raw.lines();
    let crc_line = lines.next().ok_or(ProbeError::Malformed(index))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(ProbeError::Crc(index));
    }

    let data_line = lines.next().ok_or(ProbeError::Malformed(index))?;
    let (_, milli) = data_line
        .split_once(" t=")
        .ok_or(ProbeError::Malformed(index))?;
    let milli: i32 = milli
        .trim()
        .parse()
        .map_err(|_| ProbeError::Malformed(index))?;

    let value_c = milli as f32 / 1000.0;
    if !(MIN_VALID_C..=MAX_VALID_C).contains(&value_c) {
        return Err(ProbeError::OutOfRange { index, value_c });
    }
    Ok(value_c)
}

/// Up to `attempts` reads with `delay` between them; the last error is
/// returned when all fail.
pub async fn read_with_retry<B: ProbeBus>(
    bus: &mut B,
    index: usize,
    attempts: u8,
    delay: Duration,
) -> Result<f32, ProbeError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match bus.read(index).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(index, attempt, "probe read failed, retrying: {err}");
                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

pub struct Sampler<B> {
    bus: B,
    assignment: ProbeAssignment,
    attempts: u8,
    retry_delay: Duration,
    interval: Duration,
}

impl<B: ProbeBus> Sampler<B> {
    pub fn new(bus: B, assignment: ProbeAssignment, config: &ControllerConfig) -> Self {
        Self {
            bus,
            assignment,
            attempts: config.probe_read_attempts,
            retry_delay: Duration::from_millis(config.probe_retry_delay_ms),
            interval: Duration::from_millis(config.sample_interval_ms),
        }
    }

    fn probe_for(&self, role: ProbeRole) -> Option<usize> {
        match role {
            ProbeRole::Air => self.assignment.air,
            ProbeRole::Water => self.assignment.water,
            ProbeRole::Enclosure => self.assignment.enclosure,
        }
    }

    /// Reads every assigned probe once.
    pub async fn sweep(&mut self) -> TemperatureSnapshot {
        let mut snapshot = TemperatureSnapshot::unavailable(Utc::now());
        for role in [ProbeRole::Air, ProbeRole::Water, ProbeRole::Enclosure] {
            let Some(index) = self.probe_for(role) else {
                continue;
            };
            let sample = snapshot.get_mut(role);
            match read_with_retry(&mut self.bus, index, self.attempts, self.retry_delay).await {
                Ok(value) => sample.value_c = Some(value),
                Err(err) => debug!(role = role.as_str(), "probe unavailable this sweep: {err}"),
            }
            sample.observed_at = Utc::now();
        }
        snapshot
    }

    /// Publishes a fresh snapshot every interval until every receiver is gone.
    pub async fn run(mut self, snapshots: watch::Sender<TemperatureSnapshot>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = self.sweep().await;
            if snapshots.send(snapshot).is_err() {
                warn!("no temperature consumers left; sampler exiting");
                return;
            }
        }
    }
}

pub fn spawn_sampler<B: ProbeBus>(
    sampler: Sampler<B>,
    snapshots: watch::Sender<TemperatureSnapshot>,
) -> JoinHandle<()> {
    info!(probes = sampler.bus.probe_count(), "temperature sampler started");
    tokio::spawn(sampler.run(snapshots))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use pretty_assertions::assert_eq;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=-8500\n";
    const BAD_CRC: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n\
                           72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    /// Plays back scripted results per probe index.
    #[derive(Default)]
    struct ScriptedBus {
        scripts: Vec<VecDeque<Result<f32, ()>>>,
        reads: Vec<usize>,
    }

    impl ProbeBus for ScriptedBus {
        fn probe_count(&self) -> usize {
            self.scripts.len()
        }

        fn read(&mut self, index: usize) -> impl Future<Output = Result<f32, ProbeError>> + Send {
            self.reads.push(index);
            let next = self
                .scripts
                .get_mut(index)
                .and_then(|script| script.pop_front())
                .unwrap_or(Err(()));
            async move { next.map_err(|_| ProbeError::Crc(index)) }
        }
    }

    #[test]
    fn parses_milli_degrees() {
        assert_eq!(parse_w1_slave(0, GOOD).unwrap(), -8.5);
    }

    #[test]
    fn rejects_crc_failures_and_garbage() {
        assert!(matches!(parse_w1_slave(1, BAD_CRC), Err(ProbeError::Crc(1))));
        assert!(matches!(
            parse_w1_slave(0, "xx : crc=00 YES\nxx\n"),
            Err(ProbeError::Malformed(0))
        ));
        assert!(matches!(parse_w1_slave(0, ""), Err(ProbeError::Malformed(0))));
        assert!(matches!(
            parse_w1_slave(0, "aa : crc=aa YES\naa t=150000\n"),
            Err(ProbeError::OutOfRange { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_a_read_succeeds() {
        let mut bus = ScriptedBus {
            scripts: vec![VecDeque::from([Err(()), Err(()), Ok(3.25)])],
            ..ScriptedBus::default()
        };

        let value = read_with_retry(&mut bus, 0, 3, Duration::from_millis(100)).await;

        assert_eq!(value.unwrap(), 3.25);
        assert_eq!(bus.reads, vec![0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let mut bus = ScriptedBus {
            scripts: vec![VecDeque::from([Err(()), Err(()), Err(()), Ok(1.0)])],
            ..ScriptedBus::default()
        };

        assert!(read_with_retry(&mut bus, 0, 3, Duration::from_millis(100))
            .await
            .is_err());
        assert_eq!(bus.reads.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_is_unavailable_not_stale() {
        let bus = ScriptedBus {
            scripts: vec![
                VecDeque::from([Ok(-2.0)]),
                VecDeque::from([Ok(4.0), Err(()), Err(()), Err(())]),
            ],
            ..ScriptedBus::default()
        };
        let assignment = ProbeAssignment {
            air: Some(1),
            water: Some(0),
            ..ProbeAssignment::default()
        };
        let mut sampler = Sampler::new(bus, assignment, &ControllerConfig::default());

        let first = sampler.sweep().await;
        assert_eq!(first.air.value_c, Some(4.0));
        assert_eq!(first.water.value_c, Some(-2.0));
        assert_eq!(first.enclosure.value_c, None);

        let second = sampler.sweep().await;
        assert_eq!(second.air.value_c, None);
        assert_eq!(second.water.value_c, None);
    }

    #[tokio::test]
    async fn discovers_only_temperature_probes_in_order() {
        let dir = std::env::temp_dir().join(format!("bubbler-w1-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        for name in ["28-0000b2", "w1_bus_master1", "28-0000a1"] {
            std::fs::create_dir_all(dir.join(name)).unwrap();
        }
        std::fs::write(dir.join("28-0000a1/w1_slave"), GOOD).unwrap();

        let mut bus = W1Bus::discover(&dir).await.unwrap();

        assert_eq!(bus.probe_count(), 2);
        assert!(bus.devices()[0].starts_with(dir.join("28-0000a1")));
        assert_eq!(bus.read(0).await.unwrap(), -8.5);
        assert!(matches!(bus.read(1).await, Err(ProbeError::Io { index: 1, .. })));
        assert!(matches!(bus.read(5).await, Err(ProbeError::Missing(5))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
