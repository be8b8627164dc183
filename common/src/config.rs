use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    topics::DEFAULT_SITE,
    types::{ControlFlags, OperatingMode, RelayState},
};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("site prefix must not be empty")]
    EmptySite,
    #[error("latitude {0} is outside -90..=90")]
    InvalidLatitude(f64),
    #[error("longitude {0} is outside -180..=180")]
    InvalidLongitude(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub nightly_enter_c: f32,
    pub nightly_exit_c: f32,
    pub constant_enter_c: f32,
    pub constant_exit_c: f32,
    pub tick_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub probe_read_attempts: u8,
    pub probe_retry_delay_ms: u64,
    pub alternator_half_period_min: u64,
    pub alternator_settle_secs: u64,
    pub alternator_stop_timeout_ms: u64,
    /// Minutes after midnight.
    pub solar_refresh_minutes: u16,
    pub nightly_windows: Vec<NightlyWindow>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nightly_enter_c: 0.0,
            nightly_exit_c: 1.0,
            constant_enter_c: -8.0,
            constant_exit_c: -6.0,
            tick_interval_ms: 1_000,
            heartbeat_interval_ms: 60_000,
            sample_interval_ms: 2_000,
            probe_read_attempts: 3,
            probe_retry_delay_ms: 100,
            alternator_half_period_min: 15,
            alternator_settle_secs: 3,
            alternator_stop_timeout_ms: 5_000,
            solar_refresh_minutes: 30,
            nightly_windows: vec![
                NightlyWindow {
                    bubbler: BubblerSlot::A,
                    start_minutes: 3 * 60,
                    stop_minutes: 4 * 60 + 55,
                },
                NightlyWindow {
                    bubbler: BubblerSlot::B,
                    start_minutes: 5 * 60,
                    stop_minutes: 6 * 60 + 55,
                },
            ],
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        // Each hysteresis band needs its exit above its entry.
        if self.nightly_exit_c <= self.nightly_enter_c {
            self.nightly_enter_c = defaults.nightly_enter_c;
            self.nightly_exit_c = defaults.nightly_exit_c;
        }
        if self.constant_exit_c <= self.constant_enter_c
            || self.constant_enter_c >= self.nightly_enter_c
        {
            self.constant_enter_c = defaults.constant_enter_c;
            self.constant_exit_c = defaults.constant_exit_c;
        }

        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 10_000);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(1_000, 3_600_000);
        self.sample_interval_ms = self.sample_interval_ms.clamp(500, 600_000);
        self.probe_read_attempts = self.probe_read_attempts.clamp(1, 10);
        self.probe_retry_delay_ms = self.probe_retry_delay_ms.min(5_000);
        self.alternator_half_period_min = self.alternator_half_period_min.clamp(1, 24 * 60);
        self.alternator_settle_secs = self.alternator_settle_secs.min(60);
        self.alternator_stop_timeout_ms = self.alternator_stop_timeout_ms.clamp(100, 60_000);
        if self.solar_refresh_minutes >= 24 * 60 {
            self.solar_refresh_minutes = defaults.solar_refresh_minutes;
        }

        self.nightly_windows
            .retain(|window| window.start_minutes < 24 * 60 && window.stop_minutes < 24 * 60);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BubblerSlot {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyWindow {
    pub bubbler: BubblerSlot,
    #[serde(rename = "startMinutes")]
    pub start_minutes: u16,
    #[serde(rename = "stopMinutes")]
    pub stop_minutes: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub site: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site: DEFAULT_SITE.to_string(),
            latitude: 45.08608,
            longitude: -79.552073,
            timezone: "America/Toronto".to_string(),
        }
    }
}

impl SiteConfig {
    pub fn validate(&self) -> Result<Tz, ConfigError> {
        if self.site.trim_matches('/').trim().is_empty() {
            return Err(ConfigError::EmptySite);
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ConfigError::InvalidLatitude(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ConfigError::InvalidLongitude(self.longitude));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
    pub mqtt_keep_alive_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "bubbler-controller".to_string(),
            mqtt_keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    Sysfs,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPins {
    pub backend: RelayBackend,
    pub gpio_root: String,
    pub bubbler_a_pin: u32,
    pub bubbler_b_pin: u32,
    pub danger_pin: u32,
    pub danger_active_low: bool,
}

impl Default for RelayPins {
    fn default() -> Self {
        Self {
            backend: RelayBackend::Simulated,
            gpio_root: "/sys/class/gpio".to_string(),
            bubbler_a_pin: 5,
            bubbler_b_pin: 6,
            danger_pin: 26,
            danger_active_low: true,
        }
    }
}

/// Which discovered 1-Wire device (sorted by id) serves each role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeAssignment {
    pub w1_base_dir: String,
    pub air: Option<usize>,
    pub water: Option<usize>,
    pub enclosure: Option<usize>,
}

impl Default for ProbeAssignment {
    fn default() -> Self {
        Self {
            w1_base_dir: "/sys/bus/w1/devices".to_string(),
            air: Some(0),
            water: None,
            enclosure: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub relays: RelayPins,
    pub probes: ProbeAssignment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub site: SiteConfig,
    pub network: NetworkConfig,
    pub hardware: HardwareConfig,
}

/// Point-in-time mirror of flags, mode and relays, stored as a flat
/// key-value record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    #[serde(rename = "mainkey", with = "flag")]
    pub master: bool,
    #[serde(rename = "statekey", with = "mode_index")]
    pub mode: OperatingMode,
    #[serde(rename = "autokey", with = "flag")]
    pub auto_bubble: bool,
    #[serde(rename = "b1key", with = "flag")]
    pub bubbler_a: bool,
    #[serde(rename = "b2key", with = "flag")]
    pub bubbler_b: bool,
    #[serde(rename = "b3key", with = "flag", default)]
    pub reserved: bool,
    #[serde(rename = "dangerkey", with = "flag")]
    pub danger_light: bool,
}

impl PersistedSnapshot {
    pub fn new(flags: ControlFlags, mode: OperatingMode, relays: RelayState) -> Self {
        Self {
            master: flags.master,
            mode,
            auto_bubble: flags.auto_bubble,
            bubbler_a: relays.bubbler_a,
            bubbler_b: relays.bubbler_b,
            reserved: false,
            danger_light: relays.danger_light,
        }
    }

    /// Only the flags are trusted on startup; mode and relays are informational.
    pub fn trusted_flags(&self) -> ControlFlags {
        ControlFlags {
            master: self.master,
            auto_bubble: self.auto_bubble && self.master,
        }
    }
}

mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

mod mode_index {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::types::OperatingMode;

    pub fn serialize<S: Serializer>(
        value: &OperatingMode,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(value.index())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OperatingMode, D::Error> {
        let index = u8::deserialize(deserializer)?;
        OperatingMode::from_index(index)
            .ok_or_else(|| D::Error::custom(format!("unknown state index {index}")))
    }
}
