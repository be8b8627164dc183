use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperatingMode {
    #[default]
    Off,
    Idle,
    Nightly,
    Constant,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Idle => "Idle",
            Self::Nightly => "Nightly",
            Self::Constant => "Constant",
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Idle => 1,
            Self::Nightly => 2,
            Self::Constant => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Off),
            1 => Some(Self::Idle),
            2 => Some(Self::Nightly),
            3 => Some(Self::Constant),
            _ => None,
        }
    }
}

/// `ON`/`OFF` as carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    /// Anything other than an exact `ON` is treated as `OFF`.
    pub fn from_payload(payload: &str) -> Self {
        if payload == "ON" {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    BubblerA,
    BubblerB,
    DangerLight,
}

impl Relay {
    pub const ALL: [Relay; 3] = [Relay::BubblerA, Relay::BubblerB, Relay::DangerLight];

    /// The bubbler that must be off before this one may be energized.
    pub fn interlocked_with(self) -> Option<Relay> {
        match self {
            Self::BubblerA => Some(Self::BubblerB),
            Self::BubblerB => Some(Self::BubblerA),
            Self::DangerLight => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlFlags {
    pub master: bool,
    pub auto_bubble: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayState {
    pub bubbler_a: bool,
    pub bubbler_b: bool,
    pub danger_light: bool,
}

impl RelayState {
    pub fn get(&self, relay: Relay) -> bool {
        match relay {
            Relay::BubblerA => self.bubbler_a,
            Relay::BubblerB => self.bubbler_b,
            Relay::DangerLight => self.danger_light,
        }
    }

    pub fn set(&mut self, relay: Relay, on: bool) {
        match relay {
            Relay::BubblerA => self.bubbler_a = on,
            Relay::BubblerB => self.bubbler_b = on,
            Relay::DangerLight => self.danger_light = on,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeRole {
    Air,
    Water,
    Enclosure,
}

impl ProbeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Air => "air",
            Self::Water => "water",
            Self::Enclosure => "enclosure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    pub role: ProbeRole,
    /// `None` when the probe could not be read this sweep.
    pub value_c: Option<f32>,
    pub observed_at: DateTime<Utc>,
}

impl TemperatureSample {
    pub fn unavailable(role: ProbeRole, observed_at: DateTime<Utc>) -> Self {
        Self {
            role,
            value_c: None,
            observed_at,
        }
    }
}

/// The newest reading of every probe role from one sampler sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSnapshot {
    pub air: TemperatureSample,
    pub water: TemperatureSample,
    pub enclosure: TemperatureSample,
}

impl TemperatureSnapshot {
    pub fn unavailable(observed_at: DateTime<Utc>) -> Self {
        Self {
            air: TemperatureSample::unavailable(ProbeRole::Air, observed_at),
            water: TemperatureSample::unavailable(ProbeRole::Water, observed_at),
            enclosure: TemperatureSample::unavailable(ProbeRole::Enclosure, observed_at),
        }
    }

    pub fn get(&self, role: ProbeRole) -> &TemperatureSample {
        match role {
            ProbeRole::Air => &self.air,
            ProbeRole::Water => &self.water,
            ProbeRole::Enclosure => &self.enclosure,
        }
    }

    pub fn get_mut(&mut self, role: ProbeRole) -> &mut TemperatureSample {
        match role {
            ProbeRole::Air => &mut self.air,
            ProbeRole::Water => &mut self.water,
            ProbeRole::Enclosure => &mut self.enclosure,
        }
    }

    pub fn payload(&self) -> TemperaturesPayload {
        TemperaturesPayload {
            air_temp: self.air.value_c,
            water_temp: self.water.value_c,
            box_temp: self.enclosure.value_c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperaturesPayload {
    #[serde(rename = "airtemp")]
    pub air_temp: Option<f32>,
    #[serde(rename = "watertemp")]
    pub water_temp: Option<f32>,
    #[serde(rename = "boxtemp")]
    pub box_temp: Option<f32>,
}
