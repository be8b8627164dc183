use std::{
    fs,
    path::{Path, PathBuf},
};

use bubbler_common::{
    config::{RelayBackend, RelayPins},
    Relay, RelayState,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("gpio {pin}: {source}")]
    Gpio {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("gpio {pin} returned unexpected value {value:?}")]
    UnexpectedValue { pin: u32, value: String },
}

/// Physical output boundary. Implementations only switch pins; the
/// bubbler interlock lives in the output controller.
pub trait RelayDriver: Send {
    fn set(&mut self, relay: Relay, on: bool) -> Result<(), RelayError>;
    fn is_on(&self, relay: Relay) -> Result<bool, RelayError>;
}

pub fn build_driver(pins: &RelayPins) -> Result<Box<dyn RelayDriver>, RelayError> {
    match pins.backend {
        RelayBackend::Sysfs => Ok(Box::new(SysfsRelays::open(pins)?)),
        RelayBackend::Simulated => {
            info!("using simulated relay outputs");
            Ok(Box::new(SimulatedRelays::default()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Line {
    pin: u32,
    active_low: bool,
}

/// Relays wired to GPIO lines through the sysfs interface.
#[derive(Debug)]
pub struct SysfsRelays {
    root: PathBuf,
    bubbler_a: Line,
    bubbler_b: Line,
    danger: Line,
}

impl SysfsRelays {
    pub fn open(pins: &RelayPins) -> Result<Self, RelayError> {
        let relays = Self {
            root: PathBuf::from(&pins.gpio_root),
            bubbler_a: Line {
                pin: pins.bubbler_a_pin,
                active_low: false,
            },
            bubbler_b: Line {
                pin: pins.bubbler_b_pin,
                active_low: false,
            },
            danger: Line {
                pin: pins.danger_pin,
                active_low: pins.danger_active_low,
            },
        };

        for relay in Relay::ALL {
            relays.export(relays.line(relay))?;
        }
        Ok(relays)
    }

    fn line(&self, relay: Relay) -> Line {
        match relay {
            Relay::BubblerA => self.bubbler_a,
            Relay::BubblerB => self.bubbler_b,
            Relay::DangerLight => self.danger,
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn export(&self, line: Line) -> Result<(), RelayError> {
        let dir = self.pin_dir(line.pin);
        if !dir.exists() {
            write_attr(&self.root.join("export"), line.pin, &line.pin.to_string())?;
            debug!(pin = line.pin, "exported gpio");
        }
        write_attr(&dir.join("direction"), line.pin, "out")
    }
}

impl RelayDriver for SysfsRelays {
    fn set(&mut self, relay: Relay, on: bool) -> Result<(), RelayError> {
        let line = self.line(relay);
        let level = on != line.active_low;
        write_attr(
            &self.pin_dir(line.pin).join("value"),
            line.pin,
            if level { "1" } else { "0" },
        )
    }

    fn is_on(&self, relay: Relay) -> Result<bool, RelayError> {
        let line = self.line(relay);
        let raw = fs::read_to_string(self.pin_dir(line.pin).join("value"))
            .map_err(|source| RelayError::Gpio {
                pin: line.pin,
                source,
            })?;
        let level = match raw.trim() {
            "1" => true,
            "0" => false,
            other => {
                return Err(RelayError::UnexpectedValue {
                    pin: line.pin,
                    value: other.to_string(),
                })
            }
        };
        Ok(level != line.active_low)
    }
}

fn write_attr(path: &Path, pin: u32, value: &str) -> Result<(), RelayError> {
    fs::write(path, value).map_err(|source| RelayError::Gpio { pin, source })
}

/// In-memory outputs for bench runs without relay hardware.
#[derive(Debug, Default)]
pub struct SimulatedRelays {
    state: RelayState,
}

impl RelayDriver for SimulatedRelays {
    fn set(&mut self, relay: Relay, on: bool) -> Result<(), RelayError> {
        self.state.set(relay, on);
        info!(?relay, on, "relay switched (simulated)");
        Ok(())
    }

    fn is_on(&self, relay: Relay) -> Result<bool, RelayError> {
        Ok(self.state.get(relay))
    }
}
