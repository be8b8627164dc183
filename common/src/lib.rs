pub mod command;
pub mod config;
pub mod engine;
pub mod schedule;
pub mod solar;
pub mod topics;
pub mod types;

pub use command::{Command, CommandTarget};
pub use config::{ControllerConfig, PersistedSnapshot, RuntimeConfig, SiteConfig};
pub use engine::{BubblerEngine, EngineAction};
pub use schedule::{JobAction, JobTable, JobTag};
pub use solar::{compute_solar_times, SolarTimes};
pub use topics::*;
pub use types::{
    ControlFlags, OperatingMode, ProbeRole, Relay, RelayState, Switch, TemperatureSample,
    TemperatureSnapshot, TemperaturesPayload,
};
