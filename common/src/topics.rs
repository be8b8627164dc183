use crate::types::Relay;

pub const DEFAULT_SITE: &str = "cust1";

pub const STATE_BUBBLER_MAIN: &str = "state/bubbler_main";
pub const STATE_STATEMACHINE: &str = "state/statemachine";
pub const STATE_AUTO_BUBBLE: &str = "state/auto_bubble";
pub const STATE_BUBBLER_1: &str = "state/bubbler_1";
pub const STATE_BUBBLER_2: &str = "state/bubbler_2";
pub const STATE_DANGER_LIGHTS: &str = "state/danger_lights";
pub const STATE_TEMPERATURES: &str = "state/temperatures";
pub const STATE_AVAILABILITY: &str = "state/availability";

pub const CMD_BUBBLER_MAIN: &str = "cmd/bubbler_main";
pub const CMD_AUTO_BUBBLE: &str = "cmd/auto_bubble";
pub const CMD_BUBBLER_1: &str = "cmd/bubbler_1";
pub const CMD_BUBBLER_2: &str = "cmd/bubbler_2";
pub const CMD_DANGER_LIGHTS: &str = "cmd/danger_lights";

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Full topic names for one site prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    site: String,
}

impl Topics {
    pub fn new(site: impl Into<String>) -> Self {
        let site = site.into();
        let site = site.trim_matches('/').to_string();
        Self { site }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn full(&self, suffix: &str) -> String {
        format!("{}/{}", self.site, suffix)
    }

    pub fn relay_state(&self, relay: Relay) -> String {
        self.full(match relay {
            Relay::BubblerA => STATE_BUBBLER_1,
            Relay::BubblerB => STATE_BUBBLER_2,
            Relay::DangerLight => STATE_DANGER_LIGHTS,
        })
    }

    pub fn command_topics(&self) -> Vec<String> {
        [
            CMD_BUBBLER_MAIN,
            CMD_AUTO_BUBBLE,
            CMD_BUBBLER_1,
            CMD_BUBBLER_2,
            CMD_DANGER_LIGHTS,
        ]
        .into_iter()
        .map(|suffix| self.full(suffix))
        .collect()
    }

    /// The part after `<site>/`, or `None` for topics of another site.
    pub fn strip_site<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.site.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_SITE)
    }
}
