use crate::{
    topics::{
        Topics, CMD_AUTO_BUBBLE, CMD_BUBBLER_1, CMD_BUBBLER_2, CMD_BUBBLER_MAIN,
        CMD_DANGER_LIGHTS,
    },
    types::{Relay, Switch},
};

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    Main,
    AutoBubble,
    Relay(Relay),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub target: CommandTarget,
    pub desired: Switch,
}

impl Command {
    pub fn new(target: CommandTarget, desired: Switch) -> Self {
        Self { target, desired }
    }

    /// Decodes one inbound bus message. Unknown topics yield `None`;
    /// any payload other than `ON` is `OFF`.
    pub fn from_message(topics: &Topics, topic: &str, payload: &[u8]) -> Option<Self> {
        if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
            return None;
        }

        let target = match topics.strip_site(topic)? {
            CMD_BUBBLER_MAIN => CommandTarget::Main,
            CMD_AUTO_BUBBLE => CommandTarget::AutoBubble,
            CMD_BUBBLER_1 => CommandTarget::Relay(Relay::BubblerA),
            CMD_BUBBLER_2 => CommandTarget::Relay(Relay::BubblerB),
            CMD_DANGER_LIGHTS => CommandTarget::Relay(Relay::DangerLight),
            _ => return None,
        };

        let desired = std::str::from_utf8(payload)
            .map(Switch::from_payload)
            .unwrap_or(Switch::Off);

        Some(Self { target, desired })
    }
}
