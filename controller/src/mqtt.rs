use std::time::Duration;

use anyhow::bail;
use bubbler_common::{
    command::MAX_COMMAND_PAYLOAD_BYTES, config::NetworkConfig, Command, Topics,
    AVAILABILITY_OFFLINE, STATE_AVAILABILITY,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::outputs::StatusPublisher;

/// Publishes through the shared rumqttc client without blocking the caller.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl StatusPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: String, retain: bool) {
        if let Err(err) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
        {
            warn!(topic, "mqtt publish failed: {err}");
        }
    }
}

pub fn build_options(network: &NetworkConfig, topics: &Topics) -> anyhow::Result<MqttOptions> {
    let mut options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(network.mqtt_keep_alive_secs.max(5)));
    options.set_last_will(LastWill::new(
        topics.full(STATE_AVAILABILITY),
        AVAILABILITY_OFFLINE,
        QoS::AtLeastOnce,
        false,
    ));

    if !network.mqtt_user.is_empty() {
        if network.mqtt_pass.is_empty() {
            bail!(
                "mqtt user '{}' is configured without a password",
                network.mqtt_user
            );
        }
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    Ok(options)
}

/// Drives the connection and turns inbound publishes into queued commands.
/// Subscriptions are renewed on every ConnAck so a broker restart without
/// a persistent session does not silently drop them.
pub fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    commands: mpsc::UnboundedSender<Command>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Some(command) =
                        decode_command(&topics, &message.topic, &message.payload)
                    {
                        if commands.send(command).is_err() {
                            warn!("control loop is gone; dropping command");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_commands(&client, &topics);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn subscribe_commands(client: &AsyncClient, topics: &Topics) {
    // try_subscribe: awaiting here would stall the event loop that drains
    // the request queue
    for topic in topics.command_topics() {
        if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            warn!(topic, "mqtt subscribe failed: {err}");
        }
    }
}

fn decode_command(topics: &Topics, topic: &str, payload: &[u8]) -> Option<Command> {
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        warn!(
            topic,
            bytes = payload.len(),
            "dropping oversized command payload"
        );
        return None;
    }
    let command = Command::from_message(topics, topic, payload);
    match &command {
        Some(command) => debug!(topic, ?command, "command received"),
        None => debug!(topic, "ignoring message"),
    }
    command
}
