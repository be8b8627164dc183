use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use bubbler_common::{
    config::RelayBackend, BubblerEngine, RuntimeConfig, TemperatureSnapshot, Topics,
};
use chrono::Utc;
use rumqttc::AsyncClient;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    control::ControlLoop,
    mqtt::{self, MqttPublisher},
    outputs::{OutputController, StatusPublisher},
    relays,
    sampler::{self, Sampler, W1Bus},
    store::{self, AppStore},
};

pub async fn run() -> anyhow::Result<()> {
    let store = AppStore::from_env();
    init_logging(&store);

    let mut runtime = load_runtime_config(&store).await;
    apply_env_overrides(&mut runtime);
    runtime.controller.sanitize();

    let tz = runtime
        .site
        .validate()
        .context("invalid site configuration")?;
    let topics = Topics::new(runtime.site.site.clone());

    let snapshot = store
        .load_snapshot()
        .await
        .context("failed to load persisted state")?;
    let flags = snapshot.trusted_flags();
    info!(
        site = topics.site(),
        master = flags.master,
        auto_bubble = flags.auto_bubble,
        previous_mode = snapshot.mode.as_str(),
        "resuming"
    );

    let mqtt_options = mqtt::build_options(&runtime.network, &topics)?;
    let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
    let publisher: Arc<dyn StatusPublisher> = Arc::new(MqttPublisher::new(client.clone()));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    mqtt::spawn_mqtt_loop(eventloop, client, topics.clone(), command_tx);

    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
    store::spawn_snapshot_writer(store.clone(), snapshot_rx);

    let driver = relays::build_driver(&runtime.hardware.relays)
        .context("failed to open relay outputs")?;
    let outputs = OutputController::new(
        driver,
        publisher.clone(),
        Box::new(snapshot_tx),
        topics.clone(),
    )
    .shared();

    let (temperature_tx, temperature_rx) =
        watch::channel(TemperatureSnapshot::unavailable(Utc::now()));
    let probes = &runtime.hardware.probes;
    let bus = W1Bus::discover(Path::new(&probes.w1_base_dir))
        .await
        .unwrap_or_else(|err| {
            warn!(
                "no 1-Wire bus at {}: {err}; temperatures unavailable",
                probes.w1_base_dir
            );
            W1Bus::default()
        });
    sampler::spawn_sampler(
        Sampler::new(bus, probes.clone(), &runtime.controller),
        temperature_tx,
    );

    let engine = BubblerEngine::new(runtime.controller.clone(), flags);
    let mut control = ControlLoop::new(
        engine,
        outputs,
        publisher,
        topics,
        runtime.site.clone(),
        tz,
        command_rx,
        temperature_rx,
    );
    let now = control.now();
    control.startup(now).await;

    tokio::select! {
        _ = control.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown requested; outputs stay as last commanded");
        }
    }
    Ok(())
}

/// Console plus an ANSI-free copy in `debug.log`. A log file that cannot be
/// opened only costs the copy.
fn init_logging(store: &AppStore) {
    let (file_layer, open_error) = match store.open_log_file() {
        Ok(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        Err(err) => (None, Some(err)),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(err) = open_error {
        warn!(
            "cannot open {}: {err}; logging to console only",
            store.log_path().display()
        );
    }
}

async fn load_runtime_config(store: &AppStore) -> RuntimeConfig {
    match store.load_runtime_config().await {
        Ok(Some(runtime)) => runtime,
        Ok(None) => {
            let runtime = RuntimeConfig::default();
            match store.save_runtime_config(&runtime).await {
                Ok(()) => info!(
                    "wrote default runtime config to {}",
                    store.runtime_path().display()
                ),
                Err(err) => warn!("failed to write default runtime config: {err:#}"),
            }
            runtime
        }
        Err(err) => {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    apply_overrides(runtime, |key| std::env::var(key).ok());
}

fn apply_overrides(runtime: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    let network = &mut runtime.network;
    if let Some(host) = var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT") {
        match port.parse::<u16>() {
            Ok(port) => network.mqtt_port = port,
            Err(_) => warn!("ignoring invalid MQTT_PORT '{port}'"),
        }
    }
    if let Some(user) = var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(site) = var("BUBBLER_SITE") {
        runtime.site.site = site;
    }
    if let Some(backend) = var("BUBBLER_RELAYS") {
        match backend.as_str() {
            "sysfs" => runtime.hardware.relays.backend = RelayBackend::Sysfs,
            "simulated" => runtime.hardware.relays.backend = RelayBackend::Simulated,
            other => warn!("ignoring unknown BUBBLER_RELAYS '{other}'"),
        }
    }
}
