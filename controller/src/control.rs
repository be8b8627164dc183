use std::{collections::VecDeque, sync::Arc, time::Duration};

use bubbler_common::{
    compute_solar_times,
    config::SiteConfig,
    schedule::{minutes_to_time, nightly_jobs},
    BubblerEngine, Command, EngineAction, JobAction, JobTable, JobTag, TemperatureSnapshot, Topics,
    AVAILABILITY_ONLINE, STATE_AUTO_BUBBLE, STATE_AVAILABILITY, STATE_BUBBLER_MAIN,
    STATE_STATEMACHINE, STATE_TEMPERATURES,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    alternator::{Alternator, AlternatorTiming},
    outputs::{SharedOutputs, StatusPublisher},
};

/// Owns the engine, the job table and the alternator handle. Every other
/// task talks to it through the command queue or the temperature channel.
pub struct ControlLoop {
    engine: BubblerEngine,
    jobs: JobTable,
    alternator: Option<Alternator>,
    timing: AlternatorTiming,

    outputs: SharedOutputs,
    publisher: Arc<dyn StatusPublisher>,
    topics: Topics,
    site: SiteConfig,
    tz: Tz,

    commands: mpsc::UnboundedReceiver<Command>,
    backlog: VecDeque<Command>,
    temperatures: watch::Receiver<TemperatureSnapshot>,
    latest: TemperatureSnapshot,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: BubblerEngine,
        outputs: SharedOutputs,
        publisher: Arc<dyn StatusPublisher>,
        topics: Topics,
        site: SiteConfig,
        tz: Tz,
        commands: mpsc::UnboundedReceiver<Command>,
        temperatures: watch::Receiver<TemperatureSnapshot>,
    ) -> Self {
        let latest = *temperatures.borrow();
        let timing = AlternatorTiming::from_config(&engine.config);
        Self {
            engine,
            jobs: JobTable::new(),
            alternator: None,
            timing,
            outputs,
            publisher,
            topics,
            site,
            tz,
            commands,
            backlog: VecDeque::new(),
            temperatures,
            latest,
        }
    }

    pub fn engine(&self) -> &BubblerEngine {
        &self.engine
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn alternator_running(&self) -> bool {
        self.alternator
            .as_ref()
            .is_some_and(|alternator| !alternator.is_finished())
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// Outputs off, solar times, the daily solar job and the retained
    /// control state.
    pub async fn startup(&mut self, now: DateTime<Tz>) {
        self.outputs.lock().await.initialize();

        self.refresh_solar(now.date_naive());
        match minutes_to_time(self.engine.config.solar_refresh_minutes) {
            Some(at) => self
                .jobs
                .every_day_at(at, JobAction::RefreshSolar, None, now.naive_local()),
            None => warn!("invalid solar refresh time; sunrise/sunset will not be updated"),
        }

        let actions = self.engine.startup_actions();
        self.execute(actions, now).await;
        self.publish_availability();
        info!(
            master = self.engine.flags().master,
            auto_bubble = self.engine.flags().auto_bubble,
            "control loop ready"
        );
    }

    /// Runs forever; every wake-up performs one full step.
    pub async fn run(mut self) {
        let config = &self.engine.config;
        let mut tick = interval(Duration::from_millis(config.tick_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // startup already announced availability
        let heartbeat_period = Duration::from_millis(config.heartbeat_interval_ms);
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // separate receiver so waking up does not consume the change the
        // step is going to read
        let mut temperature_wake = self.temperatures.clone();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                Some(command) = self.commands.recv() => self.backlog.push_back(command),
                Ok(()) = temperature_wake.changed() => {}
                _ = heartbeat.tick() => {
                    self.publish_availability();
                    continue;
                }
            }
            let now = self.now();
            self.step(now).await;
        }
    }

    /// Due jobs, queued commands, danger light, then one engine evaluation.
    pub async fn step(&mut self, now: DateTime<Tz>) {
        for action in self.jobs.run_pending(now.naive_local()) {
            debug!(?action, "scheduled job fired");
            match action {
                JobAction::Relay(relay, desired) => {
                    self.outputs.lock().await.set(relay, desired);
                }
                JobAction::RefreshSolar => self.refresh_solar(now.date_naive()),
            }
        }

        while let Ok(command) = self.commands.try_recv() {
            self.backlog.push_back(command);
        }
        while let Some(command) = self.backlog.pop_front() {
            let actions = self.engine.apply_command(command);
            if actions.is_empty() {
                debug!(?command, "command ignored");
                continue;
            }
            info!(?command, "command applied");
            self.execute(actions, now).await;
        }

        let actions = self.engine.refresh_danger_light(now.time());
        self.execute(actions, now).await;

        self.absorb_temperatures();

        let before = self.engine.mode();
        let air = self.latest.air.value_c;
        let actions = self.engine.tick(air);
        if self.engine.mode() != before {
            info!(
                from = before.as_str(),
                to = self.engine.mode().as_str(),
                air_c = ?air,
                "mode transition"
            );
        }
        self.execute(actions, now).await;
    }

    fn absorb_temperatures(&mut self) {
        if !self.temperatures.has_changed().unwrap_or(false) {
            return;
        }
        self.latest = *self.temperatures.borrow_and_update();
        match serde_json::to_string(&self.latest.payload()) {
            Ok(payload) => self.publish(STATE_TEMPERATURES, payload),
            Err(err) => warn!("failed to encode temperatures: {err}"),
        }
    }

    async fn execute(&mut self, actions: Vec<EngineAction>, now: DateTime<Tz>) {
        for action in actions {
            match action {
                EngineAction::PublishMain(state) => {
                    self.publish(STATE_BUBBLER_MAIN, state.as_str().to_string())
                }
                EngineAction::PublishAutoBubble(state) => {
                    self.publish(STATE_AUTO_BUBBLE, state.as_str().to_string())
                }
                EngineAction::PublishMode(mode) => {
                    self.publish(STATE_STATEMACHINE, mode.as_str().to_string())
                }
                EngineAction::SetRelay(relay, desired) => {
                    self.outputs.lock().await.set(relay, desired);
                }
                EngineAction::InstallNightlyJobs => {
                    if self.jobs.has_tag(JobTag::Nightly) {
                        continue;
                    }
                    for (at, job) in nightly_jobs(&self.engine.config.nightly_windows) {
                        self.jobs
                            .every_day_at(at, job, Some(JobTag::Nightly), now.naive_local());
                    }
                    info!(next = ?self.jobs.next_run(), "nightly schedule installed");
                }
                EngineAction::ClearNightlyJobs => {
                    let removed = self.jobs.clear_tag(JobTag::Nightly);
                    debug!(removed, "nightly schedule cleared");
                }
                EngineAction::StartAlternator => {
                    if let Some(previous) = self.alternator.take() {
                        warn!("alternator already running; restarting it");
                        previous.stop().await;
                    }
                    self.alternator = Some(Alternator::start(self.outputs.clone(), self.timing));
                }
                EngineAction::StopAlternator => match self.alternator.take() {
                    Some(alternator) => {
                        alternator.stop().await;
                    }
                    None => debug!("no alternator to stop"),
                },
                EngineAction::Persist => {
                    self.outputs
                        .lock()
                        .await
                        .record_control(self.engine.flags(), self.engine.mode());
                }
            }
        }
    }

    fn refresh_solar(&mut self, date: NaiveDate) {
        match compute_solar_times(date, self.site.latitude, self.site.longitude, &self.tz) {
            Some(times) => {
                info!(%date, "{times}");
                self.engine.set_solar_times(times);
            }
            None => warn!(
                %date,
                "no sunrise/sunset at this latitude today; keeping previous times"
            ),
        }
    }

    fn publish(&self, suffix: &str, payload: String) {
        self.publisher
            .publish(&self.topics.full(suffix), payload, true);
    }

    fn publish_availability(&self) {
        self.publisher.publish(
            &self.topics.full(STATE_AVAILABILITY),
            AVAILABILITY_ONLINE.to_string(),
            false,
        );
    }
}
