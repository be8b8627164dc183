use chrono::NaiveTime;

use crate::{
    command::{Command, CommandTarget},
    config::ControllerConfig,
    solar::SolarTimes,
    types::{ControlFlags, OperatingMode, Relay, Switch},
};

/// Side effects requested by the engine, executed in order by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    PublishMain(Switch),
    PublishAutoBubble(Switch),
    PublishMode(OperatingMode),
    SetRelay(Relay, Switch),
    InstallNightlyJobs,
    ClearNightlyJobs,
    StartAlternator,
    StopAlternator,
    Persist,
}

#[derive(Debug, Clone)]
pub struct BubblerEngine {
    pub config: ControllerConfig,

    flags: ControlFlags,
    // Flag values last published, so transitions only re-announce changes.
    announced: ControlFlags,
    mode: OperatingMode,

    nightly_installed: bool,
    dusk_light_on: bool,
    solar: Option<SolarTimes>,
}

impl BubblerEngine {
    pub fn new(config: ControllerConfig, flags: ControlFlags) -> Self {
        let flags = ControlFlags {
            master: flags.master,
            auto_bubble: flags.auto_bubble && flags.master,
        };
        Self {
            config,
            flags,
            announced: flags,
            mode: OperatingMode::Off,
            nightly_installed: false,
            dusk_light_on: false,
            solar: None,
        }
    }

    pub fn flags(&self) -> ControlFlags {
        self.flags
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn solar_times(&self) -> Option<SolarTimes> {
        self.solar
    }

    pub fn set_solar_times(&mut self, solar: SolarTimes) {
        self.solar = Some(solar);
    }

    pub fn is_dusk_light_on(&self) -> bool {
        self.dusk_light_on
    }

    /// Retained state to publish once the bus is up.
    pub fn startup_actions(&mut self) -> Vec<EngineAction> {
        self.announced = self.flags;
        vec![
            EngineAction::PublishMain(Switch::from_bool(self.flags.master)),
            EngineAction::PublishMode(self.mode),
            EngineAction::PublishAutoBubble(Switch::from_bool(self.flags.auto_bubble)),
            EngineAction::Persist,
        ]
    }

    /// Applies one inbound command. An empty result means it was ignored.
    pub fn apply_command(&mut self, command: Command) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        match (command.target, command.desired) {
            (CommandTarget::Main, Switch::On) => {
                self.flags.master = true;
                self.announced.master = true;
                actions.push(EngineAction::PublishMain(Switch::On));
            }
            (CommandTarget::Main, Switch::Off) => {
                self.flags.master = false;
                self.announced.master = false;
                actions.push(EngineAction::PublishMain(Switch::Off));
                self.flags.auto_bubble = false;
                self.announce_flags(&mut actions);
                self.all_outputs_off(&mut actions);
            }
            (CommandTarget::AutoBubble, Switch::On) => {
                if !self.flags.master {
                    return actions;
                }
                self.flags.auto_bubble = true;
                self.announced.auto_bubble = true;
                actions.push(EngineAction::PublishAutoBubble(Switch::On));
            }
            (CommandTarget::AutoBubble, Switch::Off) => {
                self.flags.auto_bubble = false;
                self.announced.auto_bubble = false;
                actions.push(EngineAction::PublishAutoBubble(Switch::Off));
            }
            (CommandTarget::Relay(relay), Switch::On) => {
                if !self.flags.master {
                    return actions;
                }
                actions.push(EngineAction::SetRelay(relay, Switch::On));
            }
            (CommandTarget::Relay(relay), Switch::Off) => {
                actions.push(EngineAction::SetRelay(relay, Switch::Off));
            }
        }

        actions.push(EngineAction::Persist);
        actions
    }

    /// Dusk-to-dawn light control, edge-triggered so the relay is only
    /// commanded when the dark/light condition flips.
    pub fn refresh_danger_light(&mut self, local_now: NaiveTime) -> Vec<EngineAction> {
        if !self.flags.master {
            if self.dusk_light_on {
                self.dusk_light_on = false;
                return vec![EngineAction::SetRelay(Relay::DangerLight, Switch::Off)];
            }
            return Vec::new();
        }

        let Some(solar) = self.solar else {
            return Vec::new();
        };

        let dark = solar.is_dark(local_now);
        if dark == self.dusk_light_on {
            return Vec::new();
        }
        self.dusk_light_on = dark;
        vec![EngineAction::SetRelay(
            Relay::DangerLight,
            Switch::from_bool(dark),
        )]
    }

    /// One state machine evaluation. At most one mode change per call.
    /// `air_temp_c` of `None` suppresses every temperature-gated exit.
    pub fn tick(&mut self, air_temp_c: Option<f32>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let below = |threshold: f32| air_temp_c.is_some_and(|temp| temp < threshold);
        let above = |threshold: f32| air_temp_c.is_some_and(|temp| temp > threshold);

        match self.mode {
            OperatingMode::Off => {
                if self.flags.master {
                    self.announced.master = true;
                    actions.push(EngineAction::PublishMain(Switch::On));
                    self.transition(OperatingMode::Idle, &mut actions);
                }
            }
            OperatingMode::Idle => {
                if !self.flags.master {
                    self.enter_off(&mut actions);
                } else if self.flags.auto_bubble && below(self.config.nightly_enter_c) {
                    self.nightly_installed = false;
                    self.transition(OperatingMode::Nightly, &mut actions);
                }
            }
            OperatingMode::Nightly => {
                if !self.nightly_installed {
                    self.nightly_installed = true;
                    actions.push(EngineAction::InstallNightlyJobs);
                }

                if self.flags.master
                    && self.flags.auto_bubble
                    && below(self.config.constant_enter_c)
                {
                    self.leave_nightly(&mut actions);
                    actions.push(EngineAction::StartAlternator);
                    self.transition(OperatingMode::Constant, &mut actions);
                } else if !self.flags.auto_bubble || above(self.config.nightly_exit_c) {
                    self.leave_nightly(&mut actions);
                    self.transition(OperatingMode::Idle, &mut actions);
                } else if !self.flags.master {
                    self.leave_nightly(&mut actions);
                    self.enter_off(&mut actions);
                }
            }
            OperatingMode::Constant => {
                if above(self.config.constant_exit_c) {
                    self.leave_constant(&mut actions);
                    self.nightly_installed = false;
                    self.transition(OperatingMode::Nightly, &mut actions);
                } else if !self.flags.auto_bubble {
                    self.leave_constant(&mut actions);
                    self.transition(OperatingMode::Idle, &mut actions);
                } else if !self.flags.master {
                    self.leave_constant(&mut actions);
                    self.enter_off(&mut actions);
                }
            }
        }

        actions
    }

    fn transition(&mut self, to: OperatingMode, actions: &mut Vec<EngineAction>) {
        self.mode = to;
        actions.push(EngineAction::PublishMode(to));
        self.announce_flags(actions);
        actions.push(EngineAction::Persist);
    }

    fn enter_off(&mut self, actions: &mut Vec<EngineAction>) {
        self.flags.auto_bubble = false;
        self.all_outputs_off(actions);
        self.transition(OperatingMode::Off, actions);
    }

    fn leave_nightly(&mut self, actions: &mut Vec<EngineAction>) {
        self.nightly_installed = false;
        actions.push(EngineAction::ClearNightlyJobs);
        Self::bubblers_off(actions);
    }

    fn leave_constant(&mut self, actions: &mut Vec<EngineAction>) {
        actions.push(EngineAction::StopAlternator);
        Self::bubblers_off(actions);
    }

    fn bubblers_off(actions: &mut Vec<EngineAction>) {
        actions.push(EngineAction::SetRelay(Relay::BubblerA, Switch::Off));
        actions.push(EngineAction::SetRelay(Relay::BubblerB, Switch::Off));
    }

    fn all_outputs_off(&mut self, actions: &mut Vec<EngineAction>) {
        Self::bubblers_off(actions);
        actions.push(EngineAction::SetRelay(Relay::DangerLight, Switch::Off));
        self.dusk_light_on = false;
    }

    fn announce_flags(&mut self, actions: &mut Vec<EngineAction>) {
        if self.announced.master != self.flags.master {
            self.announced.master = self.flags.master;
            actions.push(EngineAction::PublishMain(Switch::from_bool(self.flags.master)));
        }
        if self.announced.auto_bubble != self.flags.auto_bubble {
            self.announced.auto_bubble = self.flags.auto_bubble;
            actions.push(EngineAction::PublishAutoBubble(Switch::from_bool(
                self.flags.auto_bubble,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn engine(master: bool, auto_bubble: bool) -> BubblerEngine {
        BubblerEngine::new(
            ControllerConfig::default(),
            ControlFlags {
                master,
                auto_bubble,
            },
        )
    }

    fn cmd(target: CommandTarget, desired: Switch) -> Command {
        Command::new(target, desired)
    }

    fn engine_in(mode: OperatingMode) -> BubblerEngine {
        let mut engine = engine(true, true);
        engine.tick(Some(5.0));
        assert_eq!(engine.mode(), OperatingMode::Idle);
        if mode == OperatingMode::Idle {
            return engine;
        }
        engine.tick(Some(-1.0));
        engine.tick(Some(-1.0));
        if mode == OperatingMode::Nightly {
            return engine;
        }
        engine.tick(Some(-9.0));
        assert_eq!(engine.mode(), OperatingMode::Constant);
        engine
    }

    #[test]
    fn master_on_moves_off_to_idle() {
        let mut engine = engine(false, false);
        assert!(engine.tick(Some(5.0)).is_empty());

        let actions = engine.apply_command(cmd(CommandTarget::Main, Switch::On));
        assert_eq!(
            actions,
            vec![EngineAction::PublishMain(Switch::On), EngineAction::Persist]
        );

        let actions = engine.tick(Some(5.0));
        assert_eq!(
            actions,
            vec![
                EngineAction::PublishMain(Switch::On),
                EngineAction::PublishMode(OperatingMode::Idle),
                EngineAction::Persist,
            ]
        );
        assert_eq!(engine.mode(), OperatingMode::Idle);
    }

    #[test]
    fn resumed_flags_at_mild_temperature_settle_in_idle() {
        let mut engine = engine(true, true);

        engine.tick(Some(5.0));
        engine.tick(Some(5.0));

        assert_eq!(engine.mode(), OperatingMode::Idle);
    }

    #[test]
    fn enters_nightly_only_below_zero() {
        let mut engine = engine_in(OperatingMode::Idle);

        for temp in [2.0, 0.5] {
            assert!(engine.tick(Some(temp)).is_empty());
            assert_eq!(engine.mode(), OperatingMode::Idle);
        }

        let actions = engine.tick(Some(-0.5));
        assert_eq!(engine.mode(), OperatingMode::Nightly);
        assert_eq!(
            actions,
            vec![
                EngineAction::PublishMode(OperatingMode::Nightly),
                EngineAction::Persist,
            ]
        );

        // jobs are installed on the first tick spent in Nightly, once
        assert_eq!(
            engine.tick(Some(-0.5)),
            vec![EngineAction::InstallNightlyJobs]
        );
        assert!(engine.tick(Some(-0.5)).is_empty());
    }

    #[test]
    fn exactly_zero_does_not_enter_nightly() {
        let mut engine = engine_in(OperatingMode::Idle);
        engine.tick(Some(0.0));
        assert_eq!(engine.mode(), OperatingMode::Idle);
    }

    #[test]
    fn nightly_holds_inside_hysteresis_band() {
        let mut engine = engine_in(OperatingMode::Nightly);

        for temp in [0.1, 0.9, 0.5, 0.1, 0.9, 1.0] {
            assert!(engine.tick(Some(temp)).is_empty());
            assert_eq!(engine.mode(), OperatingMode::Nightly);
        }

        let actions = engine.tick(Some(1.1));
        assert_eq!(engine.mode(), OperatingMode::Idle);
        assert_eq!(
            actions,
            vec![
                EngineAction::ClearNightlyJobs,
                EngineAction::SetRelay(Relay::BubblerA, Switch::Off),
                EngineAction::SetRelay(Relay::BubblerB, Switch::Off),
                EngineAction::PublishMode(OperatingMode::Idle),
                EngineAction::Persist,
            ]
        );
    }

    #[test]
    fn severe_cold_starts_alternator_then_auto_off_returns_to_idle() {
        let mut engine = engine_in(OperatingMode::Nightly);

        let actions = engine.tick(Some(-8.5));
        assert_eq!(engine.mode(), OperatingMode::Constant);
        assert_eq!(
            actions,
            vec![
                EngineAction::ClearNightlyJobs,
                EngineAction::SetRelay(Relay::BubblerA, Switch::Off),
                EngineAction::SetRelay(Relay::BubblerB, Switch::Off),
                EngineAction::StartAlternator,
                EngineAction::PublishMode(OperatingMode::Constant),
                EngineAction::Persist,
            ]
        );

        engine.apply_command(cmd(CommandTarget::AutoBubble, Switch::Off));
        let actions = engine.tick(Some(-8.5));
        assert_eq!(engine.mode(), OperatingMode::Idle);
        assert_eq!(actions[0], EngineAction::StopAlternator);
        assert!(actions.contains(&EngineAction::PublishMode(OperatingMode::Idle)));
    }

    #[test]
    fn constant_warms_back_to_nightly_and_reinstalls_jobs() {
        let mut engine = engine_in(OperatingMode::Constant);

        assert!(engine.tick(Some(-6.0)).is_empty());
        let actions = engine.tick(Some(-5.9));
        assert_eq!(engine.mode(), OperatingMode::Nightly);
        assert_eq!(actions[0], EngineAction::StopAlternator);

        assert_eq!(
            engine.tick(Some(-5.9)),
            vec![EngineAction::InstallNightlyJobs]
        );
    }

    #[test]
    fn missing_temperature_suppresses_thermal_exits() {
        let mut idle = engine_in(OperatingMode::Idle);
        assert!(idle.tick(None).is_empty());
        assert_eq!(idle.mode(), OperatingMode::Idle);

        let mut constant = engine_in(OperatingMode::Constant);
        assert!(constant.tick(None).is_empty());
        assert_eq!(constant.mode(), OperatingMode::Constant);

        // non-thermal exits still apply
        constant.apply_command(cmd(CommandTarget::AutoBubble, Switch::Off));
        constant.tick(None);
        assert_eq!(constant.mode(), OperatingMode::Idle);
    }

    #[test]
    fn master_off_forces_outputs_and_auto_off_immediately() {
        let mut engine = engine_in(OperatingMode::Nightly);

        let actions = engine.apply_command(cmd(CommandTarget::Main, Switch::Off));

        assert_eq!(
            actions,
            vec![
                EngineAction::PublishMain(Switch::Off),
                EngineAction::PublishAutoBubble(Switch::Off),
                EngineAction::SetRelay(Relay::BubblerA, Switch::Off),
                EngineAction::SetRelay(Relay::BubblerB, Switch::Off),
                EngineAction::SetRelay(Relay::DangerLight, Switch::Off),
                EngineAction::Persist,
            ]
        );
        assert_eq!(engine.flags(), ControlFlags::default());

        // Nightly sees auto-bubble cleared first, then Idle drops to Off.
        engine.tick(Some(-1.0));
        assert_eq!(engine.mode(), OperatingMode::Idle);
        let actions = engine.tick(Some(-1.0));
        assert_eq!(engine.mode(), OperatingMode::Off);
        assert!(actions.contains(&EngineAction::PublishMode(OperatingMode::Off)));
        assert!(!actions.contains(&EngineAction::PublishAutoBubble(Switch::Off)));
    }

    #[test]
    fn severe_cold_after_master_off_does_not_reach_constant() {
        let mut engine = engine_in(OperatingMode::Nightly);
        engine.apply_command(cmd(CommandTarget::Main, Switch::Off));

        let actions = engine.tick(Some(-9.0));

        assert_eq!(engine.mode(), OperatingMode::Idle);
        assert!(!actions.contains(&EngineAction::StartAlternator));
        assert!(!actions.contains(&EngineAction::PublishMode(OperatingMode::Constant)));
        assert_eq!(actions[0], EngineAction::ClearNightlyJobs);

        engine.tick(Some(-9.0));
        assert_eq!(engine.mode(), OperatingMode::Off);
    }

    #[test]
    fn severe_cold_without_auto_bubble_leaves_nightly_for_idle() {
        let mut engine = engine_in(OperatingMode::Nightly);
        engine.apply_command(cmd(CommandTarget::AutoBubble, Switch::Off));

        let actions = engine.tick(Some(-9.0));

        assert_eq!(engine.mode(), OperatingMode::Idle);
        assert!(!actions.contains(&EngineAction::StartAlternator));
    }

    #[test]
    fn gated_commands_are_ignored_without_master() {
        let mut engine = engine(false, false);

        assert!(engine
            .apply_command(cmd(CommandTarget::Relay(Relay::BubblerA), Switch::On))
            .is_empty());
        assert!(engine
            .apply_command(cmd(CommandTarget::Relay(Relay::DangerLight), Switch::On))
            .is_empty());
        assert!(engine
            .apply_command(cmd(CommandTarget::AutoBubble, Switch::On))
            .is_empty());
        assert!(!engine.flags().auto_bubble);

        // OFF is always honoured
        assert_eq!(
            engine.apply_command(cmd(CommandTarget::Relay(Relay::BubblerB), Switch::Off)),
            vec![
                EngineAction::SetRelay(Relay::BubblerB, Switch::Off),
                EngineAction::Persist,
            ]
        );
    }

    #[test]
    fn manual_commands_are_accepted_in_any_mode() {
        let mut engine = engine_in(OperatingMode::Constant);

        assert_eq!(
            engine.apply_command(cmd(CommandTarget::Relay(Relay::BubblerA), Switch::On)),
            vec![
                EngineAction::SetRelay(Relay::BubblerA, Switch::On),
                EngineAction::Persist,
            ]
        );
    }

    #[test]
    fn danger_light_follows_dusk_edges_while_powered() {
        let mut engine = engine(true, false);
        engine.set_solar_times(SolarTimes {
            sunrise: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            sunset: NaiveTime::from_hms_opt(16, 45, 0).unwrap(),
        });
        let time = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();

        assert!(engine.refresh_danger_light(time(12, 0)).is_empty());
        assert_eq!(
            engine.refresh_danger_light(time(16, 45)),
            vec![EngineAction::SetRelay(Relay::DangerLight, Switch::On)]
        );
        assert!(engine.refresh_danger_light(time(23, 0)).is_empty());
        assert!(engine.refresh_danger_light(time(3, 0)).is_empty());
        assert_eq!(
            engine.refresh_danger_light(time(7, 30)),
            vec![EngineAction::SetRelay(Relay::DangerLight, Switch::Off)]
        );
    }

    #[test]
    fn danger_light_stays_dark_without_master() {
        let mut engine = engine(true, false);
        engine.set_solar_times(SolarTimes {
            sunrise: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            sunset: NaiveTime::from_hms_opt(16, 45, 0).unwrap(),
        });
        let night = NaiveTime::from_hms_opt(22, 0, 0).unwrap();

        engine.refresh_danger_light(night);
        assert!(engine.is_dusk_light_on());

        engine.apply_command(cmd(CommandTarget::Main, Switch::Off));
        assert!(!engine.is_dusk_light_on());
        assert!(engine.refresh_danger_light(night).is_empty());

        engine.apply_command(cmd(CommandTarget::Main, Switch::On));
        assert_eq!(
            engine.refresh_danger_light(night),
            vec![EngineAction::SetRelay(Relay::DangerLight, Switch::On)]
        );
    }

    #[derive(Debug, Clone)]
    enum Input {
        Command(Command),
        Temp(Option<f32>),
    }

    fn input_strategy() -> impl Strategy<Value = Input> {
        let target = prop_oneof![
            Just(CommandTarget::Main),
            Just(CommandTarget::AutoBubble),
            Just(CommandTarget::Relay(Relay::BubblerA)),
            Just(CommandTarget::Relay(Relay::BubblerB)),
            Just(CommandTarget::Relay(Relay::DangerLight)),
        ];
        let desired = prop_oneof![Just(Switch::On), Just(Switch::Off)];
        prop_oneof![
            (target, desired).prop_map(|(t, d)| Input::Command(Command::new(t, d))),
            proptest::option::weighted(0.9, -12.0f32..6.0).prop_map(Input::Temp),
        ]
    }

    proptest! {
        #[test]
        fn lifecycles_stay_paired_with_mode(inputs in proptest::collection::vec(input_strategy(), 1..200)) {
            let mut engine = engine(false, false);
            let mut alternators = 0i32;
            let mut nightly_jobs = false;

            for input in inputs {
                let actions = match input {
                    Input::Command(command) => engine.apply_command(command),
                    Input::Temp(temp) => {
                        let before = engine.mode();
                        let actions = engine.tick(temp);
                        let mode_changes = actions
                            .iter()
                            .filter(|a| matches!(a, EngineAction::PublishMode(_)))
                            .count();
                        prop_assert!(mode_changes <= 1);
                        prop_assert_eq!(mode_changes == 1, before != engine.mode());
                        actions
                    }
                };

                for action in &actions {
                    match action {
                        EngineAction::StartAlternator => alternators += 1,
                        EngineAction::StopAlternator => alternators -= 1,
                        EngineAction::InstallNightlyJobs => {
                            prop_assert!(!nightly_jobs);
                            nightly_jobs = true;
                        }
                        EngineAction::ClearNightlyJobs => nightly_jobs = false,
                        _ => {}
                    }
                }

                prop_assert_eq!(alternators, i32::from(engine.mode() == OperatingMode::Constant));
                if engine.mode() != OperatingMode::Nightly {
                    prop_assert!(!nightly_jobs);
                }
                if !engine.flags().master {
                    prop_assert!(!engine.flags().auto_bubble);
                }
            }
        }
    }
}
