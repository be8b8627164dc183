use chrono::{Duration, NaiveDateTime, NaiveTime};

use crate::{
    config::{BubblerSlot, NightlyWindow},
    types::{Relay, Switch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTag {
    Nightly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Relay(Relay, Switch),
    RefreshSolar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub at: NaiveTime,
    pub action: JobAction,
    pub tag: Option<JobTag>,
    next_run: NaiveDateTime,
}

impl ScheduledJob {
    pub fn next_run(&self) -> NaiveDateTime {
        self.next_run
    }
}

/// Daily fixed-time jobs, evaluated against local wall-clock time.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Vec<ScheduledJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a job whose first run is the next occurrence of `at`
    /// strictly after `now`.
    pub fn every_day_at(
        &mut self,
        at: NaiveTime,
        action: JobAction,
        tag: Option<JobTag>,
        now: NaiveDateTime,
    ) {
        self.jobs.push(ScheduledJob {
            at,
            action,
            tag,
            next_run: next_occurrence(at, now),
        });
    }

    pub fn clear_tag(&mut self, tag: JobTag) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.tag != Some(tag));
        before - self.jobs.len()
    }

    pub fn has_tag(&self, tag: JobTag) -> bool {
        self.jobs.iter().any(|job| job.tag == Some(tag))
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.jobs.iter().map(|job| job.next_run).min()
    }

    /// Returns the actions of every job due at `now`, oldest first, and
    /// reschedules them. A job missed for several days fires once.
    pub fn run_pending(&mut self, now: NaiveDateTime) -> Vec<JobAction> {
        let mut due: Vec<(NaiveDateTime, JobAction)> = Vec::new();

        for job in self.jobs.iter_mut().filter(|job| job.next_run <= now) {
            due.push((job.next_run, job.action));
            job.next_run = next_occurrence(job.at, now);
        }

        due.sort_by_key(|(when, _)| *when);
        due.into_iter().map(|(_, action)| action).collect()
    }
}

/// The four relay switchings of the nightly regime.
pub fn nightly_jobs(windows: &[NightlyWindow]) -> Vec<(NaiveTime, JobAction)> {
    let mut jobs = Vec::with_capacity(windows.len() * 2);
    for window in windows {
        let relay = match window.bubbler {
            BubblerSlot::A => Relay::BubblerA,
            BubblerSlot::B => Relay::BubblerB,
        };
        if let Some(start) = minutes_to_time(window.start_minutes) {
            jobs.push((start, JobAction::Relay(relay, Switch::On)));
        }
        if let Some(stop) = minutes_to_time(window.stop_minutes) {
            jobs.push((stop, JobAction::Relay(relay, Switch::Off)));
        }
    }
    jobs
}

pub fn minutes_to_time(minutes: u16) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(u32::from(minutes / 60), u32::from(minutes % 60), 0)
}

fn next_occurrence(at: NaiveTime, now: NaiveDateTime) -> NaiveDateTime {
    let candidate = now.date().and_time(at);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}
