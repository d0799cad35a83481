use super::missed_runs::resume_point;
use super::schedule_calc::CompiledSchedule;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Where a job's slot is in the scheduling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Armed { next_fire: DateTime<Utc> },
    Firing { scheduled: DateTime<Utc> },
    /// Disabled or deleted. Terminal.
    Retired,
    /// Schedule could not be parsed. Never armed.
    Invalid { reason: String },
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Armed { .. } => "armed",
            SlotState::Firing { .. } => "firing",
            SlotState::Retired => "retired",
            SlotState::Invalid { .. } => "invalid",
        }
    }
}

pub struct SlotTransition;

impl SlotTransition {
    pub fn is_valid(from: &SlotState, to: &SlotState) -> bool {
        match (from, to) {
            (SlotState::Idle, SlotState::Armed { .. }) => true,
            (SlotState::Idle, SlotState::Invalid { .. }) => true,

            (SlotState::Armed { .. }, SlotState::Firing { .. }) => true,

            (SlotState::Firing { .. }, SlotState::Armed { .. }) => true,
            // schedule has no further occurrence
            (SlotState::Firing { .. }, SlotState::Idle) => true,

            (SlotState::Retired, _) => false,
            (_, SlotState::Retired) => true,

            _ => false,
        }
    }
}

/// Per-job scheduling state.
#[derive(Debug)]
pub struct Slot {
    pub job_id: i32,
    /// Bumped on every replacement, so a firing finished against an older
    /// slot does not re-arm the new one.
    pub generation: u64,
    pub state: SlotState,
    pub last_fired: Option<DateTime<Utc>>,
    schedule: Option<CompiledSchedule>,
}

impl Slot {
    pub fn new(
        job_id: i32,
        generation: u64,
        schedule: Option<CompiledSchedule>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            job_id,
            generation,
            state: SlotState::Idle,
            last_fired,
            schedule,
        }
    }

    pub fn transition(&mut self, to: SlotState) -> bool {
        if !SlotTransition::is_valid(&self.state, &to) {
            warn!(
                job_id = self.job_id,
                from = self.state.name(),
                to = to.name(),
                "Rejected slot transition"
            );
            return false;
        }
        self.state = to;
        true
    }

    /// Computes the next fire time and arms the slot. Returns it.
    pub fn arm(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self
            .schedule
            .as_ref()
            .and_then(|schedule| resume_point(self.job_id, schedule, self.last_fired, now));

        match next {
            Some(next_fire) => {
                self.transition(SlotState::Armed { next_fire });
            }
            None => {
                if matches!(self.state, SlotState::Firing { .. }) {
                    self.transition(SlotState::Idle);
                }
            }
        }
        next
    }

    /// Moves an armed slot whose fire time has come to `Firing`. Returns the
    /// scheduled timestamp of the firing.
    pub fn fire_if_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let SlotState::Armed { next_fire } = self.state else {
            return None;
        };
        if next_fire > now {
            return None;
        }
        if self.last_fired == Some(next_fire) {
            return None;
        }
        if self.transition(SlotState::Firing {
            scheduled: next_fire,
        }) {
            self.last_fired = Some(next_fire);
            Some(next_fire)
        } else {
            None
        }
    }

    pub fn is_firing(&self) -> bool {
        matches!(self.state, SlotState::Firing { .. })
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        match self.state {
            SlotState::Armed { next_fire } => Some(next_fire),
            _ => None,
        }
    }
}
