//! Phase-locking of several independently buffering videos.
//!
//! The algorithm is pure: [`transition`] maps a group state and an event to
//! the next state plus the commands to carry out, and [`tick`] decides which
//! members a correction pass must move. [`driver::PhaseSynchronizer`] owns
//! the media handles and the timer and executes those commands.

pub mod driver;

pub use driver::PhaseSynchronizer;

use crate::platform::ReadyState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing policy for one group. Tolerances are in media seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Period of the correction loop.
    pub period_ms: u64,
    /// Steady-state drift allowed before a member is moved.
    pub drift_tolerance: f64,
    /// Drift allowed right after a start or resume.
    pub start_tolerance: f64,
    /// Visible fraction of the group needed to count as on screen.
    pub visibility_threshold: f64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            period_ms: 250,
            drift_tolerance: 0.12,
            start_tolerance: 0.02,
            visibility_threshold: 0.2,
        }
    }
}

impl SyncPolicy {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            return Err(Error::ConfigError("correction period must be positive".into()));
        }
        if !(self.visibility_threshold > 0.0 && self.visibility_threshold <= 1.0) {
            return Err(Error::ConfigError(format!(
                "visibility threshold {} is outside (0, 1]",
                self.visibility_threshold
            )));
        }
        if !(self.start_tolerance >= 0.0 && self.start_tolerance < self.drift_tolerance) {
            return Err(Error::ConfigError(format!(
                "start tolerance {} must be below drift tolerance {}",
                self.start_tolerance, self.drift_tolerance
            )));
        }
        Ok(())
    }

    /// Whether an intersection ratio counts as visible.
    pub fn is_visible(&self, ratio: f64) -> bool {
        ratio > 0.0 && ratio >= self.visibility_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Starting,
    Running,
    Paused,
}

/// Everything the transition function looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub phase: SyncPhase,
    pub visible: bool,
    pub members: usize,
    pub ready: usize,
    /// The start sequence already ran during this mount.
    pub started: bool,
    pub mounted: bool,
}

impl Default for GroupState {
    fn default() -> Self {
        GroupState {
            phase: SyncPhase::Idle,
            visible: false,
            members: 0,
            ready: 0,
            started: false,
            mounted: true,
        }
    }
}

impl GroupState {
    fn can_start(&self) -> bool {
        self.mounted && !self.started && self.visible && self.members > 0 && self.ready == self.members
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Membership or readiness changed.
    Members { members: usize, ready: usize },
    Visibility(bool),
    /// The start sequence finished.
    StartSettled,
    Unmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Pause, seek to zero, wait a frame, play all, snap.
    RunStart,
    StartLoop,
    StopLoop,
    SnapToMaster,
    PauseAll,
    PlayAll,
}

/// Next state and the commands to execute, in order.
pub fn transition(state: &GroupState, event: SyncEvent) -> (GroupState, Vec<SyncCommand>) {
    use SyncCommand::*;
    let mut next = state.clone();
    if !state.mounted {
        return (next, Vec::new());
    }
    let commands = match event {
        SyncEvent::Unmount => {
            next.mounted = false;
            next.phase = SyncPhase::Idle;
            vec![StopLoop, PauseAll]
        }
        SyncEvent::Members { members, ready } => {
            next.members = members;
            next.ready = ready.min(members);
            match next.phase {
                SyncPhase::Running if members < 2 => vec![StopLoop],
                SyncPhase::Running if state.members < 2 => vec![StartLoop],
                _ => Vec::new(),
            }
        }
        SyncEvent::Visibility(visible) => {
            next.visible = visible;
            match (state.phase, visible) {
                (SyncPhase::Running, false) => {
                    next.phase = SyncPhase::Paused;
                    vec![StopLoop, SnapToMaster, PauseAll]
                }
                (SyncPhase::Paused, true) => {
                    next.phase = SyncPhase::Running;
                    vec![SnapToMaster, PlayAll, SnapToMaster, StartLoop]
                }
                _ => Vec::new(),
            }
        }
        SyncEvent::StartSettled => {
            if state.phase != SyncPhase::Starting {
                Vec::new()
            } else if state.visible {
                next.phase = SyncPhase::Running;
                vec![StartLoop]
            } else {
                next.phase = SyncPhase::Paused;
                vec![SnapToMaster, PauseAll]
            }
        }
    };
    if next.phase == SyncPhase::Idle && next.can_start() {
        next.phase = SyncPhase::Starting;
        next.started = true;
        let mut commands = commands;
        commands.push(RunStart);
        return (next, commands);
    }
    (next, commands)
}

/// One member as seen by a correction pass. Index 0 is the master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberSample {
    pub time: f64,
    pub ready: ReadyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotVisible,
    TooFewMembers,
    MasterNotReady,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    /// Members to move, as `(index, master time)`. Empty when in phase.
    Corrected(Vec<(usize, f64)>),
}

/// Members other than the master whose time differs from it by more than
/// `tolerance`, paired with the master's time.
pub fn snap_targets(samples: &[MemberSample], tolerance: f64) -> Vec<(usize, f64)> {
    let Some(master) = samples.first() else {
        return Vec::new();
    };
    samples
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, s)| (s.time - master.time).abs() > tolerance)
        .map(|(i, _)| (i, master.time))
        .collect()
}

/// One correction pass.
pub fn tick(visible: bool, samples: &[MemberSample], policy: &SyncPolicy) -> TickOutcome {
    if !visible {
        return TickOutcome::Skipped(SkipReason::NotVisible);
    }
    if samples.len() < 2 {
        return TickOutcome::Skipped(SkipReason::TooFewMembers);
    }
    if !samples[0].ready.has_current_frame() {
        return TickOutcome::Skipped(SkipReason::MasterNotReady);
    }
    TickOutcome::Corrected(snap_targets(samples, policy.drift_tolerance))
}

/// Largest pairwise difference between member times.
pub fn max_drift(times: &[f64]) -> f64 {
    let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = times.iter().copied().fold(f64::INFINITY, f64::min);
    if times.is_empty() {
        0.0
    } else {
        max - min
    }
}
