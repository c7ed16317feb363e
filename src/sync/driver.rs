//! Drives a sync group: owns the members, the correction timer and the
//! start/pause/resume sequences.

use super::{max_drift, tick, transition, GroupState, MemberSample, SyncCommand, SyncEvent, SyncPhase, SyncPolicy, TickOutcome};
use crate::platform::{MediaElement, Platform};
use crate::Result;
use futures::future::join_all;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

struct Member {
    key: String,
    media: Arc<dyn MediaElement>,
    ready: bool,
}

struct Inner {
    state: GroupState,
    members: Vec<Member>,
    ticker: Option<JoinHandle<()>>,
    ticks: u64,
}

struct Shared {
    policy: SyncPolicy,
    platform: Arc<dyn Platform>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass of the correction loop.
    fn correct(&self) {
        let (visible, media) = {
            let inner = self.lock();
            (
                inner.state.visible,
                inner.members.iter().map(|m| m.media.clone()).collect::<Vec<_>>(),
            )
        };
        let samples = sample(&media);
        match tick(visible, &samples, &self.policy) {
            TickOutcome::Skipped(reason) => trace!("correction skipped: {:?}", reason),
            TickOutcome::Corrected(moves) => {
                for (i, target) in &moves {
                    media[*i].set_current_time(*target);
                }
                if !moves.is_empty() {
                    debug!("corrected {} of {} members", moves.len(), media.len());
                }
            }
        }
        self.lock().ticks += 1;
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
    }
}

fn sample(media: &[Arc<dyn MediaElement>]) -> Vec<MemberSample> {
    media
        .iter()
        .map(|m| MemberSample {
            time: m.current_time(),
            ready: m.ready_state(),
        })
        .collect()
}

/// One mounted group of videos played as a single animation. The first
/// registered member is the master. Groups are fully independent.
pub struct PhaseSynchronizer {
    shared: Arc<Shared>,
}

impl PhaseSynchronizer {
    pub fn new(platform: Arc<dyn Platform>, policy: SyncPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(PhaseSynchronizer {
            shared: Arc::new(Shared {
                policy,
                platform,
                inner: Mutex::new(Inner {
                    state: GroupState::default(),
                    members: Vec::new(),
                    ticker: None,
                    ticks: 0,
                }),
            }),
        })
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.shared.policy
    }

    /// Add a member. Re-registering a key replaces its media but keeps its
    /// readiness for the rest of the mount.
    pub async fn register(&self, key: &str, media: Arc<dyn MediaElement>) {
        let event = {
            let mut inner = self.shared.lock();
            match inner.members.iter_mut().find(|m| m.key == key) {
                Some(existing) => existing.media = media,
                None => inner.members.push(Member {
                    key: key.to_string(),
                    media,
                    ready: false,
                }),
            }
            members_event(&inner)
        };
        self.dispatch(event).await;
    }

    pub async fn unregister(&self, key: &str) {
        let event = {
            let mut inner = self.shared.lock();
            inner.members.retain(|m| m.key != key);
            members_event(&inner)
        };
        self.dispatch(event).await;
    }

    /// The member decoded its first frame. Readiness is never withdrawn.
    pub async fn mark_ready(&self, key: &str) {
        let event = {
            let mut inner = self.shared.lock();
            match inner.members.iter_mut().find(|m| m.key == key) {
                Some(m) if !m.ready => m.ready = true,
                Some(_) => return,
                None => {
                    warn!("readiness for unknown member {}", key);
                    return;
                }
            }
            members_event(&inner)
        };
        self.dispatch(event).await;
    }

    /// Feed the latest intersection ratio of the group's container.
    pub async fn set_intersection(&self, ratio: f64) {
        let visible = self.shared.policy.is_visible(ratio);
        self.dispatch(SyncEvent::Visibility(visible)).await;
    }

    /// Stop everything. Later calls and events are ignored.
    pub async fn unmount(&self) {
        self.dispatch(SyncEvent::Unmount).await;
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.lock().state.phase
    }

    pub fn is_correcting(&self) -> bool {
        self.shared.lock().ticker.is_some()
    }

    /// Completed correction passes so far.
    pub fn ticks(&self) -> u64 {
        self.shared.lock().ticks
    }

    /// Current time of every member, master first.
    pub fn member_times(&self) -> Vec<f64> {
        self.media().iter().map(|m| m.current_time()).collect()
    }

    pub fn drift(&self) -> f64 {
        max_drift(&self.member_times())
    }

    fn media(&self) -> Vec<Arc<dyn MediaElement>> {
        self.shared.lock().members.iter().map(|m| m.media.clone()).collect()
    }

    fn is_mounted(&self) -> bool {
        self.shared.lock().state.mounted
    }

    fn is_starting(&self) -> bool {
        let inner = self.shared.lock();
        inner.state.mounted && inner.state.phase == SyncPhase::Starting
    }

    fn pause_all(&self) {
        self.media().iter().for_each(|m| m.pause());
    }

    async fn dispatch(&self, event: SyncEvent) {
        let mut queue: VecDeque<SyncCommand> = {
            let mut inner = self.shared.lock();
            let (next, commands) = transition(&inner.state, event);
            if next.phase != inner.state.phase {
                debug!("sync group {:?} -> {:?} on {:?}", inner.state.phase, next.phase, event);
            }
            inner.state = next;
            commands.into()
        };
        while let Some(command) = queue.pop_front() {
            match command {
                SyncCommand::RunStart => {
                    if !self.run_start().await || !self.is_starting() {
                        debug!("start sequence abandoned, pausing members");
                        self.pause_all();
                        queue.clear();
                        continue;
                    }
                    let mut inner = self.shared.lock();
                    let (next, commands) = transition(&inner.state, SyncEvent::StartSettled);
                    debug!("start settled, group {:?} -> {:?}", inner.state.phase, next.phase);
                    inner.state = next;
                    queue.extend(commands);
                }
                SyncCommand::StartLoop => self.start_loop(),
                SyncCommand::StopLoop => self.stop_loop(),
                SyncCommand::SnapToMaster => self.snap(),
                SyncCommand::PauseAll => self.pause_all(),
                SyncCommand::PlayAll => {
                    self.play_all().await;
                    if !self.is_mounted() {
                        self.pause_all();
                        queue.clear();
                    }
                }
            }
        }
    }

    /// Pause, rewind, wait a frame, play together, then snap. Returns `false`
    /// when the group stopped starting (unmounted) while a step was pending.
    async fn run_start(&self) -> bool {
        let media = self.media();
        for m in &media {
            m.pause();
        }
        join_all(media.iter().map(|m| m.seek(0.0))).await;
        if !self.is_starting() {
            return false;
        }
        self.shared.platform.next_frame().await;
        if !self.is_starting() {
            return false;
        }
        self.play_all().await;
        if !self.is_starting() {
            return false;
        }
        self.snap();
        true
    }

    async fn play_all(&self) {
        let media = self.media();
        for (i, result) in join_all(media.iter().map(|m| m.play())).await.into_iter().enumerate() {
            if let Err(e) = result {
                warn!("member {} refused to play: {}", i, e);
            }
        }
    }

    fn snap(&self) {
        let media = self.media();
        for (i, target) in super::snap_targets(&sample(&media), self.shared.policy.start_tolerance) {
            media[i].set_current_time(target);
        }
    }

    fn start_loop(&self) {
        let mut inner = self.shared.lock();
        if inner.ticker.is_some() || inner.members.len() < 2 || !inner.state.mounted {
            return;
        }
        let period = self.shared.policy.period();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        inner.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.correct();
            }
        }));
        debug!("correction loop started ({:?})", period);
    }

    fn stop_loop(&self) {
        if let Some(ticker) = self.shared.lock().ticker.take() {
            ticker.abort();
            debug!("correction loop stopped");
        }
    }
}

fn members_event(inner: &Inner) -> SyncEvent {
    SyncEvent::Members {
        members: inner.members.len(),
        ready: inner.members.iter().filter(|m| m.ready).count(),
    }
}
