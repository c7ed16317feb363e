//! Media element surface for frame capture and playback control

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum MediaState {
    Playing,
    Paused,
    Ended,
}

/// The HTML media ready-state ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Whether a frame for the current position has been decoded.
    pub fn has_current_frame(self) -> bool {
        self >= ReadyState::HaveCurrentData
    }
}

/// A decoded still frame (tightly packed RGBA8).
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// A live, independently buffering media element.
///
/// Times are in seconds. `set_current_time` starts a seek and returns at once;
/// `seek` resolves when the element reports the seek finished.
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn ready_state(&self) -> ReadyState;
    fn current_time(&self) -> f64;
    fn set_current_time(&self, seconds: f64);
    async fn seek(&self, seconds: f64);
    async fn play(&self) -> Result<()>;
    fn pause(&self);
    fn state(&self) -> MediaState;
    /// Intrinsic video size; `(0, 0)` while metadata is unknown.
    fn intrinsic_size(&self) -> (u32, u32);
    /// Read back the frame at the current position.
    fn current_frame(&self) -> Result<VideoFrame>;
}

#[derive(Debug)]
struct Clock {
    state: MediaState,
    ready: ReadyState,
    position: f64,
    anchor: Option<Instant>,
}

/// Deterministic video driven by tokio's clock.
///
/// Playback advances at `rate` media seconds per wall second and loops over
/// `duration`. Seeks and play requests take a configurable latency, which is
/// what makes independently started members drift apart.
#[derive(Debug)]
pub struct SimulatedVideo {
    clock: Mutex<Clock>,
    rate: f64,
    duration: f64,
    seek_latency: Duration,
    play_latency: Duration,
    size: (u32, u32),
    color: [u8; 4],
    tainted: bool,
}

impl SimulatedVideo {
    pub fn new() -> Self {
        SimulatedVideo {
            clock: Mutex::new(Clock {
                state: MediaState::Paused,
                ready: ReadyState::HaveNothing,
                position: 0.0,
                anchor: None,
            }),
            rate: 1.0,
            duration: 4.0,
            seek_latency: Duration::ZERO,
            play_latency: Duration::ZERO,
            size: (80, 80),
            color: [255, 196, 0, 255],
            tainted: false,
        }
    }

    /// Playback speed relative to the wall clock (1.0 is nominal).
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = seconds.max(0.001);
        self
    }

    pub fn with_latency(mut self, seek: Duration, play: Duration) -> Self {
        self.seek_latency = seek;
        self.play_latency = play;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    pub fn with_color(mut self, rgba: [u8; 4]) -> Self {
        self.color = rgba;
        self
    }

    /// Frames from this video cannot be read back (cross-origin without CORS).
    pub fn tainted(mut self) -> Self {
        self.tainted = true;
        self
    }

    pub fn with_ready_state(self, ready: ReadyState) -> Self {
        self.set_ready_state(ready);
        self
    }

    pub fn set_ready_state(&self, ready: ReadyState) {
        self.lock().ready = ready;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position_at(&self, clock: &Clock, now: Instant) -> f64 {
        let raw = match clock.anchor {
            Some(anchor) => clock.position + now.duration_since(anchor).as_secs_f64() * self.rate,
            None => clock.position,
        };
        raw % self.duration
    }
}

impl Default for SimulatedVideo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaElement for SimulatedVideo {
    fn ready_state(&self) -> ReadyState {
        self.lock().ready
    }

    fn current_time(&self) -> f64 {
        let clock = self.lock();
        self.position_at(&clock, Instant::now())
    }

    fn set_current_time(&self, seconds: f64) {
        let mut clock = self.lock();
        clock.position = seconds.rem_euclid(self.duration);
        if clock.anchor.is_some() {
            clock.anchor = Some(Instant::now());
        }
    }

    async fn seek(&self, seconds: f64) {
        if (self.current_time() - seconds).abs() < 0.001 {
            return;
        }
        if !self.seek_latency.is_zero() {
            tokio::time::sleep(self.seek_latency).await;
        }
        self.set_current_time(seconds);
    }

    async fn play(&self) -> Result<()> {
        let ready = self.lock().ready;
        if ready == ReadyState::HaveNothing {
            return Err(Error::MediaError("no media data to play".into()));
        }
        if !self.play_latency.is_zero() {
            tokio::time::sleep(self.play_latency).await;
        }
        let mut clock = self.lock();
        if clock.state != MediaState::Playing {
            clock.state = MediaState::Playing;
            clock.anchor = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&self) {
        let mut clock = self.lock();
        let now = Instant::now();
        clock.position = self.position_at(&clock, now);
        clock.anchor = None;
        clock.state = MediaState::Paused;
    }

    fn state(&self) -> MediaState {
        self.lock().state.clone()
    }

    fn intrinsic_size(&self) -> (u32, u32) {
        if self.lock().ready >= ReadyState::HaveMetadata {
            self.size
        } else {
            (0, 0)
        }
    }

    fn current_frame(&self) -> Result<VideoFrame> {
        if !self.lock().ready.has_current_frame() {
            return Err(Error::MediaError("no decoded frame at the current position".into()));
        }
        if self.tainted {
            return Err(Error::SecurityError("frame readout blocked for cross-origin media".into()));
        }
        let (width, height) = self.size;
        let rgba = self
            .color
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Ok(VideoFrame { width, height, rgba })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simulated_video_transitions_state() {
        let v = SimulatedVideo::new().with_ready_state(ReadyState::HaveEnoughData);
        assert_eq!(v.state(), MediaState::Paused);
        v.play().await.unwrap();
        assert_eq!(v.state(), MediaState::Playing);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((v.current_time() - 0.5).abs() < 1e-6);
        v.pause();
        assert_eq!(v.state(), MediaState::Paused);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((v.current_time() - 0.5).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_skew_accumulates_drift() {
        let fast = SimulatedVideo::new()
            .with_rate(1.1)
            .with_ready_state(ReadyState::HaveEnoughData);
        fast.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((fast.current_time() - 1.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn play_without_data_is_rejected() {
        let v = SimulatedVideo::new();
        assert!(v.play().await.is_err());
        assert_eq!(v.intrinsic_size(), (0, 0));
    }

    #[test]
    fn tainted_frames_are_blocked() {
        let v = SimulatedVideo::new()
            .tainted()
            .with_ready_state(ReadyState::HaveEnoughData);
        assert!(matches!(v.current_frame(), Err(Error::SecurityError(_))));
    }

    #[test]
    fn frame_has_intrinsic_size() {
        let v = SimulatedVideo::new()
            .with_size(4, 2)
            .with_ready_state(ReadyState::HaveCurrentData);
        let f = v.current_frame().unwrap();
        assert_eq!((f.width, f.height), (4, 2));
        assert_eq!(f.rgba.len(), 32);
    }
}
