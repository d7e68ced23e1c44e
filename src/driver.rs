use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{PostframeError, PostframeResult};

/// Export capture rate, frames per second.
pub const EXPORT_FPS: u32 = 30;

/// Shared cancellation flag for an in-flight export.
///
/// Cloned handles observe the same flag; cancellation is cooperative and
/// checked at the top of every tick.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Stopped(StopReason),
    Errored,
}

/// Pacing strategy for the capture loop.
pub trait FrameClock {
    /// Block until `frame` is due. Frame 0 starts the clock.
    fn wait_for_frame(&mut self, frame: u64, fps: u32);
}

/// Wall-clock pacing: each frame waits until `frame / fps` seconds have
/// elapsed since the first tick.
#[derive(Debug, Default)]
pub struct RealtimeClock {
    start: Option<Instant>,
}

impl RealtimeClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameClock for RealtimeClock {
    fn wait_for_frame(&mut self, frame: u64, fps: u32) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let target = Duration::from_secs_f64(frame as f64 / f64::from(fps.max(1)));
        let elapsed = start.elapsed();
        if elapsed < target {
            std::thread::sleep(target - elapsed);
        }
    }
}

/// No pacing; frames are produced as fast as they render. This is the
/// export default: output timing comes from the container's frame rate,
/// not from wall-clock capture.
#[derive(Debug, Default)]
pub struct OfflineClock;

impl FrameClock for OfflineClock {
    fn wait_for_frame(&mut self, _frame: u64, _fps: u32) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriveStats {
    pub frames_produced: u64,
    pub reason: StopReason,
}

/// Paces repeated frame production over the media duration.
///
/// States: idle → running → stopped(completed) | stopped(cancelled); a tick
/// error moves to errored and propagates. Progress is monotone, capped at
/// 95 while capturing; 100 belongs to the caller and only after natural
/// completion.
pub struct FrameDriver {
    fps: u32,
    state: DriverState,
    cancel: CancelToken,
}

impl FrameDriver {
    pub fn new(fps: u32, cancel: CancelToken) -> PostframeResult<Self> {
        if fps == 0 {
            return Err(PostframeError::validation("driver fps must be > 0"));
        }
        Ok(Self {
            fps,
            state: DriverState::Idle,
            cancel,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Run the capture loop for `duration_secs` of media time.
    ///
    /// `tick` is called once per frame with (frame index, media time);
    /// `progress` after every produced frame with a value in [0, 95].
    pub fn run(
        &mut self,
        duration_secs: f64,
        clock: &mut dyn FrameClock,
        tick: &mut dyn FnMut(u64, f64) -> PostframeResult<()>,
        progress: &mut dyn FnMut(f32),
    ) -> PostframeResult<DriveStats> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(PostframeError::validation(
                "drive duration must be finite and > 0",
            ));
        }

        let total_frames = (duration_secs * f64::from(self.fps)).ceil().max(1.0) as u64;
        self.state = DriverState::Running;

        let mut frame: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.state = DriverState::Stopped(StopReason::Cancelled);
                return Ok(DriveStats {
                    frames_produced: frame,
                    reason: StopReason::Cancelled,
                });
            }

            let t = frame as f64 / f64::from(self.fps);
            if t >= duration_secs {
                break;
            }

            clock.wait_for_frame(frame, self.fps);
            if let Err(e) = tick(frame, t) {
                self.state = DriverState::Errored;
                return Err(e);
            }

            frame += 1;
            let pct = ((frame as f64 / total_frames as f64) * 100.0).min(95.0) as f32;
            progress(pct);
        }

        self.state = DriverState::Stopped(StopReason::Completed);
        Ok(DriveStats {
            frames_produced: frame,
            reason: StopReason::Completed,
        })
    }
}
