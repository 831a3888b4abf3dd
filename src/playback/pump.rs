//! The frame pump: one worker thread that clocks the core in real time.
//!
//! The pump owns the only calls to `run` for the life of a session. It
//! suspends in exactly two places, the wall-clock wait for the next
//! frame's presentation time and the pause wait, and both wake promptly
//! when the engine aborts the session.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::sinks::{AudioSink, InputSink, VideoSink};
use super::{GameSession, PumpControls, SPEED_PAUSED};

pub(crate) struct PumpContext {
    pub session: Arc<Mutex<GameSession>>,
    pub controls: Arc<PumpControls>,
    pub video: Arc<dyn VideoSink>,
    pub audio: Arc<dyn AudioSink>,
    pub input: Arc<dyn InputSink>,
    /// Rate-aligned framerate to clock the core at.
    pub fps: f64,
    /// Integer sample rate for the audio sink, or None to play silent.
    pub sample_rate: Option<i32>,
    pub fullscreen: bool,
}

pub(crate) fn run(ctx: PumpContext) {
    ctx.video.enable_fullscreen(ctx.fullscreen);
    if let Some(sample_rate) = ctx.sample_rate {
        ctx.audio.start(sample_rate);
    }
    ctx.video.start(ctx.fps);
    ctx.input.begin();

    let frame_period = Duration::from_secs_f64(1.0 / ctx.fps);
    let mut next_pts = Instant::now() + frame_period;
    tracing::debug!("frame pump running at {:.4} fps", ctx.fps);

    while !ctx.controls.aborted() {
        let speed = ctx.controls.speed();
        if speed <= SPEED_PAUSED {
            ctx.video.pause();
            ctx.audio.pause();
            ctx.controls.wait_while_paused();
            if ctx.controls.aborted() {
                break;
            }
            // The clock stood still while we did; restart it.
            next_pts = Instant::now() + frame_period;
            ctx.video.unpause();
            ctx.audio.unpause();
            continue;
        }

        {
            // One frame. The core drives the attached callbacks from
            // inside `run`; the capture right after keeps the rewind log
            // in lockstep with executed frames.
            let mut session = ctx.session.lock().unwrap();
            let GameSession { core, rewind } = &mut *session;
            core.run();
            if let Some(rewind) = rewind {
                rewind.capture(core.as_mut());
            }
        }
        ctx.video.tickle();

        ctx.controls.sleep_until(next_pts);
        // At 2000 permille the deadline advances half a period per frame,
        // at 500 it advances two.
        next_pts += frame_period.mul_f64(1000.0 / f64::from(speed));
    }

    ctx.video.stop();
    ctx.audio.stop();
    ctx.input.finish();
    tracing::debug!("frame pump stopped");
}
