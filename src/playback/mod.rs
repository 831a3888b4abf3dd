//! The playback engine: opens a core against a game file, clocks it on a
//! dedicated worker thread, routes its callbacks to the host sinks, and
//! exposes transport controls (pause, speed, backward seeks) on top of
//! the rewind log.
//!
//! Public operations serialize on one engine-level lock, so they are
//! atomic with respect to each other. The frame pump never takes that
//! lock; it shares only the session lock (core + rewind log) and the
//! lock-free controls with the controller side.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::abi::{self, PixelFormat};
use crate::binding::{Core, CoreHandle, CoreLoadError, CoreSinks};
use crate::config::{OpenOptions, PlayerSettings};
use crate::environment::HostEnvironment;
use crate::rewind::RewindBuffer;
use crate::strategy::{self, GameFile};
use crate::vfs::{LocalVfs, Vfs};

mod pump;
pub mod sinks;

use sinks::{AudioSink, InputSink, VideoSink};

/// Playback speed in permille of real time. Zero pauses; reverse motion
/// goes through the rewind log, never through negative speeds.
pub const SPEED_PAUSED: i32 = 0;
pub const SPEED_NORMAL: i32 = 1000;

/// Why an open attempt failed. All of these are fatal for the attempt;
/// the engine is back in the idle state when one is returned.
#[derive(Debug)]
pub enum OpenError {
    /// The core shared object does not exist.
    CoreNotFound { path: PathBuf },
    /// The core could not be bound (unloadable library, missing symbol).
    CoreLoadFailed { message: String },
    /// The core implements a different contract revision than the host.
    ApiVersionMismatch { core: u32, host: u32 },
    /// Every applicable presentation strategy was tried and refused.
    FileRejectedByAllStrategies,
    /// The core reported a framerate outside the playable range.
    InvalidFrameRate { fps: f64 },
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoreNotFound { path } => write!(f, "core not found: {}", path.display()),
            Self::CoreLoadFailed { message } => write!(f, "core load failed: {message}"),
            Self::ApiVersionMismatch { core, host } => {
                write!(f, "core API version {core} does not match host version {host}")
            }
            Self::FileRejectedByAllStrategies => {
                write!(f, "file was rejected by every load strategy")
            }
            Self::InvalidFrameRate { fps } => write!(f, "core reported invalid framerate {fps}"),
        }
    }
}

impl std::error::Error for OpenError {}

impl From<CoreLoadError> for OpenError {
    fn from(e: CoreLoadError) -> Self {
        match e {
            CoreLoadError::LibraryNotFound { path } => Self::CoreNotFound { path },
            CoreLoadError::ApiVersionMismatch { core, host } => {
                Self::ApiVersionMismatch { core, host }
            }
            other => Self::CoreLoadFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Shared flags and the pause/sleep rendezvous between the controller
/// side and the frame pump.
pub(crate) struct PumpControls {
    abort: AtomicBool,
    speed_permille: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl PumpControls {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            speed_permille: AtomicI32::new(SPEED_NORMAL),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn speed(&self) -> i32 {
        self.speed_permille.load(Ordering::SeqCst)
    }

    fn set_speed(&self, permille: i32) {
        self.speed_permille.store(permille, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Block until unpaused or aborted.
    pub(crate) fn wait_while_paused(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.speed() <= SPEED_PAUSED && !self.aborted() {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Sleep until the deadline, waking early on abort.
    pub(crate) fn sleep_until(&self, deadline: Instant) {
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.aborted() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let (next, _) = self.cond.wait_timeout(guard, remaining).unwrap();
            guard = next;
        }
    }
}

/// The core and its rewind log, guarded together: holding this lock is
/// what makes a rewind impossible to race against a frame advance.
pub(crate) struct GameSession {
    pub(crate) core: Box<dyn Core>,
    pub(crate) rewind: Option<RewindBuffer>,
}

struct ActiveSession {
    controls: Arc<PumpControls>,
    session: Arc<Mutex<GameSession>>,
    worker: Option<JoinHandle<()>>,
    /// Rate-aligned framerate the pump is clocking at.
    fps: f64,
}

/// The embeddable playback runtime.
pub struct PlaybackEngine {
    video: Arc<dyn VideoSink>,
    audio: Arc<dyn AudioSink>,
    input: Arc<dyn InputSink>,
    environment: Arc<HostEnvironment>,
    settings: PlayerSettings,
    vfs: Arc<dyn Vfs>,
    state: Mutex<Option<ActiveSession>>,
}

impl PlaybackEngine {
    pub fn new(
        video: Arc<dyn VideoSink>,
        audio: Arc<dyn AudioSink>,
        input: Arc<dyn InputSink>,
        settings: PlayerSettings,
    ) -> Self {
        let environment = Arc::new(HostEnvironment::new(&settings.variables));
        // Pixel format negotiation goes straight to the video sink, from
        // whichever thread the core raises it on.
        let sink = video.clone();
        environment.set_pixel_format_hook(Box::new(move |format| sink.set_pixel_format(format)));

        Self {
            video,
            audio,
            input,
            environment,
            settings,
            vfs: Arc::new(LocalVfs),
            state: Mutex::new(None),
        }
    }

    /// Replace the default local filesystem VFS.
    pub fn with_vfs(mut self, vfs: Arc<dyn Vfs>) -> Self {
        self.vfs = vfs;
        self
    }

    /// The environment service cores of this engine are bound against.
    pub fn environment(&self) -> &Arc<HostEnvironment> {
        &self.environment
    }

    /// Register the hook invoked when a core asks the application to stop
    /// playback. The engine itself keeps running until `close`.
    pub fn set_stop_request_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.environment.set_shutdown_hook(hook);
    }

    /// True once the current core has requested shutdown.
    pub fn stop_requested(&self) -> bool {
        self.environment.shutdown_requested()
    }

    /// Open a core library against a game file and start playback.
    /// Returns false on failure, with the reason logged; an already open
    /// session is closed first.
    pub fn open(&self, core_path: &Path, file: &GameFile, options: &OpenOptions) -> bool {
        match self.try_open(core_path, file, options) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("open failed for {}: {e}", file.display());
                false
            }
        }
    }

    pub fn try_open(
        &self,
        core_path: &Path,
        file: &GameFile,
        options: &OpenOptions,
    ) -> Result<(), OpenError> {
        self.close();
        let core = CoreHandle::load(
            core_path,
            self.environment.clone(),
            self.settings.allow_zip,
        )?;
        self.try_open_with_core(Box::new(core), file, options)
    }

    /// Like [`open`](Self::open) for a core the caller has already bound
    /// (or a scripted one in tests).
    pub fn open_with_core(
        &self,
        core: Box<dyn Core>,
        file: &GameFile,
        options: &OpenOptions,
    ) -> bool {
        match self.try_open_with_core(core, file, options) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("open failed for {}: {e}", file.display());
                false
            }
        }
    }

    pub fn try_open_with_core(
        &self,
        mut core: Box<dyn Core>,
        file: &GameFile,
        options: &OpenOptions,
    ) -> Result<(), OpenError> {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.take() {
            self.shutdown_session(active);
        }

        // Contract default until the core negotiates something else.
        self.video.set_pixel_format(PixelFormat::Xrgb1555);

        strategy::load_with_strategies(
            core.as_mut(),
            file,
            self.vfs.as_ref(),
            self.settings.prefer_vfs,
        )
        .ok_or(OpenError::FileRejectedByAllStrategies)?;

        let av = core.av_info();
        tracing::info!(
            "opened {}: {}x{} (max {}x{}), aspect {}, {} fps, {} Hz",
            file.display(),
            av.base_width,
            av.base_height,
            av.max_width,
            av.max_height,
            av.aspect_ratio,
            av.fps,
            av.sample_rate
        );
        if !(5.0..=100.0).contains(&av.fps) {
            // Dropping the core here unloads the game and deinitializes it.
            return Err(OpenError::InvalidFrameRate { fps: av.fps });
        }
        if let Some(region) = core.region() {
            tracing::info!("core region: {region:?}");
        }

        // Audio clocks the system: snap the sample rate to an integer and
        // scale the framerate to match, keeping A/V lock. An out-of-range
        // rate disables audio but leaves the framerate alone.
        let mut fps = av.fps;
        let sample_rate = if av.sample_rate <= 0.0 || av.sample_rate > 384_000.0 {
            tracing::warn!(
                "sample rate {} out of range, continuing without sound",
                av.sample_rate
            );
            None
        } else {
            let snapped = av.sample_rate as i32;
            if f64::from(snapped) != av.sample_rate {
                fps = fps * f64::from(snapped) / av.sample_rate;
                tracing::debug!(
                    "rate aligned: {} Hz -> {snapped} Hz, {} fps -> {fps} fps",
                    av.sample_rate,
                    av.fps
                );
            }
            Some(snapped)
        };

        let serialize_size = core.serialize_size();
        let rewind = if serialize_size > 0 {
            RewindBuffer::new(core.as_mut(), serialize_size, fps)
        } else {
            tracing::info!("core does not serialize state; rewind unavailable");
            None
        };

        core.set_controller_port_device(0, abi::DEVICE_JOYPAD);

        let controls = Arc::new(PumpControls::new());
        core.attach(self.make_sinks(&controls));

        let session = Arc::new(Mutex::new(GameSession { core, rewind }));
        let context = pump::PumpContext {
            session: session.clone(),
            controls: controls.clone(),
            video: self.video.clone(),
            audio: self.audio.clone(),
            input: self.input.clone(),
            fps,
            sample_rate,
            fullscreen: options.fullscreen,
        };
        let worker = std::thread::Builder::new()
            .name("playback-pump".to_string())
            .spawn(move || pump::run(context))
            .map_err(|e| OpenError::CoreLoadFailed {
                message: format!("failed to spawn frame pump: {e}"),
            })?;

        *state = Some(ActiveSession {
            controls,
            session,
            worker: Some(worker),
            fps,
        });
        Ok(())
    }

    /// The data callbacks installed on the core. These run re-entered
    /// from inside `run` on the pump thread and must stay lock-free
    /// towards the engine.
    fn make_sinks(&self, controls: &Arc<PumpControls>) -> CoreSinks {
        let video = self.video.clone();
        let audio = self.audio.clone();
        let input = self.input.clone();
        let speed = controls.clone();
        CoreSinks {
            video: Box::new(move |data, width, height, pitch| {
                // You don't know where that core's been: drop anything
                // with a zeroed argument.
                if let Some(data) = data
                    && width != 0
                    && height != 0
                    && pitch != 0
                {
                    video.send_frame(Some(data), width, height, pitch);
                }
            }),
            audio: Box::new(move |samples, frames| {
                // Fast-forward and slow-motion mute rather than warp.
                if frames == 0 || speed.speed() != SPEED_NORMAL {
                    return;
                }
                audio.send_frames(samples.to_vec(), frames);
            }),
            input: Box::new(move |port, device, index, id| input.query(port, device, index, id)),
        }
    }

    /// Stop playback and release the core. Idempotent.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.take() {
            self.shutdown_session(active);
        }
        true
    }

    fn shutdown_session(&self, mut active: ActiveSession) {
        active.controls.request_abort();
        if let Some(worker) = active.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("frame pump terminated abnormally");
        }
        self.environment.end_session();
        // Dropping the session drops the core: unload-game, deinit, then
        // the library mapping, in that order.
        drop(active);
        tracing::debug!("playback session closed");
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Toggle pause. Unpausing always returns to normal speed.
    pub fn pause(&self) {
        let state = self.state.lock().unwrap();
        let Some(active) = state.as_ref() else { return };
        if active.controls.speed() == SPEED_PAUSED {
            active.controls.set_speed(SPEED_NORMAL);
        } else {
            active.controls.set_speed(SPEED_PAUSED);
        }
    }

    /// Set the playback speed in permille: 1000 is real time, above is
    /// fast-forward, (0, 1000) is slow motion, 0 pauses.
    pub fn set_speed(&self, permille: i32) {
        let permille = if permille < 0 {
            tracing::warn!("negative speed {permille} requested; pausing instead");
            SPEED_PAUSED
        } else {
            permille
        };
        let state = self.state.lock().unwrap();
        if let Some(active) = state.as_ref() {
            active.controls.set_speed(permille);
        }
    }

    /// Current speed in permille, or 0 when nothing is open.
    pub fn speed(&self) -> i32 {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map_or(SPEED_PAUSED, |active| active.controls.speed())
    }

    /// Seek backward by the configured small or large step. Forward seeks
    /// do not exist; time only moves forward through execution.
    pub fn seek_backward(&self, large: bool) {
        let state = self.state.lock().unwrap();
        let Some(active) = state.as_ref() else { return };
        let secs = if large {
            self.settings.seek_large_step_secs
        } else {
            self.settings.seek_small_step_secs
        };
        let frames = (f64::from(secs) * active.fps) as usize;
        Self::rewind_frames(active, frames);
    }

    /// Seek so that the rewind log is `percent` full.
    pub fn seek_to_percent(&self, percent: f32) {
        let state = self.state.lock().unwrap();
        let Some(active) = state.as_ref() else { return };
        let mut session = active.session.lock().unwrap();
        let GameSession { core, rewind } = &mut *session;
        let Some(rewind) = rewind else { return };

        let target = (rewind.max_available() as f32 * percent / 100.0) as usize;
        let current = rewind.available();
        if current > target {
            rewind.rewind(core.as_mut(), current - target);
        }
    }

    /// Seek to an absolute time.
    ///
    /// The target is computed as `1000 * fps / ms`, faithfully preserving
    /// the long-standing behavior of the transport this engine replaces,
    /// even though it inverts the intuitive `ms * fps / 1000` mapping.
    pub fn seek_to_time(&self, ms: i64) {
        if ms <= 0 {
            return;
        }
        let state = self.state.lock().unwrap();
        let Some(active) = state.as_ref() else { return };
        let mut session = active.session.lock().unwrap();
        let GameSession { core, rewind } = &mut *session;
        let Some(rewind) = rewind else { return };

        let target = (1000.0 * active.fps / ms as f64) as usize;
        let current = rewind.available();
        if current > target {
            rewind.rewind(core.as_mut(), current - target);
        }
    }

    fn rewind_frames(active: &ActiveSession, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        let mut session = active.session.lock().unwrap();
        let GameSession { core, rewind } = &mut *session;
        let Some(rewind) = rewind else {
            tracing::debug!("rewind not supported for this game");
            return 0;
        };
        let rewound = rewind.rewind(core.as_mut(), frames);
        tracing::info!("rewound {rewound} of {frames} requested frames");
        rewound
    }

    /// Milliseconds of gameplay currently rewindable; doubles as the
    /// playback position within the rewind window.
    pub fn current_time_ms(&self) -> u64 {
        self.with_rewind(|rewind, fps| (1000.0 * rewind.available() as f64 / fps) as u64)
            .unwrap_or(0)
    }

    /// Size of the rewind window in milliseconds; zero when the loaded
    /// game does not support rewind.
    pub fn total_time_ms(&self) -> u64 {
        self.with_rewind(|rewind, fps| (1000.0 * rewind.max_available() as f64 / fps) as u64)
            .unwrap_or(0)
    }

    /// Fill level of the rewind window, 0..=100.
    pub fn current_percent(&self) -> f32 {
        self.with_rewind(|rewind, _| {
            if rewind.max_available() == 0 {
                0.0
            } else {
                rewind.available() as f32 * 100.0 / rewind.max_available() as f32
            }
        })
        .unwrap_or(0.0)
    }

    fn with_rewind<R>(&self, f: impl FnOnce(&RewindBuffer, f64) -> R) -> Option<R> {
        let state = self.state.lock().unwrap();
        let active = state.as_ref()?;
        let session = active.session.lock().unwrap();
        session.rewind.as_ref().map(|rewind| f(rewind, active.fps))
    }

    /// Reset the emulated system, like the console's reset button.
    pub fn reset(&self) {
        let state = self.state.lock().unwrap();
        if let Some(active) = state.as_ref() {
            active.session.lock().unwrap().core.reset();
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}
