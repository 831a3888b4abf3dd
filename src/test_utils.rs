//! Shared test doubles: a scripted in-process core, an in-memory VFS, and
//! recording sinks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::abi::{PixelFormat, Region};
use crate::binding::{AvInfo, Core, CoreInfo, CoreSinks};
use crate::environment::HostEnvironment;
use crate::playback::sinks::{AudioSink, InputSink, VideoSink};
use crate::strategy::{GameData, GameFile};
use crate::vfs::Vfs;

// ============================================================================
// Scripted core
// ============================================================================

/// What a load attempt handed to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRecord {
    Path(PathBuf),
    Buffer(usize),
}

#[derive(Default)]
struct ScriptedState {
    frames_run: u32,
    state_len: usize,
    refuse_loads: u32,
    fail_serializes: u32,
    load_log: Vec<LoadRecord>,
    av: AvInfo,
    shutdown_at_frame: Option<u32>,
    environment: Option<Arc<HostEnvironment>>,
    ports: Vec<(u32, u32)>,
}

/// Observer half of a [`ScriptedCore`], usable after the core has been
/// boxed and moved into an engine.
#[derive(Clone)]
pub struct ScriptedHandle {
    shared: Arc<Mutex<ScriptedState>>,
}

impl ScriptedHandle {
    pub fn frames_run(&self) -> u32 {
        self.shared.lock().unwrap().frames_run
    }

    pub fn load_log(&self) -> Vec<LoadRecord> {
        self.shared.lock().unwrap().load_log.clone()
    }

    pub fn ports(&self) -> Vec<(u32, u32)> {
        self.shared.lock().unwrap().ports.clone()
    }

    /// The core's current serialized state, recomputed the same way the
    /// core itself serializes it.
    pub fn state_snapshot(&self) -> Vec<u8> {
        let state = self.shared.lock().unwrap();
        scripted_state_bytes(state.frames_run, state.state_len)
    }
}

/// Deterministic emulated state: a pure function of the frame counter,
/// so any two moments with the same counter serialize identically.
fn scripted_state_bytes(counter: u32, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    if len >= 4 {
        bytes[..4].copy_from_slice(&counter.to_le_bytes());
    }
    for (i, b) in bytes.iter_mut().enumerate().skip(4) {
        *b = (counter as u8).wrapping_mul(31).wrapping_add(i as u8);
    }
    bytes
}

/// In-process [`Core`] with scriptable behavior, standing in for a real
/// shared object.
pub struct ScriptedCore {
    info: CoreInfo,
    shared: Arc<Mutex<ScriptedState>>,
    sinks: Option<CoreSinks>,
}

impl ScriptedCore {
    pub fn new(info: CoreInfo) -> Self {
        let shared = ScriptedState {
            state_len: 64,
            av: AvInfo {
                base_width: 256,
                base_height: 224,
                max_width: 512,
                max_height: 448,
                aspect_ratio: 4.0 / 3.0,
                fps: 60.0,
                sample_rate: 48_000.0,
            },
            ..Default::default()
        };
        Self {
            info,
            shared: Arc::new(Mutex::new(shared)),
            sinks: None,
        }
    }

    pub fn handle(&self) -> ScriptedHandle {
        ScriptedHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn set_av_info(&mut self, av: AvInfo) {
        self.shared.lock().unwrap().av = av;
    }

    pub fn av(&self) -> AvInfo {
        self.shared.lock().unwrap().av
    }

    /// Serialized state size; zero disables serialization entirely.
    pub fn set_state_len(&mut self, len: usize) {
        self.shared.lock().unwrap().state_len = len;
    }

    /// Make the next `n` load attempts fail, as a picky core would.
    pub fn refuse_next_loads(&mut self, n: u32) {
        self.shared.lock().unwrap().refuse_loads = n;
    }

    pub fn load_attempts(&self) -> usize {
        self.shared.lock().unwrap().load_log.len()
    }

    pub fn fail_next_serialize(&mut self) {
        self.shared.lock().unwrap().fail_serializes = 1;
    }

    /// Raise a shutdown environment request when the given frame runs.
    pub fn shutdown_at_frame(&mut self, frame: u32, environment: Arc<HostEnvironment>) {
        let mut state = self.shared.lock().unwrap();
        state.shutdown_at_frame = Some(frame);
        state.environment = Some(environment);
    }

    pub fn state_snapshot(&self) -> Vec<u8> {
        self.handle().state_snapshot()
    }
}

impl Core for ScriptedCore {
    fn info(&self) -> &CoreInfo {
        &self.info
    }

    fn attach(&mut self, sinks: CoreSinks) {
        self.sinks = Some(sinks);
    }

    fn load_game(&mut self, game: &GameData) -> bool {
        let mut state = self.shared.lock().unwrap();
        state.load_log.push(match game {
            GameData::Path(path) => LoadRecord::Path(path.clone()),
            GameData::Buffer(bytes) => LoadRecord::Buffer(bytes.len()),
        });
        if state.refuse_loads > 0 {
            state.refuse_loads -= 1;
            return false;
        }
        true
    }

    fn unload_game(&mut self) {}

    fn av_info(&mut self) -> AvInfo {
        self.shared.lock().unwrap().av
    }

    fn run(&mut self) {
        let (frame, shutdown, environment) = {
            let mut state = self.shared.lock().unwrap();
            state.frames_run += 1;
            (
                state.frames_run,
                state.shutdown_at_frame,
                state.environment.clone(),
            )
        };
        if shutdown == Some(frame)
            && let Some(environment) = environment
        {
            environment.request_shutdown();
        }
        if let Some(sinks) = &mut self.sinks {
            // One video frame, a small audio batch, and an input poll per
            // emulated frame, the way a real core drives its host.
            let pixels = vec![frame as u8; 16];
            (sinks.video)(Some(&pixels), 4, 2, 8);
            let samples = vec![frame as i16; 32 * 2];
            (sinks.audio)(&samples, 32);
            let _ = (sinks.input)(0, crate::abi::DEVICE_JOYPAD, 0, 0);
        }
    }

    fn reset(&mut self) {
        self.shared.lock().unwrap().frames_run = 0;
    }

    fn serialize_size(&mut self) -> usize {
        self.shared.lock().unwrap().state_len
    }

    fn serialize(&mut self, state: &mut [u8]) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.fail_serializes > 0 {
            shared.fail_serializes -= 1;
            return false;
        }
        if state.len() != shared.state_len {
            return false;
        }
        state.copy_from_slice(&scripted_state_bytes(shared.frames_run, shared.state_len));
        true
    }

    fn unserialize(&mut self, state: &[u8]) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if state.len() != shared.state_len || state.len() < 4 {
            return false;
        }
        shared.frames_run = u32::from_le_bytes(state[..4].try_into().unwrap());
        true
    }

    fn set_controller_port_device(&mut self, port: u32, device: u32) {
        self.shared.lock().unwrap().ports.push((port, device));
    }

    fn region(&mut self) -> Option<Region> {
        Some(Region::Ntsc)
    }
}

// ============================================================================
// In-memory VFS
// ============================================================================

/// `Vfs` backed by maps, for resolver tests.
#[derive(Default)]
pub struct MemoryVfs {
    files: HashMap<PathBuf, Vec<u8>>,
    archives: HashMap<PathBuf, Vec<(String, Vec<u8>)>>,
}

impl MemoryVfs {
    pub fn insert(&mut self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.files.insert(path.into(), bytes);
    }

    pub fn insert_archive(&mut self, path: impl Into<PathBuf>, entries: &[(&str, &[u8])]) {
        self.archives.insert(
            path.into(),
            entries
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
        );
    }
}

impl Vfs for MemoryVfs {
    fn len(&self, file: &GameFile) -> Result<u64> {
        self.read(file).map(|bytes| bytes.len() as u64)
    }

    fn read(&self, file: &GameFile) -> Result<Vec<u8>> {
        match file {
            GameFile::Local { path } => match self.files.get(path) {
                Some(bytes) => Ok(bytes.clone()),
                None => bail!("no such file: {}", path.display()),
            },
            GameFile::ArchiveMember { archive, inner } => {
                let entries = self
                    .archives
                    .get(archive)
                    .ok_or_else(|| anyhow::anyhow!("no such archive: {}", archive.display()))?;
                entries
                    .iter()
                    .find(|(name, _)| name == inner)
                    .map(|(_, data)| data.clone())
                    .ok_or_else(|| anyhow::anyhow!("no entry {inner}"))
            }
            GameFile::Remote { url } => bail!("remote file unreachable: {url}"),
        }
    }

    fn list_archive(&self, archive: &Path) -> Result<Vec<String>> {
        match self.archives.get(archive) {
            Some(entries) => Ok(entries.iter().map(|(name, _)| name.clone()).collect()),
            None => bail!("no such archive: {}", archive.display()),
        }
    }
}

// ============================================================================
// Recording sinks
// ============================================================================

/// Video sink that counts everything it is told.
#[derive(Default)]
pub struct RecordingVideo {
    pub started_fps: Mutex<Vec<f64>>,
    pub stops: AtomicU32,
    pub pauses: AtomicU32,
    pub unpauses: AtomicU32,
    pub frames: AtomicU32,
    pub tickles: AtomicU32,
    pub fullscreen: Mutex<Option<bool>>,
    pub pixel_formats: Mutex<Vec<PixelFormat>>,
}

impl VideoSink for RecordingVideo {
    fn start(&self, fps: f64) {
        self.started_fps.lock().unwrap().push(fps);
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }
    fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::SeqCst);
    }
    fn enable_fullscreen(&self, fullscreen: bool) {
        *self.fullscreen.lock().unwrap() = Some(fullscreen);
    }
    fn set_pixel_format(&self, format: PixelFormat) {
        self.pixel_formats.lock().unwrap().push(format);
    }
    fn send_frame(&self, data: Option<&[u8]>, _width: u32, _height: u32, _pitch: usize) {
        assert!(data.is_some(), "dupe frames are dropped before the sink");
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
    fn tickle(&self) {
        self.tickles.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audio sink that counts batches and sample frames.
#[derive(Default)]
pub struct RecordingAudio {
    pub started_rate: Mutex<Option<i32>>,
    pub stops: AtomicU32,
    pub batches: AtomicU32,
    pub total_frames: AtomicI64,
}

impl AudioSink for RecordingAudio {
    fn start(&self, sample_rate: i32) {
        *self.started_rate.lock().unwrap() = Some(sample_rate);
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn pause(&self) {}
    fn unpause(&self) {}
    fn send_frames(&self, samples: Vec<i16>, frames: usize) {
        assert_eq!(samples.len(), frames * 2);
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.total_frames.fetch_add(frames as i64, Ordering::SeqCst);
    }
}

/// Input sink answering a fixed value.
#[derive(Default)]
pub struct RecordingInput {
    pub begins: AtomicU32,
    pub finishes: AtomicU32,
    pub queries: AtomicU32,
}

impl InputSink for RecordingInput {
    fn begin(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }
    fn finish(&self) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
    }
    fn query(&self, _port: u32, _device: u32, _index: u32, _id: u32) -> i16 {
        self.queries.fetch_add(1, Ordering::SeqCst);
        0
    }
}
