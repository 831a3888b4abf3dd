//! Dynamic-library binding for emulator cores.
//!
//! `CoreHandle` wraps one loaded core shared object: it resolves the full
//! symbol table up front, verifies the API version, discovers the core's
//! capabilities, and guarantees teardown ordering (unload-game, deinit,
//! then the library itself) exactly once. The [`Core`] trait is the seam
//! the playback engine works against, so tests can substitute a scripted
//! in-process core for a real shared object.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uint};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use libloading::Library;

use crate::abi::{self, Region, retro_game_info, retro_system_av_info, retro_system_info};
use crate::environment::HostEnvironment;
use crate::strategy::GameData;

mod trampoline;

use trampoline::{DispatchGuard, DispatchState};

/// Controller ports the host will address.
pub const MAX_PLAYERS: u32 = 4;

/// Capabilities and identity discovered when a core library is loaded.
#[derive(Debug, Clone)]
pub struct CoreInfo {
    pub name: String,
    pub version: String,
    /// Accepted extensions, lowercased and dot-prefixed. Empty means the
    /// core is willing to try anything.
    pub valid_extensions: Vec<String>,
    /// The core must be handed a filesystem path, never a buffer.
    pub needs_full_path: bool,
    /// The host must not extract archives on the core's behalf.
    pub block_extract: bool,
}

impl CoreInfo {
    /// Parse the core's pipe-separated extension list. `zip` is dropped
    /// unless explicitly allowed; cores routinely claim zip support they
    /// do not have.
    pub(crate) fn parse_extensions(list: &str, allow_zip: bool) -> Vec<String> {
        let mut extensions = Vec::new();
        for raw in list.split('|') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let ext = raw.to_lowercase();
            if ext == "zip" && !allow_zip {
                continue;
            }
            let ext = format!(".{ext}");
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        extensions
    }

    /// Case-insensitive extension test; `ext` includes the leading dot.
    /// An empty accepted set matches everything.
    pub fn accepts_extension(&self, ext: &str) -> bool {
        if self.valid_extensions.is_empty() {
            return true;
        }
        let ext = ext.to_lowercase();
        self.valid_extensions.iter().any(|e| *e == ext)
    }
}

/// Audio/video format descriptor read after a game is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvInfo {
    pub base_width: u32,
    pub base_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub aspect_ratio: f32,
    pub fps: f64,
    pub sample_rate: f64,
}

/// Host-provided receivers for the data callbacks a core drives
/// synchronously from inside `run`.
///
/// The closures must not call back into the core and must not block on
/// engine locks; they are invoked with the core re-entered on the calling
/// thread's stack.
pub struct CoreSinks {
    /// One video frame: pixel data (None when the core repeats the
    /// previous frame), width, height, pitch in bytes.
    pub video: Box<dyn FnMut(Option<&[u8]>, u32, u32, usize) + Send>,
    /// A batch of interleaved stereo i16 samples plus the frame count.
    pub audio: Box<dyn FnMut(&[i16], usize) + Send>,
    /// Input state query: (port, device, index, id) to a signed axis or
    /// button value.
    pub input: Box<dyn FnMut(u32, u32, u32, u32) -> i16 + Send>,
}

/// The operations the playback engine needs from a loaded core.
///
/// Implemented by [`CoreHandle`] over the real symbol table and by the
/// scripted test core. Callers must respect the contract ordering:
/// `attach` before the first `run`, and `serialize`/`unserialize` only
/// while a game is loaded.
pub trait Core: Send {
    fn info(&self) -> &CoreInfo;

    /// Install the host's data callbacks.
    fn attach(&mut self, sinks: CoreSinks);

    /// Hand the game to the core. Returns false when the core rejects it.
    fn load_game(&mut self, game: &GameData) -> bool;

    fn unload_game(&mut self);

    /// A/V timing and geometry; only meaningful after a successful
    /// `load_game`.
    fn av_info(&mut self) -> AvInfo;

    /// Advance emulation by one frame, driving the attached sinks.
    fn run(&mut self);

    /// Reset the emulated system, as a console's reset button would.
    fn reset(&mut self);

    /// Byte length of one serialized state snapshot; zero means state
    /// serialization is unsupported.
    fn serialize_size(&mut self) -> usize;

    fn serialize(&mut self, state: &mut [u8]) -> bool;

    fn unserialize(&mut self, state: &[u8]) -> bool;

    fn set_controller_port_device(&mut self, port: u32, device: u32);

    fn region(&mut self) -> Option<Region>;
}

/// Why a core library could not be bound.
#[derive(Debug)]
pub enum CoreLoadError {
    /// The shared object does not exist.
    LibraryNotFound { path: PathBuf },
    /// The shared object exists but could not be loaded.
    LibraryLoadFailed { path: PathBuf, message: String },
    /// A required entrypoint is missing from the symbol table.
    MissingSymbol { name: &'static str },
    /// The core implements a different revision of the contract.
    ApiVersionMismatch { core: u32, host: u32 },
}

impl std::fmt::Display for CoreLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LibraryNotFound { path } => {
                write!(f, "core library not found: {}", path.display())
            }
            Self::LibraryLoadFailed { path, message } => {
                write!(f, "failed to load core library {}: {}", path.display(), message)
            }
            Self::MissingSymbol { name } => write!(f, "core is missing symbol {name}"),
            Self::ApiVersionMismatch { core, host } => {
                write!(f, "core API version {core} does not match host version {host}")
            }
        }
    }
}

impl std::error::Error for CoreLoadError {}

// The full entrypoint table. Resolved once at load; a missing symbol fails
// the whole bind.
type SetEnvironmentFn = unsafe extern "C" fn(abi::retro_environment_t);
type SetVideoRefreshFn = unsafe extern "C" fn(abi::retro_video_refresh_t);
type SetAudioSampleFn = unsafe extern "C" fn(abi::retro_audio_sample_t);
type SetAudioSampleBatchFn = unsafe extern "C" fn(abi::retro_audio_sample_batch_t);
type SetInputPollFn = unsafe extern "C" fn(abi::retro_input_poll_t);
type SetInputStateFn = unsafe extern "C" fn(abi::retro_input_state_t);
type InitFn = unsafe extern "C" fn();
type DeinitFn = unsafe extern "C" fn();
type ApiVersionFn = unsafe extern "C" fn() -> c_uint;
type GetSystemInfoFn = unsafe extern "C" fn(*mut retro_system_info);
type GetSystemAvInfoFn = unsafe extern "C" fn(*mut retro_system_av_info);
type SetControllerPortDeviceFn = unsafe extern "C" fn(c_uint, c_uint);
type ResetFn = unsafe extern "C" fn();
type RunFn = unsafe extern "C" fn();
type SerializeSizeFn = unsafe extern "C" fn() -> usize;
type SerializeFn = unsafe extern "C" fn(*mut std::os::raw::c_void, usize) -> bool;
type UnserializeFn = unsafe extern "C" fn(*const std::os::raw::c_void, usize) -> bool;
type LoadGameFn = unsafe extern "C" fn(*const retro_game_info) -> bool;
type UnloadGameFn = unsafe extern "C" fn();
type GetRegionFn = unsafe extern "C" fn() -> c_uint;

struct CoreSymbols {
    set_environment: SetEnvironmentFn,
    set_video_refresh: SetVideoRefreshFn,
    set_audio_sample: SetAudioSampleFn,
    set_audio_sample_batch: SetAudioSampleBatchFn,
    set_input_poll: SetInputPollFn,
    set_input_state: SetInputStateFn,
    init: InitFn,
    deinit: DeinitFn,
    api_version: ApiVersionFn,
    get_system_info: GetSystemInfoFn,
    get_system_av_info: GetSystemAvInfoFn,
    set_controller_port_device: SetControllerPortDeviceFn,
    reset: ResetFn,
    run: RunFn,
    serialize_size: SerializeSizeFn,
    serialize: SerializeFn,
    unserialize: UnserializeFn,
    load_game: LoadGameFn,
    unload_game: UnloadGameFn,
    get_region: GetRegionFn,
}

fn resolve<T: Copy>(library: &Library, name: &'static str) -> Result<T, CoreLoadError> {
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|symbol| *symbol)
            .map_err(|_| CoreLoadError::MissingSymbol { name })
    }
}

impl CoreSymbols {
    fn resolve_all(library: &Library) -> Result<Self, CoreLoadError> {
        Ok(Self {
            set_environment: resolve(library, "retro_set_environment")?,
            set_video_refresh: resolve(library, "retro_set_video_refresh")?,
            set_audio_sample: resolve(library, "retro_set_audio_sample")?,
            set_audio_sample_batch: resolve(library, "retro_set_audio_sample_batch")?,
            set_input_poll: resolve(library, "retro_set_input_poll")?,
            set_input_state: resolve(library, "retro_set_input_state")?,
            init: resolve(library, "retro_init")?,
            deinit: resolve(library, "retro_deinit")?,
            api_version: resolve(library, "retro_api_version")?,
            get_system_info: resolve(library, "retro_get_system_info")?,
            get_system_av_info: resolve(library, "retro_get_system_av_info")?,
            set_controller_port_device: resolve(library, "retro_set_controller_port_device")?,
            reset: resolve(library, "retro_reset")?,
            run: resolve(library, "retro_run")?,
            serialize_size: resolve(library, "retro_serialize_size")?,
            serialize: resolve(library, "retro_serialize")?,
            unserialize: resolve(library, "retro_unserialize")?,
            load_game: resolve(library, "retro_load_game")?,
            unload_game: resolve(library, "retro_unload_game")?,
            get_region: resolve(library, "retro_get_region")?,
        })
    }
}

/// One bound core library with its game-loaded lifecycle.
pub struct CoreHandle {
    symbols: CoreSymbols,
    info: CoreInfo,
    /// Stable-address callback dispatch state; the trampolines reach it
    /// through a thread-local installed around every reentrant FFI call.
    dispatch: Box<DispatchState>,
    game_loaded: bool,
    // Declared last so the symbols above can never outlive the mapping.
    _library: Library,
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle").finish_non_exhaustive()
    }
}

impl CoreHandle {
    /// Load and bind a core shared object.
    ///
    /// On success the core is initialized and ready for `load_game`. The
    /// environment callback is installed before `retro_init`, as the
    /// contract requires.
    pub fn load(
        path: &Path,
        environment: Arc<HostEnvironment>,
        allow_zip: bool,
    ) -> Result<Self, CoreLoadError> {
        if !path.exists() {
            return Err(CoreLoadError::LibraryNotFound {
                path: path.to_path_buf(),
            });
        }

        let library = unsafe { Library::new(path) }.map_err(|e| {
            CoreLoadError::LibraryLoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        let symbols = CoreSymbols::resolve_all(&library)?;

        let core_api = unsafe { (symbols.api_version)() };
        if core_api != abi::API_VERSION {
            return Err(CoreLoadError::ApiVersionMismatch {
                core: core_api,
                host: abi::API_VERSION,
            });
        }

        let mut raw_info = retro_system_info {
            library_name: ptr::null(),
            library_version: ptr::null(),
            valid_extensions: ptr::null(),
            need_fullpath: false,
            block_extract: false,
        };
        unsafe { (symbols.get_system_info)(&mut raw_info) };

        let info = CoreInfo {
            name: string_field(raw_info.library_name, "Unknown"),
            version: string_field(raw_info.library_version, "v0.0"),
            valid_extensions: CoreInfo::parse_extensions(
                &string_field(raw_info.valid_extensions, ""),
                allow_zip,
            ),
            needs_full_path: raw_info.need_fullpath,
            block_extract: raw_info.block_extract,
        };
        tracing::info!(
            "bound core {} {} (extensions: {:?}, needs_full_path: {}, block_extract: {})",
            info.name,
            info.version,
            info.valid_extensions,
            info.needs_full_path,
            info.block_extract
        );

        let mut handle = Self {
            symbols,
            info,
            dispatch: Box::new(DispatchState::new(environment)),
            game_loaded: false,
            _library: library,
        };

        // Environment before init; the core may raise queries from init.
        handle.enter(|symbols| unsafe {
            (symbols.set_environment)(trampoline::environment_trampoline);
            (symbols.init)();
        });
        Ok(handle)
    }

    /// Run `f` with the trampoline dispatch pointing at this handle, so
    /// any callback the core raises on this thread finds its way back.
    fn enter<R>(&mut self, f: impl FnOnce(&CoreSymbols) -> R) -> R {
        let _guard = DispatchGuard::install(&mut self.dispatch);
        f(&self.symbols)
    }
}

fn string_field(ptr: *const c_char, fallback: &str) -> String {
    if ptr.is_null() {
        return fallback.to_string();
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

impl Core for CoreHandle {
    fn info(&self) -> &CoreInfo {
        &self.info
    }

    fn attach(&mut self, sinks: CoreSinks) {
        self.dispatch.sinks = Some(sinks);
        self.enter(|symbols| unsafe {
            (symbols.set_video_refresh)(trampoline::video_trampoline);
            (symbols.set_audio_sample)(trampoline::audio_sample_trampoline);
            (symbols.set_audio_sample_batch)(trampoline::audio_batch_trampoline);
            (symbols.set_input_poll)(trampoline::input_poll_trampoline);
            (symbols.set_input_state)(trampoline::input_state_trampoline);
        });
    }

    fn load_game(&mut self, game: &GameData) -> bool {
        // The CString must outlive the FFI call.
        let path_holder;
        let raw = match game {
            GameData::Path(path) => {
                let Some(bytes) = path.to_str().and_then(|s| CString::new(s).ok()) else {
                    tracing::error!("game path not representable for the core ABI");
                    return false;
                };
                path_holder = bytes;
                retro_game_info {
                    path: path_holder.as_ptr(),
                    data: ptr::null(),
                    size: 0,
                    meta: ptr::null(),
                }
            }
            GameData::Buffer(bytes) => retro_game_info {
                path: ptr::null(),
                data: bytes.as_ptr().cast(),
                size: bytes.len(),
                meta: ptr::null(),
            },
        };

        let loaded = self.enter(|symbols| unsafe { (symbols.load_game)(&raw) });
        self.game_loaded = loaded;
        loaded
    }

    fn unload_game(&mut self) {
        if self.game_loaded {
            self.enter(|symbols| unsafe { (symbols.unload_game)() });
            self.game_loaded = false;
        }
    }

    fn av_info(&mut self) -> AvInfo {
        let mut raw = retro_system_av_info::default();
        self.enter(|symbols| unsafe { (symbols.get_system_av_info)(&mut raw) });
        AvInfo {
            base_width: raw.geometry.base_width,
            base_height: raw.geometry.base_height,
            max_width: raw.geometry.max_width,
            max_height: raw.geometry.max_height,
            aspect_ratio: raw.geometry.aspect_ratio,
            fps: raw.timing.fps,
            sample_rate: raw.timing.sample_rate,
        }
    }

    fn run(&mut self) {
        self.enter(|symbols| unsafe { (symbols.run)() });
    }

    fn reset(&mut self) {
        self.enter(|symbols| unsafe { (symbols.reset)() });
    }

    fn serialize_size(&mut self) -> usize {
        self.enter(|symbols| unsafe { (symbols.serialize_size)() })
    }

    fn serialize(&mut self, state: &mut [u8]) -> bool {
        self.enter(|symbols| unsafe {
            (symbols.serialize)(state.as_mut_ptr().cast(), state.len())
        })
    }

    fn unserialize(&mut self, state: &[u8]) -> bool {
        self.enter(|symbols| unsafe {
            (symbols.unserialize)(state.as_ptr().cast(), state.len())
        })
    }

    fn set_controller_port_device(&mut self, port: u32, device: u32) {
        if port >= MAX_PLAYERS {
            tracing::warn!("ignoring device assignment for out-of-range port {port}");
            return;
        }
        let known = device <= abi::DEVICE_ANALOG
            || device == abi::DEVICE_JOYPAD_MULTITAP
            || device == abi::DEVICE_LIGHTGUN_SUPER_SCOPE
            || device == abi::DEVICE_LIGHTGUN_JUSTIFIER
            || device == abi::DEVICE_LIGHTGUN_JUSTIFIERS;
        if !known {
            tracing::warn!("ignoring unknown device type {device} for port {port}");
            return;
        }
        self.enter(|symbols| unsafe { (symbols.set_controller_port_device)(port, device) });
    }

    fn region(&mut self) -> Option<Region> {
        let raw = self.enter(|symbols| unsafe { (symbols.get_region)() });
        Region::from_raw(raw)
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        self.unload_game();
        self.enter(|symbols| unsafe { (symbols.deinit)() });
        // The library mapping itself is released when `_library` drops.
    }
}
