//! The libretro-shaped core ABI: raw payload structs, callback signatures,
//! and the numeric compatibility constants.
//!
//! Everything in this module must match the C contract bit-for-bit; cores
//! are compiled against the same header and will happily scribble over the
//! wrong field otherwise. Nothing here dereferences anything; raw pointer
//! handling lives in `binding::trampoline`.

// Struct names keep the C header's spelling so a diff against the contract
// stays mechanical.
#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_uint, c_void};

/// Host API version, compared for exact equality against the core's
/// `retro_api_version()`.
pub const API_VERSION: c_uint = 1;

// Environment query IDs.
pub const ENVIRONMENT_SET_ROTATION: c_uint = 1;
pub const ENVIRONMENT_GET_OVERSCAN: c_uint = 2;
pub const ENVIRONMENT_GET_CAN_DUPE: c_uint = 3;
pub const ENVIRONMENT_SET_MESSAGE: c_uint = 6;
pub const ENVIRONMENT_SHUTDOWN: c_uint = 7;
pub const ENVIRONMENT_SET_PERFORMANCE_LEVEL: c_uint = 8;
pub const ENVIRONMENT_GET_SYSTEM_DIRECTORY: c_uint = 9;
pub const ENVIRONMENT_SET_PIXEL_FORMAT: c_uint = 10;
pub const ENVIRONMENT_SET_INPUT_DESCRIPTORS: c_uint = 11;
pub const ENVIRONMENT_SET_KEYBOARD_CALLBACK: c_uint = 12;
pub const ENVIRONMENT_GET_VARIABLE: c_uint = 15;
pub const ENVIRONMENT_SET_VARIABLES: c_uint = 16;

// Device type codes for `retro_set_controller_port_device`.
pub const DEVICE_NONE: c_uint = 0;
pub const DEVICE_JOYPAD: c_uint = 1;
pub const DEVICE_MOUSE: c_uint = 2;
pub const DEVICE_KEYBOARD: c_uint = 3;
pub const DEVICE_LIGHTGUN: c_uint = 4;
pub const DEVICE_ANALOG: c_uint = 5;
pub const DEVICE_JOYPAD_MULTITAP: c_uint = (1 << 8) | DEVICE_JOYPAD;
pub const DEVICE_LIGHTGUN_SUPER_SCOPE: c_uint = (1 << 8) | DEVICE_LIGHTGUN;
pub const DEVICE_LIGHTGUN_JUSTIFIER: c_uint = (2 << 8) | DEVICE_LIGHTGUN;
pub const DEVICE_LIGHTGUN_JUSTIFIERS: c_uint = (3 << 8) | DEVICE_LIGHTGUN;

// Region codes returned by `retro_get_region`.
pub const REGION_NTSC: c_uint = 0;
pub const REGION_PAL: c_uint = 1;

/// Framebuffer pixel formats a core may negotiate via
/// `ENVIRONMENT_SET_PIXEL_FORMAT`. `Xrgb1555` is the contract default
/// until the core selects another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelFormat {
    /// 5 bit color, high bit must be zero.
    Xrgb1555 = 0,
    /// 8 bit color, high byte ignored.
    Xrgb8888 = 1,
    /// 5/6/5 bit color.
    Rgb565 = 2,
}

impl PixelFormat {
    /// Decode a raw enum value from the core; unknown values are rejected.
    pub fn from_raw(raw: c_uint) -> Option<Self> {
        match raw {
            0 => Some(Self::Xrgb1555),
            1 => Some(Self::Xrgb8888),
            2 => Some(Self::Rgb565),
            _ => None,
        }
    }
}

/// Video standard reported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Ntsc,
    Pal,
}

impl Region {
    pub fn from_raw(raw: c_uint) -> Option<Self> {
        match raw {
            REGION_NTSC => Some(Self::Ntsc),
            REGION_PAL => Some(Self::Pal),
            _ => None,
        }
    }
}

/// Informational strings and loading requirements published by a core
/// through `retro_get_system_info`. All pointers are core-owned and must
/// outlive the library; they may be null.
#[repr(C)]
pub struct retro_system_info {
    pub library_name: *const c_char,
    pub library_version: *const c_char,
    /// Pipe-separated list of extensions without dots, e.g. `"smc|sfc"`.
    pub valid_extensions: *const c_char,
    pub need_fullpath: bool,
    pub block_extract: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_game_geometry {
    pub base_width: c_uint,
    pub base_height: c_uint,
    pub max_width: c_uint,
    pub max_height: c_uint,
    pub aspect_ratio: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_system_timing {
    pub fps: f64,
    pub sample_rate: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_system_av_info {
    pub geometry: retro_game_geometry,
    pub timing: retro_system_timing,
}

/// The one-shot description of a game handed to `retro_load_game`:
/// either `path` or `data`+`size` is populated, never both.
#[repr(C)]
pub struct retro_game_info {
    pub path: *const c_char,
    pub data: *const c_void,
    pub size: usize,
    pub meta: *const c_char,
}

#[repr(C)]
pub struct retro_variable {
    pub key: *const c_char,
    pub value: *const c_char,
}

#[repr(C)]
pub struct retro_message {
    pub msg: *const c_char,
    pub frames: c_uint,
}

#[repr(C)]
pub struct retro_input_descriptor {
    pub port: c_uint,
    pub device: c_uint,
    pub index: c_uint,
    pub id: c_uint,
    pub description: *const c_char,
}

/// Keyboard event sink the core registers with the host:
/// `(down, keycode, utf32 character, modifier mask)`.
pub type retro_keyboard_event_t =
    unsafe extern "C" fn(down: bool, keycode: c_uint, character: u32, key_modifiers: u16);

#[repr(C)]
pub struct retro_keyboard_callback {
    pub callback: Option<retro_keyboard_event_t>,
}

// Callback signatures the host installs on the core.
pub type retro_environment_t = unsafe extern "C" fn(cmd: c_uint, data: *mut c_void) -> bool;
pub type retro_video_refresh_t =
    unsafe extern "C" fn(data: *const c_void, width: c_uint, height: c_uint, pitch: usize);
pub type retro_audio_sample_t = unsafe extern "C" fn(left: i16, right: i16);
pub type retro_audio_sample_batch_t =
    unsafe extern "C" fn(data: *const i16, frames: usize) -> usize;
pub type retro_input_poll_t = unsafe extern "C" fn();
pub type retro_input_state_t =
    unsafe extern "C" fn(port: c_uint, device: c_uint, index: c_uint, id: c_uint) -> i16;
