//! Callback trampolines.
//!
//! The core ABI takes bare function pointers with no user-data slot, so
//! the `extern "C"` entrypoints here recover the active handle through a
//! thread-local dispatch pointer. [`DispatchGuard`] installs the pointer
//! around every FFI call that can reenter the host (init, load, run) and
//! restores the previous value on exit, so nested handles on one thread
//! stay well-defined and no process-wide singleton exists.
//!
//! Every payload pointer coming out of a core is treated as hostile:
//! checked before the first dereference, with malformed queries answered
//! `false` and no side effects.

use std::cell::Cell;
use std::ffi::CStr;
use std::os::raw::{c_char, c_uint, c_void};
use std::ptr;
use std::sync::Arc;

use crate::abi::{
    self, PixelFormat, retro_input_descriptor, retro_keyboard_callback, retro_message,
    retro_variable,
};
use crate::environment::HostEnvironment;

use super::CoreSinks;

/// Per-handle state the trampolines dispatch into.
pub(crate) struct DispatchState {
    pub environment: Arc<HostEnvironment>,
    pub sinks: Option<CoreSinks>,
}

impl DispatchState {
    pub fn new(environment: Arc<HostEnvironment>) -> Self {
        Self {
            environment,
            sinks: None,
        }
    }
}

thread_local! {
    static ACTIVE: Cell<*mut DispatchState> = const { Cell::new(ptr::null_mut()) };
}

/// Scoped installation of the thread-local dispatch pointer.
pub(crate) struct DispatchGuard {
    previous: *mut DispatchState,
}

impl DispatchGuard {
    pub fn install(dispatch: &mut DispatchState) -> Self {
        let previous = ACTIVE.replace(dispatch as *mut DispatchState);
        Self { previous }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        ACTIVE.set(self.previous);
    }
}

fn with_dispatch<R>(f: impl FnOnce(&mut DispatchState) -> R) -> Option<R> {
    let ptr = ACTIVE.get();
    if ptr.is_null() {
        None
    } else {
        // The guard keeps the handle alive and exclusively entered for the
        // duration of the FFI call that got us here.
        Some(f(unsafe { &mut *ptr }))
    }
}

fn cstr_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

pub(super) unsafe extern "C" fn environment_trampoline(cmd: c_uint, data: *mut c_void) -> bool {
    with_dispatch(|dispatch| handle_environment(&dispatch.environment, cmd, data))
        .unwrap_or_else(|| {
            tracing::error!("environment query {cmd} raised with no active core");
            false
        })
}

fn handle_environment(env: &HostEnvironment, cmd: c_uint, data: *mut c_void) -> bool {
    // Shutdown carries no payload; everything else needs one.
    if data.is_null() && cmd != abi::ENVIRONMENT_SHUTDOWN {
        tracing::error!("environment query {cmd}: missing payload");
        return false;
    }

    match cmd {
        abi::ENVIRONMENT_GET_OVERSCAN => {
            unsafe { *data.cast::<bool>() = env.overscan() };
            true
        }
        abi::ENVIRONMENT_GET_CAN_DUPE => {
            unsafe { *data.cast::<bool>() = env.can_dupe() };
            true
        }
        abi::ENVIRONMENT_GET_VARIABLE => {
            let var = unsafe { &mut *data.cast::<retro_variable>() };
            let Some(key) = cstr_arg(var.key) else {
                tracing::error!("environment: variable query without a key");
                return false;
            };
            var.value = env
                .variable(key)
                .map_or(ptr::null(), |value| value.as_ptr());
            true
        }
        abi::ENVIRONMENT_SET_VARIABLES => {
            let mut cursor = data.cast::<retro_variable>().cast_const();
            let mut vars = Vec::new();
            // Array is terminated by a null key.
            loop {
                let entry = unsafe { &*cursor };
                let Some(key) = cstr_arg(entry.key) else { break };
                let description = cstr_arg(entry.value).unwrap_or("").to_string();
                vars.push((key.to_string(), description));
                cursor = unsafe { cursor.add(1) };
            }
            env.declare_variables(vars);
            true
        }
        abi::ENVIRONMENT_SET_MESSAGE => {
            let msg = unsafe { &*data.cast::<retro_message>() };
            let Some(text) = cstr_arg(msg.msg) else {
                tracing::error!("environment: message without text");
                return false;
            };
            env.show_message(text, msg.frames);
            true
        }
        abi::ENVIRONMENT_SET_ROTATION => {
            let steps = unsafe { *data.cast::<c_uint>() };
            env.set_rotation(steps)
        }
        abi::ENVIRONMENT_SHUTDOWN => {
            env.request_shutdown();
            true
        }
        abi::ENVIRONMENT_SET_PERFORMANCE_LEVEL => {
            env.performance_level(unsafe { *data.cast::<c_uint>() });
            true
        }
        abi::ENVIRONMENT_GET_SYSTEM_DIRECTORY => {
            let out = data.cast::<*const c_char>();
            unsafe {
                *out = env
                    .system_directory()
                    .map_or(ptr::null(), |dir| dir.as_ptr());
            }
            true
        }
        abi::ENVIRONMENT_SET_PIXEL_FORMAT => {
            let raw = unsafe { *data.cast::<c_uint>() };
            match PixelFormat::from_raw(raw) {
                Some(format) => env.set_pixel_format(format),
                None => {
                    tracing::error!("environment: unsupported pixel format {raw}");
                    false
                }
            }
        }
        abi::ENVIRONMENT_SET_INPUT_DESCRIPTORS => {
            let mut cursor = data.cast::<retro_input_descriptor>().cast_const();
            // Array is terminated by a null description.
            loop {
                let entry = unsafe { &*cursor };
                let Some(text) = cstr_arg(entry.description) else { break };
                env.describe_input(entry.port, entry.device, entry.index, entry.id, text);
                cursor = unsafe { cursor.add(1) };
            }
            true
        }
        abi::ENVIRONMENT_SET_KEYBOARD_CALLBACK => {
            let cb = unsafe { &*data.cast::<retro_keyboard_callback>() };
            env.set_keyboard_callback(cb.callback);
            true
        }
        _ => {
            tracing::warn!("environment: unhandled query {cmd}");
            false
        }
    }
}

pub(super) unsafe extern "C" fn video_trampoline(
    data: *const c_void,
    width: c_uint,
    height: c_uint,
    pitch: usize,
) {
    let _ = with_dispatch(|dispatch| {
        let Some(sinks) = dispatch.sinks.as_mut() else { return };
        let frame = if data.is_null() {
            None
        } else {
            Some(unsafe {
                std::slice::from_raw_parts(data.cast::<u8>(), pitch.saturating_mul(height as usize))
            })
        };
        (sinks.video)(frame, width, height, pitch);
    });
}

pub(super) unsafe extern "C" fn audio_sample_trampoline(left: i16, right: i16) {
    let _ = with_dispatch(|dispatch| {
        if let Some(sinks) = dispatch.sinks.as_mut() {
            // A lone sample is just a one-frame batch.
            (sinks.audio)(&[left, right], 1);
        }
    });
}

pub(super) unsafe extern "C" fn audio_batch_trampoline(data: *const i16, frames: usize) -> usize {
    let _ = with_dispatch(|dispatch| {
        if let Some(sinks) = dispatch.sinks.as_mut()
            && !data.is_null()
            && frames > 0
        {
            let samples = unsafe { std::slice::from_raw_parts(data, frames * 2) };
            (sinks.audio)(samples, frames);
        }
    });
    frames
}

pub(super) unsafe extern "C" fn input_poll_trampoline() {
    // Input is polled on demand through the state callback.
}

pub(super) unsafe extern "C" fn input_state_trampoline(
    port: c_uint,
    device: c_uint,
    index: c_uint,
    id: c_uint,
) -> i16 {
    with_dispatch(|dispatch| {
        dispatch
            .sinks
            .as_mut()
            .map_or(0, |sinks| (sinks.input)(port, device, index, id))
    })
    .unwrap_or(0)
}
