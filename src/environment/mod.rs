//! Host-side answers to the environment queries a core raises from inside
//! `retro_init`, `retro_load_game`, and `retro_run`.
//!
//! This module is fully typed; the raw payload-pointer validation happens
//! in `binding::trampoline` before anything lands here. Queries the host
//! does not understand are logged and answered with `false` at that layer.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{PixelFormat, retro_keyboard_event_t};

/// Hook invoked when the core negotiates a pixel format.
pub type PixelFormatHook = Box<dyn Fn(PixelFormat) + Send + Sync>;

/// Hook invoked when the core asks the host application to stop playback.
pub type ShutdownHook = Box<dyn Fn() + Send + Sync>;

/// Shared host state backing the environment callback.
///
/// One instance lives for the duration of an open session and is shared
/// between the thread that opened the core (init/load run there) and the
/// frame pump (run-time queries land there).
pub struct HostEnvironment {
    /// Variable map served to `GET_VARIABLE`. Keys and values are fixed at
    /// construction so the `*const c_char` handed to the core stays valid
    /// for the session.
    variables: HashMap<String, CString>,
    /// Variables the core declared via `SET_VARIABLES`, for diagnostics.
    declared: Mutex<Vec<(String, String)>>,
    /// Keyboard event callback registered by the core, if any.
    keyboard: Mutex<Option<retro_keyboard_event_t>>,
    /// Set once the core has requested shutdown.
    shutdown_requested: AtomicBool,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    pixel_format_hook: Mutex<Option<PixelFormatHook>>,
    /// Directory for BIOSes and other system files; None is allowed by the
    /// contract and cores must cope.
    system_directory: Option<CString>,
}

impl HostEnvironment {
    pub fn new(variables: &HashMap<String, String>) -> Self {
        let variables = variables
            .iter()
            .filter_map(|(k, v)| {
                let value = CString::new(v.as_str()).ok()?;
                Some((k.clone(), value))
            })
            .collect();
        Self {
            variables,
            declared: Mutex::new(Vec::new()),
            keyboard: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
            shutdown_hook: Mutex::new(None),
            pixel_format_hook: Mutex::new(None),
            system_directory: None,
        }
    }

    /// Whether video should include overscan. Always false: crop it.
    pub fn overscan(&self) -> bool {
        false
    }

    /// Whether a null video frame may be sent to mean "same as last frame".
    /// Always true.
    pub fn can_dupe(&self) -> bool {
        true
    }

    /// Look up a host variable. Returns the stored NUL-terminated value so
    /// the caller can hand its pointer straight to the core.
    pub fn variable(&self, key: &str) -> Option<&CString> {
        let value = self.variables.get(key);
        match value {
            Some(v) => tracing::info!("environment: variable {key} = {v:?}"),
            None => tracing::warn!("environment: undefined variable {key}"),
        }
        value
    }

    /// Record the variables a core says it may query later.
    pub fn declare_variables(&self, vars: Vec<(String, String)>) {
        for (key, description) in &vars {
            tracing::info!("environment: core variable {key} ({description})");
        }
        self.declared.lock().unwrap().extend(vars);
    }

    /// Variables declared by the core so far.
    pub fn declared_variables(&self) -> Vec<(String, String)> {
        self.declared.lock().unwrap().clone()
    }

    /// Informational message from the core.
    pub fn show_message(&self, text: &str, frames: u32) {
        tracing::info!("environment: core message \"{text}\" for {frames} frames");
    }

    /// Screen rotation request, in 90-degree steps counter-clockwise.
    /// Accepted and logged; the video sink decides whether to honor it.
    pub fn set_rotation(&self, steps: u32) -> bool {
        if steps <= 3 {
            tracing::info!("environment: screen rotation set to {} degrees", steps * 90);
            true
        } else {
            tracing::error!("environment: invalid rotation {steps}");
            false
        }
    }

    /// Core-initiated shutdown. Raises the flag and notifies the host
    /// application; playback itself keeps running until closed.
    pub fn request_shutdown(&self) {
        tracing::info!("environment: core signaled shutdown");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if let Some(hook) = &*self.shutdown_hook.lock().unwrap() {
            hook();
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn set_shutdown_hook(&self, hook: ShutdownHook) {
        *self.shutdown_hook.lock().unwrap() = Some(hook);
    }

    /// Performance hint from the core; informational only.
    pub fn performance_level(&self, level: u32) {
        tracing::info!("environment: core performance hint {level}");
    }

    /// Directory for system-specific support files, if the host has one.
    pub fn system_directory(&self) -> Option<&CString> {
        if self.system_directory.is_none() {
            tracing::info!("environment: no system directory given to core");
        }
        self.system_directory.as_ref()
    }

    /// Pixel format negotiation. Only the three contract formats are
    /// accepted; anything else is refused so the core falls back.
    pub fn set_pixel_format(&self, format: PixelFormat) -> bool {
        tracing::info!("environment: pixel format {format:?}");
        if let Some(hook) = &*self.pixel_format_hook.lock().unwrap() {
            hook(format);
        }
        true
    }

    pub fn set_pixel_format_hook(&self, hook: PixelFormatHook) {
        *self.pixel_format_hook.lock().unwrap() = Some(hook);
    }

    /// Input binding descriptions from the core; informational only.
    pub fn describe_input(&self, port: u32, device: u32, index: u32, id: u32, text: &str) {
        tracing::info!(
            "environment: input \"{text}\" (port={port}, device={device}, index={index}, id={id})"
        );
    }

    /// Store the keyboard event callback the core registered.
    pub fn set_keyboard_callback(&self, callback: Option<retro_keyboard_event_t>) {
        tracing::info!(
            "environment: keyboard callback {}",
            if callback.is_some() { "set" } else { "cleared" }
        );
        *self.keyboard.lock().unwrap() = callback;
    }

    /// Current keyboard callback, for the host input layer to invoke.
    pub fn keyboard_callback(&self) -> Option<retro_keyboard_event_t> {
        *self.keyboard.lock().unwrap()
    }

    /// Forget the core-registered keyboard callback and re-arm the
    /// shutdown flag. Called on close so a stale fn pointer can never
    /// outlive its library.
    pub fn end_session(&self) {
        *self.keyboard.lock().unwrap() = None;
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }
}
