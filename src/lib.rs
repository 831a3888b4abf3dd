//! retroplay - an embeddable retro-game playback runtime.
//!
//! Loads dynamic emulator cores speaking the libretro-shaped C ABI,
//! clocks them at their declared framerate on a dedicated worker thread,
//! fans their audio/video/input callbacks out to host-provided sinks, and
//! keeps a bounded XOR-delta log of serialized core state for seamless
//! frame-granular rewind.
//!
//! # Architecture
//!
//! - [`PlaybackEngine`] - transport controls and the frame-pump worker
//! - [`CoreHandle`] - one bound core shared object behind the [`Core`] seam
//! - [`RewindBuffer`] - per-frame XOR deltas over serialized core state
//! - [`HostEnvironment`] - host-side answers to core environment queries
//! - [`LoadStrategy`] - how a game file is presented to a core

pub mod abi;
pub mod binding;
pub mod config;
pub mod environment;
#[cfg(test)]
mod integration;
pub mod playback;
pub mod rewind;
pub mod strategy;
#[cfg(test)]
pub mod test_utils;
pub mod vfs;

// Re-export the main surface.
pub use abi::{PixelFormat, Region};
pub use binding::{AvInfo, Core, CoreHandle, CoreInfo, CoreLoadError, CoreSinks, MAX_PLAYERS};
pub use config::{OpenOptions, PlayerSettings};
pub use environment::HostEnvironment;
pub use playback::sinks::{AudioSink, InputSink, NullAudio, NullInput, NullVideo, VideoSink};
pub use playback::{OpenError, PlaybackEngine, SPEED_NORMAL, SPEED_PAUSED};
pub use rewind::RewindBuffer;
pub use strategy::{GameData, GameFile, LoadStrategy};
pub use vfs::{LocalVfs, Vfs};
