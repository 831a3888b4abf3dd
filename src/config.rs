//! Player configuration.
//!
//! Settings are plain serde-derived structs so the embedding application can
//! persist them in whatever format it already uses for its own config.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Process-wide playback settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSettings {
    /// Prefer handing cores in-memory buffers over filesystem paths when
    /// resolving how to present a game file (default: false).
    #[serde(default)]
    pub prefer_vfs: bool,
    /// Let cores that claim zip support actually receive zip files.
    /// Many cores lie about this and crash, so it is off by default.
    #[serde(default)]
    pub allow_zip: bool,
    /// Key/value variables served to cores through the environment
    /// callback's variable lookup.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Seconds rewound by a small backward seek (default: 1).
    #[serde(default = "default_small_step")]
    pub seek_small_step_secs: u32,
    /// Seconds rewound by a large backward seek (default: 10).
    #[serde(default = "default_large_step")]
    pub seek_large_step_secs: u32,
}

fn default_small_step() -> u32 {
    1
}

fn default_large_step() -> u32 {
    10
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            prefer_vfs: false,
            allow_zip: false,
            variables: HashMap::new(),
            seek_small_step_secs: default_small_step(),
            seek_large_step_secs: default_large_step(),
        }
    }
}

/// Per-open options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Ask the video sink for fullscreen output.
    #[serde(default)]
    pub fullscreen: bool,
}
