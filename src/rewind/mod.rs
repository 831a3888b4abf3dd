//! Frame-granular rewind over serialized core state.
//!
//! After every emulated frame the core's serialized state is diffed
//! against the previous snapshot as 32-bit words; the non-zero XOR words
//! form a sparse delta frame pushed onto a bounded ring. Because XOR is
//! self-inverse, popping deltas from the back of the ring and applying
//! them in order walks the full snapshot backwards one frame at a time,
//! and the reconstructed snapshot can be reinstalled into the core.

use std::collections::VecDeque;

use crate::binding::Core;

/// One changed word between two consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaPair {
    /// Word index into the snapshot.
    pub index: u32,
    /// XOR of the old and new word values.
    pub xor: u32,
}

type DeltaFrame = Vec<DeltaPair>;

/// Bounded XOR-delta log over a core's serialized state.
///
/// Holds the newest full snapshot plus up to `max_frames` deltas, roughly
/// sixty seconds of play at the session framerate. Worst case memory is
/// `max_frames * serialize_size` for a core that rewrites all of its
/// state every frame; in practice deltas run a few percent of that.
pub struct RewindBuffer {
    /// Snapshot byte length reported by the core.
    serialize_size: usize,
    /// Newest snapshot, viewed as words. The final word is zero-padded
    /// when `serialize_size` is not a multiple of four.
    last_state: Vec<u32>,
    /// Delta frames, oldest at the front.
    ring: VecDeque<DeltaFrame>,
    max_frames: usize,
    /// Reused serialization target, same length as `last_state`.
    scratch: Vec<u32>,
}

impl RewindBuffer {
    /// Set up the log and prime it with the core's current state, so the
    /// first captured delta is measured against the true initial state.
    ///
    /// Must not be called when the core reports a zero serialize size.
    pub fn new(core: &mut dyn Core, serialize_size: usize, fps: f64) -> Option<Self> {
        debug_assert!(serialize_size > 0);
        let words = serialize_size.div_ceil(4);
        let max_frames = (60.0 * fps).round() as usize;

        let mut last_state = vec![0u32; words];
        if !core.serialize(state_bytes(&mut last_state, serialize_size)) {
            tracing::error!("core failed to serialize its initial state; rewind disabled");
            return None;
        }

        tracing::info!(
            "rewind enabled: {serialize_size} byte snapshots, {max_frames} frame window"
        );
        Some(Self {
            serialize_size,
            last_state,
            ring: VecDeque::new(),
            max_frames,
            scratch: vec![0u32; words],
        })
    }

    /// Snapshot the core and append the delta against the previous frame.
    ///
    /// A core that reported a serialize size but fails mid-run is logged
    /// and the capture skipped; neither the snapshot nor the ring change.
    pub fn capture(&mut self, core: &mut dyn Core) {
        // Clear the padding word so stale bytes never show up as a delta.
        if self.serialize_size % 4 != 0
            && let Some(last) = self.scratch.last_mut()
        {
            *last = 0;
        }
        if !core.serialize(state_bytes(&mut self.scratch, self.serialize_size)) {
            tracing::error!("core claimed it could serialize, but failed; skipping capture");
            return;
        }

        let mut delta = DeltaFrame::new();
        for (i, (&old, &new)) in self.last_state.iter().zip(self.scratch.iter()).enumerate() {
            let xor = old ^ new;
            if xor != 0 {
                delta.push(DeltaPair {
                    index: i as u32,
                    xor,
                });
            }
        }
        self.ring.push_back(delta);
        std::mem::swap(&mut self.last_state, &mut self.scratch);

        while self.ring.len() > self.max_frames {
            self.ring.pop_front();
        }
    }

    /// Walk back up to `frames` frames and reinstall the reconstructed
    /// state into the core. Returns how many frames were actually rewound.
    pub fn rewind(&mut self, core: &mut dyn Core, frames: usize) -> usize {
        let mut rewound = 0;
        while rewound < frames {
            let Some(delta) = self.ring.pop_back() else { break };
            for pair in &delta {
                self.last_state[pair.index as usize] ^= pair.xor;
            }
            rewound += 1;
        }

        if rewound > 0
            && !core.unserialize(&bytemuck::cast_slice(&self.last_state)[..self.serialize_size])
        {
            tracing::error!("core refused the rewound state");
        }
        rewound
    }

    /// Frames currently available to rewind.
    pub fn available(&self) -> usize {
        self.ring.len()
    }

    /// Upper bound on `available`.
    pub fn max_available(&self) -> usize {
        self.max_frames
    }

    /// Byte view of the newest snapshot.
    #[cfg(test)]
    pub(crate) fn last_state_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.last_state)[..self.serialize_size]
    }
}

/// Mutable byte view of the first `len` bytes of a word buffer.
fn state_bytes(words: &mut [u32], len: usize) -> &mut [u8] {
    &mut bytemuck::cast_slice_mut(words)[..len]
}
