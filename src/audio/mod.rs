pub mod gesture;
pub mod io;
pub mod looper;
pub mod memory;
pub mod mixer;
pub mod region;
pub mod scratch;
pub mod stream;
pub mod streaming;
pub mod window;

pub use io::{export_wav, import_wav};
pub use looper::{EngineStatus, LooperEngine};
pub use memory::{ExternalMemory, MemoryBank, MemoryError, RamServer, SerialMemory};
pub use stream::AudioStream;
pub use streaming::StreamingManager;

use std::fmt;

pub const SAMPLE_RATE: u32 = 44_100;
/// Samples per on-chip window, the unit of transfer to external memory.
pub const WINDOW_SIZE: usize = 2048;
/// Longest temp-record capture, in samples (half a second at 44.1 kHz).
pub const SCRATCH_CAPACITY: usize = 22_050;
pub const HOLD_THRESHOLD_MS: u32 = 700;
pub const MAX_OLD_REGIONS: usize = 16;
/// Shortest loop, in windows. Three windows are on chip or in flight around
/// the playhead, so a scratch merge needs at least one more.
pub const MIN_LOOP_WINDOWS: usize = 4;
pub const DEFAULT_MEMORY_BYTES: usize = 8 * 1024 * 1024;
/// Bytes per logical loop position: one base and one new-layer i16.
pub const FRAME_BYTES: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub window_size: usize,
    pub scratch_capacity: usize,
    /// Tap/hold boundary in samples.
    pub hold_threshold: usize,
    pub memory_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            window_size: WINDOW_SIZE,
            scratch_capacity: SCRATCH_CAPACITY,
            hold_threshold: (SAMPLE_RATE as usize * HOLD_THRESHOLD_MS as usize) / 1000,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

impl EngineConfig {
    pub fn with_memory_bytes(mut self, memory_bytes: usize) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    /// Longest first take the external memory can hold, in whole windows.
    pub fn max_loop_length(&self) -> usize {
        let positions = self.memory_bytes / FRAME_BYTES;
        positions - positions % self.window_size
    }

    pub fn min_loop_length(&self) -> usize {
        self.window_size * MIN_LOOP_WINDOWS
    }

    /// Scratch capacity usable with a loop of `loop_length` samples.
    pub fn scratch_capacity_for(&self, loop_length: usize) -> usize {
        self.scratch_capacity
            .min(loop_length.saturating_sub(3 * self.window_size))
    }

    pub fn samples_to_secs(&self, samples: usize) -> f64 {
        samples as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Idle,
    FirstRecord,
    FirstPlayback,
    FirstStop,
    FirstTempRecord,
    Record,
    Play,
    TempRecord,
    Stopped,
    Playback1,
}

impl TransportState {
    pub const ALL: [TransportState; 10] = [
        TransportState::Idle,
        TransportState::FirstRecord,
        TransportState::FirstPlayback,
        TransportState::FirstStop,
        TransportState::FirstTempRecord,
        TransportState::Record,
        TransportState::Play,
        TransportState::TempRecord,
        TransportState::Stopped,
        TransportState::Playback1,
    ];

    /// Whether the playhead moves and the windows are touched in this state.
    pub fn is_running(self) -> bool {
        !matches!(
            self,
            TransportState::Idle | TransportState::Stopped | TransportState::FirstStop
        )
    }

    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(TransportState::Idle)
    }

    pub fn label(self) -> &'static str {
        match self {
            TransportState::Idle => "Idle",
            TransportState::FirstRecord => "First Record",
            TransportState::FirstPlayback => "First Playback",
            TransportState::FirstStop => "First Stop",
            TransportState::FirstTempRecord => "First Temp Record",
            TransportState::Record => "Record",
            TransportState::Play => "Play",
            TransportState::TempRecord => "Temp Record",
            TransportState::Stopped => "Stopped",
            TransportState::Playback1 => "Playback",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Events reported by the engine and the streaming thread. Variants sent from
/// the audio callback carry no heap data.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    StateChanged {
        from: TransportState,
        to: TransportState,
    },
    FirstTakeClosed {
        loop_length: usize,
    },
    UndoToggled(bool),
    ScratchCommitted {
        start: usize,
        size: usize,
    },
    ScratchMerged,
    /// A window ran out before the background transfer finished.
    Overrun {
        origin: usize,
    },
    /// The oldest overdub was folded into the base layer to free its slot.
    RegionFolded {
        positions: usize,
    },
    MemoryFault(String),
    Error(String),
}
