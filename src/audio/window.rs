// src/audio/window.rs
// On-chip loop windows and the lock-free hand-off between the audio thread
// and the streaming thread. Windows move by value, so whoever holds one owns
// it; nothing here blocks.

use rtrb::{Consumer, Producer, RingBuffer};

use super::FRAME_BYTES;
use super::region::{ActiveRegion, MergeReport, OldRegion, RegionSnapshot};
use super::scratch::ScratchBuffer;

/// Both layers at one loop position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub base: i16,
    pub new: i16,
}

impl Frame {
    pub fn to_bytes(self) -> [u8; FRAME_BYTES] {
        let [b0, b1] = self.base.to_le_bytes();
        let [n0, n1] = self.new.to_le_bytes();
        [b0, b1, n0, n1]
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            base: i16::from_le_bytes([bytes[0], bytes[1]]),
            new: i16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

pub fn encode_frames(frames: &[Frame], out: &mut [u8]) {
    for (frame, chunk) in frames.iter().zip(out.chunks_exact_mut(FRAME_BYTES)) {
        chunk.copy_from_slice(&frame.to_bytes());
    }
}

pub fn decode_frames(bytes: &[u8], frames: &mut [Frame]) {
    for (frame, chunk) in frames.iter_mut().zip(bytes.chunks_exact(FRAME_BYTES)) {
        *frame = Frame::from_bytes(chunk);
    }
}

/// A fixed-size slice of the loop, resident on chip.
#[derive(Debug)]
pub struct Window {
    /// Physical slot, 0 or 1.
    pub id: usize,
    /// Loop position of `frames[0]`.
    pub origin: usize,
    /// Cursor of the audio thread within `frames`.
    pub offset: usize,
    /// Written since it was loaded.
    pub dirty: bool,
    /// Contents do not belong to `origin` (left over from an overrun); must
    /// not be written back.
    pub stale: bool,
    frames: Box<[Frame]>,
}

impl Window {
    pub fn new(id: usize, size: usize) -> Self {
        Self {
            id,
            origin: 0,
            offset: 0,
            dirty: false,
            stale: false,
            frames: vec![Frame::default(); size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.frames.len()
    }

    #[inline]
    pub fn current(&self) -> Frame {
        self.frames[self.offset]
    }

    #[inline]
    pub fn set_current(&mut self, frame: Frame) {
        self.frames[self.offset] = frame;
        self.dirty = true;
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// Point the window at a new origin without touching its contents.
    pub fn rebase(&mut self, origin: usize) {
        self.origin = origin;
        self.offset = 0;
        self.dirty = false;
    }

    pub fn clear(&mut self) {
        self.frames.fill(Frame::default());
        self.rebase(0);
        self.stale = false;
    }
}

/// The oldest old region, to be folded into the base layer so its slot can
/// be reused.
#[derive(Debug, Clone, Copy)]
pub struct RegionSweep {
    /// Slot of `region` in the tracker.
    pub index: usize,
    pub region: OldRegion,
    /// Positions the audio thread may be writing; left to the engine.
    pub active: Option<ActiveRegion>,
}

/// Scratch capture waiting to be spliced into external memory.
#[derive(Debug)]
pub struct ScratchMerge {
    pub scratch: ScratchBuffer,
    pub regions: RegionSnapshot,
    pub sweep: Option<RegionSweep>,
}

/// One background pass: write `window` back, merge a committed scratch if
/// any, then load `prefetch_origin` into the same window.
#[derive(Debug)]
pub struct TransferJob {
    /// Engine generation; results from before a reset are not applied.
    pub epoch: u64,
    pub window: Window,
    pub write_back: bool,
    pub prefetch_origin: usize,
    /// `None` while the first take is still growing.
    pub loop_length: Option<usize>,
    pub merge: Option<ScratchMerge>,
}

#[derive(Debug)]
pub struct Completion {
    pub epoch: u64,
    pub window: Window,
    pub scratch: Option<ScratchBuffer>,
    pub report: MergeReport,
}

/// Audio-thread end of the hand-off.
pub struct EngineLink {
    jobs: Producer<TransferJob>,
    done: Consumer<Completion>,
}

/// Streaming-thread end of the hand-off.
pub struct StreamingLink {
    jobs: Consumer<TransferJob>,
    done: Producer<Completion>,
}

/// Single-slot queues both ways: at most one transfer is ever outstanding.
pub fn window_link() -> (EngineLink, StreamingLink) {
    let (job_tx, job_rx) = RingBuffer::new(1);
    let (done_tx, done_rx) = RingBuffer::new(1);
    (
        EngineLink {
            jobs: job_tx,
            done: done_rx,
        },
        StreamingLink {
            jobs: job_rx,
            done: done_tx,
        },
    )
}

impl EngineLink {
    /// Hand a job over. Gives it back if a transfer is already queued.
    pub fn submit(&mut self, job: TransferJob) -> Result<(), TransferJob> {
        self.jobs.push(job).map_err(|rtrb::PushError::Full(job)| job)
    }

    pub fn poll(&mut self) -> Option<Completion> {
        self.done.pop().ok()
    }
}

impl StreamingLink {
    pub fn next_job(&mut self) -> Option<TransferJob> {
        self.jobs.pop().ok()
    }

    pub fn complete(&mut self, completion: Completion) -> Result<(), Completion> {
        self.done
            .push(completion)
            .map_err(|rtrb::PushError::Full(completion)| completion)
    }

    /// The audio side has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.jobs.is_abandoned()
    }
}
