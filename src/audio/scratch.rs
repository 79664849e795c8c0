// src/audio/scratch.rs
// Linear capture buffer for temp-record overdubs. Allocated once; the audio
// thread only ever appends.

#[derive(Debug)]
pub struct ScratchBuffer {
    samples: Box<[i16]>,
    start: usize,
    fill: usize,
    limit: usize,
}

impl ScratchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity].into_boxed_slice(),
            start: 0,
            fill: 0,
            limit: 0,
        }
    }

    /// Start a capture at loop position `start`, stopping after `limit`
    /// samples (never more than the allocated capacity).
    pub fn begin(&mut self, start: usize, limit: usize) {
        self.start = start;
        self.fill = 0;
        self.limit = limit.min(self.samples.len());
    }

    pub fn clear(&mut self) {
        self.fill = 0;
        self.limit = 0;
    }

    /// Append one sample; ignored once full.
    #[inline]
    pub fn push(&mut self, sample: i16) {
        if self.fill < self.limit {
            self.samples[self.fill] = sample;
            self.fill += 1;
        }
    }

    pub fn is_full(&self) -> bool {
        self.limit > 0 && self.fill == self.limit
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.fill]
    }
}
