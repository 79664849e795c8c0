// src/audio/streaming.rs
// Background consumer: pages windows between chip and external memory and
// splices committed scratch captures into the loop. Runs on its own thread
// (or inline, for offline rendering) and is the only code that touches the
// external memory.

use crossbeam::channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::memory::{ExternalMemory, MemoryError};
use super::mixer;
use super::region::MergeReport;
use super::window::{
    Completion, Frame, RegionSweep, ScratchMerge, StreamingLink, TransferJob, Window,
    decode_frames, encode_frames,
};
use super::{AudioEvent, FRAME_BYTES};

const IDLE_POLL: Duration = Duration::from_micros(250);

pub struct StreamingManager<M> {
    memory: M,
    link: StreamingLink,
    events: Option<Sender<AudioEvent>>,
    bytes: Vec<u8>,
    chunk: Vec<Frame>,
    passes: u64,
}

fn write_run<M: ExternalMemory>(
    memory: &mut M,
    bytes: &mut Vec<u8>,
    position: usize,
    frames: &[Frame],
) -> Result<(), MemoryError> {
    bytes.resize(frames.len() * FRAME_BYTES, 0);
    encode_frames(frames, bytes);
    memory.write((position * FRAME_BYTES) as u64, bytes)
}

fn read_run<M: ExternalMemory>(
    memory: &mut M,
    bytes: &mut Vec<u8>,
    position: usize,
    frames: &mut [Frame],
) -> Result<(), MemoryError> {
    bytes.resize(frames.len() * FRAME_BYTES, 0);
    memory.read((position * FRAME_BYTES) as u64, bytes)?;
    decode_frames(bytes, frames);
    Ok(())
}

/// Split `[origin, origin + len)` into runs that do not cross the loop end.
/// Without a loop length (first take still growing) the span is linear.
fn runs(
    origin: usize,
    len: usize,
    loop_length: Option<usize>,
) -> impl Iterator<Item = (usize, usize, usize)> {
    let total = loop_length.filter(|&l| l > 0).unwrap_or(usize::MAX);
    let mut done = 0;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let position = (origin + done) % total;
        let run = (len - done).min(total - position);
        let item = (done, position, run);
        done += run;
        Some(item)
    })
}

impl<M: ExternalMemory> StreamingManager<M> {
    pub fn new(memory: M, link: StreamingLink) -> Self {
        Self {
            memory,
            link,
            events: None,
            bytes: Vec::new(),
            chunk: Vec::new(),
            passes: 0,
        }
    }

    pub fn with_events(mut self, events: Sender<AudioEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one pending transfer if there is one. Returns whether work was done.
    pub fn service(&mut self) -> bool {
        let Some(job) = self.link.next_job() else {
            return false;
        };
        let completion = self.transfer(job);
        if let Err(completion) = self.link.complete(completion) {
            // only one transfer is ever outstanding, so the slot is free
            log::error!(
                "completion slot occupied, dropping window {}",
                completion.window.id
            );
        }
        true
    }

    /// Poll for transfers until `running` is cleared or the engine goes away.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!("streaming thread started");
        while running.load(Ordering::Relaxed) {
            if self.service() {
                continue;
            }
            if self.link.is_abandoned() {
                break;
            }
            thread::sleep(IDLE_POLL);
        }
        log::info!("streaming thread stopped after {} passes", self.passes);
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    fn transfer(&mut self, job: TransferJob) -> Completion {
        let TransferJob {
            epoch,
            mut window,
            write_back,
            prefetch_origin,
            loop_length,
            merge,
        } = job;
        self.passes += 1;

        if write_back {
            log::trace!("write back window {} at {}", window.id, window.origin);
            if let Err(e) = self.write_frames(window.origin, window.frames(), loop_length) {
                self.fault("write back", window.origin, e);
            }
        }

        let mut report = MergeReport::new();
        let scratch = merge.map(|merge| {
            if let (Some(sweep), Some(length)) = (&merge.sweep, loop_length) {
                match self.sweep_region(sweep, &merge, length, window.len()) {
                    Ok(positions) => {
                        log::debug!(
                            "folded {} positions of the oldest region at {}",
                            positions,
                            sweep.region.region.start
                        );
                        self.emit(AudioEvent::RegionFolded { positions });
                    }
                    Err(e) => self.fault("region fold", sweep.region.region.start, e),
                }
            }
            match loop_length {
                Some(length) => match self.merge_scratch(&merge, length, window.len()) {
                    Ok(merged) => {
                        log::debug!(
                            "merged {} scratch samples at {}, {} old positions retired",
                            merge.scratch.fill(),
                            merge.scratch.start(),
                            merged.total()
                        );
                        report = merged;
                        self.emit(AudioEvent::ScratchMerged);
                    }
                    Err(e) => self.fault("scratch merge", merge.scratch.start(), e),
                },
                None => log::warn!("scratch merge requested before the loop was closed"),
            }
            merge.scratch
        });

        window.rebase(prefetch_origin);
        window.stale = false;
        if let Err(e) = self.read_frames(prefetch_origin, &mut window, loop_length) {
            self.fault("prefetch", prefetch_origin, e);
        }

        Completion {
            epoch,
            window,
            scratch,
            report,
        }
    }

    fn write_frames(
        &mut self,
        origin: usize,
        frames: &[Frame],
        loop_length: Option<usize>,
    ) -> Result<(), MemoryError> {
        for (done, position, run) in runs(origin, frames.len(), loop_length) {
            write_run(
                &mut self.memory,
                &mut self.bytes,
                position,
                &frames[done..done + run],
            )?;
        }
        Ok(())
    }

    fn read_frames(
        &mut self,
        origin: usize,
        window: &mut Window,
        loop_length: Option<usize>,
    ) -> Result<(), MemoryError> {
        let frames = window.frames_mut();
        for (done, position, run) in runs(origin, frames.len(), loop_length) {
            read_run(
                &mut self.memory,
                &mut self.bytes,
                position,
                &mut frames[done..done + run],
            )?;
        }
        Ok(())
    }

    /// Splice a scratch capture into the new layer, folding whatever old
    /// region it covers into the base layer first. Works in chunks of at most
    /// `chunk_len` positions.
    fn merge_scratch(
        &mut self,
        merge: &ScratchMerge,
        loop_length: usize,
        chunk_len: usize,
    ) -> Result<MergeReport, MemoryError> {
        let samples = merge.scratch.samples();
        let mut report = MergeReport::new();
        let chunk_len = chunk_len.max(1);

        let spans = runs(merge.scratch.start(), samples.len(), Some(loop_length));
        for (done, position, run) in spans {
            let mut offset = 0;
            while offset < run {
                let len = (run - offset).min(chunk_len);
                let start = position + offset;
                self.chunk.resize(len, Frame::default());
                read_run(&mut self.memory, &mut self.bytes, start, &mut self.chunk)?;

                for (i, frame) in self.chunk.iter_mut().enumerate() {
                    if let Some((index, old)) = merge.regions.owner_at(start + i, loop_length) {
                        if old.merge {
                            frame.base = mixer::add(frame.base, frame.new);
                        }
                        report.record(index, &old);
                    }
                    frame.new = samples[done + offset + i];
                }

                write_run(&mut self.memory, &mut self.bytes, start, &self.chunk)?;
                offset += len;
            }
        }
        Ok(report)
    }

    /// Fold the samples the oldest region still owns into the base layer.
    /// Positions the active region covers are left to the engine and the
    /// scratch merge. Returns the number of positions folded.
    fn sweep_region(
        &mut self,
        sweep: &RegionSweep,
        merge: &ScratchMerge,
        loop_length: usize,
        chunk_len: usize,
    ) -> Result<usize, MemoryError> {
        let victim = sweep.region;
        let chunk_len = chunk_len.max(1);
        let mut folded = 0;

        let spans = runs(victim.region.start, victim.region.size, Some(loop_length));
        for (_, position, run) in spans {
            let mut offset = 0;
            while offset < run {
                let len = (run - offset).min(chunk_len);
                let start = position + offset;
                self.chunk.resize(len, Frame::default());
                read_run(&mut self.memory, &mut self.bytes, start, &mut self.chunk)?;

                let mut changed = false;
                for (i, frame) in self.chunk.iter_mut().enumerate() {
                    let t = start + i;
                    if !merge.regions.is_owned_by(&victim, t, loop_length)
                        || sweep.active.is_some_and(|a| a.contains(t, loop_length))
                    {
                        continue;
                    }
                    if frame.new != 0 {
                        frame.base = mixer::add(frame.base, frame.new);
                        frame.new = 0;
                        changed = true;
                    }
                    folded += 1;
                }

                if changed {
                    write_run(&mut self.memory, &mut self.bytes, start, &self.chunk)?;
                }
                offset += len;
            }
        }
        Ok(folded)
    }

    fn fault(&self, during: &str, position: usize, error: MemoryError) {
        log::error!("memory fault during {} at {}: {}", during, position, error);
        self.emit(AudioEvent::MemoryFault(format!(
            "{} at {}: {}",
            during, position, error
        )));
    }

    fn emit(&self, event: AudioEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}
