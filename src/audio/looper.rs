// src/audio/looper.rs
// The per-sample engine. Owned by the audio callback; everything here is
// bounded-time, lock-free and allocation-free once constructed.

use crossbeam::channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use super::gesture::{self, Conditions, Effect, Gesture, Transition};
use super::memory::ExternalMemory;
use super::mixer::add;
use super::region::{ActiveRegion, RegionTracker};
use super::scratch::ScratchBuffer;
use super::streaming::StreamingManager;
use super::window::{
    Completion, EngineLink, Frame, RegionSweep, ScratchMerge, TransferJob, Window, window_link,
};
use super::{AudioEvent, EngineConfig, TransportState};

/// Live engine status for other threads. Written once per sample with relaxed
/// stores; readers get a recent, not necessarily coherent, picture.
#[derive(Debug, Default)]
pub struct EngineStatus {
    state: AtomicU8,
    loop_time: AtomicUsize,
    loop_length: AtomicUsize,
    undo: AtomicBool,
    old_regions: AtomicUsize,
    overruns: AtomicUsize,
    transfer_pending: AtomicBool,
}

impl EngineStatus {
    pub fn state(&self) -> TransportState {
        TransportState::from_index(self.state.load(Ordering::Relaxed))
    }

    pub fn loop_time(&self) -> usize {
        self.loop_time.load(Ordering::Relaxed)
    }

    pub fn loop_length(&self) -> usize {
        self.loop_length.load(Ordering::Relaxed)
    }

    pub fn undo(&self) -> bool {
        self.undo.load(Ordering::Relaxed)
    }

    pub fn old_regions(&self) -> usize {
        self.old_regions.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> usize {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn transfer_pending(&self) -> bool {
        self.transfer_pending.load(Ordering::Relaxed)
    }
}

/// Where the single scratch buffer currently is.
enum ScratchSlot {
    /// On the audio side, free or capturing.
    Ready(ScratchBuffer),
    /// Promoted; rides along with the next transfer.
    Committed(ScratchMerge),
    /// With the streaming thread.
    InFlight,
}

pub struct LooperEngine {
    config: EngineConfig,
    max_loop_length: usize,
    state: TransportState,
    gesture: Gesture,
    tracker: RegionTracker,
    loop_length: usize,
    loop_time: usize,
    active: Window,
    /// The other window, when it is home. `None` means a transfer is pending.
    standby: Option<Window>,
    /// The standby window was loaded during the current epoch.
    standby_current: bool,
    scratch: ScratchSlot,
    /// Oldest region being folded away; its slot is freed when the scratch
    /// buffer comes back.
    sweeping: Option<RegionSweep>,
    link: EngineLink,
    epoch: u64,
    overruns: usize,
    events: Option<Sender<AudioEvent>>,
    status: Arc<EngineStatus>,
}

/// Build an engine and the streaming manager that serves it. The loop is
/// limited to what `memory` can hold.
pub fn create_engine<M: ExternalMemory>(
    config: EngineConfig,
    memory: M,
) -> (LooperEngine, StreamingManager<M>) {
    let capacity = usize::try_from(memory.capacity()).unwrap_or(usize::MAX);
    let config = if capacity < config.memory_bytes {
        log::warn!(
            "external memory holds {} bytes, {} configured",
            capacity,
            config.memory_bytes
        );
        EngineConfig {
            memory_bytes: capacity,
            ..config
        }
    } else {
        config
    };
    let (engine_link, streaming_link) = window_link();
    (
        LooperEngine::new(config, engine_link),
        StreamingManager::new(memory, streaming_link),
    )
}

impl LooperEngine {
    pub fn new(config: EngineConfig, link: EngineLink) -> Self {
        let window_size = config.window_size;
        Self {
            max_loop_length: config.max_loop_length(),
            state: TransportState::Idle,
            gesture: Gesture::new(config.hold_threshold),
            tracker: RegionTracker::new(),
            loop_length: 0,
            loop_time: 0,
            active: Window::new(0, window_size),
            standby: Some(Window::new(1, window_size)),
            standby_current: false,
            scratch: ScratchSlot::Ready(ScratchBuffer::new(config.scratch_capacity)),
            sweeping: None,
            link,
            epoch: 0,
            overruns: 0,
            events: None,
            status: Arc::new(EngineStatus::default()),
            config,
        }
    }

    pub fn with_events(mut self, events: Sender<AudioEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Process one input sample with the current footswitch level and return
    /// the output sample.
    pub fn process(&mut self, input: i16, switch_down: bool) -> i16 {
        self.collect();
        self.gesture.sample(switch_down);
        self.step_transport();

        let output = if self.state.is_running() {
            self.render(input)
        } else {
            input
        };
        self.publish();
        output
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn loop_length(&self) -> usize {
        self.loop_length
    }

    pub fn loop_time(&self) -> usize {
        self.loop_time
    }

    pub fn undo(&self) -> bool {
        self.tracker.undo()
    }

    pub fn old_regions(&self) -> usize {
        self.tracker.old_count()
    }

    pub fn overruns(&self) -> usize {
        self.overruns
    }

    pub fn transfer_pending(&self) -> bool {
        self.standby.is_none()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        Arc::clone(&self.status)
    }

    fn emit(&self, event: AudioEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }

    fn publish(&self) {
        let status = &self.status;
        status.state.store(self.state.index(), Ordering::Relaxed);
        status.loop_time.store(self.loop_time, Ordering::Relaxed);
        status.loop_length.store(self.loop_length, Ordering::Relaxed);
        status.undo.store(self.tracker.undo(), Ordering::Relaxed);
        status
            .old_regions
            .store(self.tracker.old_count(), Ordering::Relaxed);
        status.overruns.store(self.overruns, Ordering::Relaxed);
        status
            .transfer_pending
            .store(self.standby.is_none(), Ordering::Relaxed);
    }

    // ---- transfers -------------------------------------------------------

    fn collect(&mut self) {
        while let Some(done) = self.link.poll() {
            let Completion {
                epoch,
                window,
                scratch,
                report,
            } = done;
            let current = epoch == self.epoch;
            if current {
                self.tracker.apply(&report);
                if scratch.is_some()
                    && let Some(sweep) = self.sweeping.take()
                {
                    self.finish_sweep(sweep);
                }
            }
            if let Some(mut scratch) = scratch {
                scratch.clear();
                self.scratch = ScratchSlot::Ready(scratch);
            }
            self.receive(window, current);
        }
    }

    /// Memory has been folded; do the same for the window on chip and stop
    /// tracking the region.
    fn finish_sweep(&mut self, sweep: RegionSweep) {
        let RegionSweep { index, region, .. } = sweep;
        let origin = self.active.origin;
        let loop_length = self.loop_length;
        let mut changed = false;
        for (i, frame) in self.active.frames_mut().iter_mut().enumerate() {
            let t = (origin + i) % loop_length;
            if frame.new != 0 && self.tracker.owns(index, &region, t, loop_length) {
                frame.base = add(frame.base, frame.new);
                frame.new = 0;
                changed = true;
            }
        }
        self.active.dirty |= changed;
        self.tracker.remove(index, &region);
    }

    fn looping(&self) -> bool {
        self.state != TransportState::FirstRecord && self.loop_length > 0
    }

    fn receive(&mut self, mut window: Window, current: bool) {
        if !(self.active.stale && current && self.looping()) {
            self.standby = Some(window);
            self.standby_current = current;
            return;
        }

        // Recovering from an overrun: the playhead is running on a stale copy.
        if window.origin == self.active.origin {
            window.offset = self.active.offset;
            let stale = std::mem::replace(&mut self.active, window);
            let next = (self.active.origin + self.config.window_size) % self.loop_length;
            self.submit(stale, next, Some(self.loop_length));
        } else {
            let origin = self.active.origin;
            self.submit(window, origin, Some(self.loop_length));
        }
    }

    fn submit(&mut self, window: Window, prefetch_origin: usize, loop_length: Option<usize>) {
        let merge = match std::mem::replace(&mut self.scratch, ScratchSlot::InFlight) {
            ScratchSlot::Committed(mut merge) => {
                if let Some(sweep) = &mut merge.sweep {
                    sweep.active = self.tracker.active();
                }
                Some(merge)
            }
            other => {
                self.scratch = other;
                None
            }
        };
        let job = TransferJob {
            epoch: self.epoch,
            write_back: window.dirty && !window.stale,
            window,
            prefetch_origin,
            loop_length,
            merge,
        };
        if let Err(job) = self.link.submit(job) {
            // cannot happen while both windows are accounted for; keep them
            if let Some(merge) = job.merge {
                self.scratch = ScratchSlot::Committed(merge);
            }
            let mut window = job.window;
            window.stale = true;
            self.standby = Some(window);
            self.standby_current = false;
        }
    }

    /// The active window is used up: swap in the standby window and send the
    /// used one off, or report an overrun and keep going on a stale copy.
    fn advance_window(&mut self) {
        let window_size = self.config.window_size;
        let first_take = self.state == TransportState::FirstRecord;
        let next = if first_take {
            self.active.origin + window_size
        } else {
            (self.active.origin + window_size) % self.loop_length
        };
        if first_take && next >= self.max_loop_length {
            // memory is full; the take closes on the next sample
            return;
        }

        match self.standby.take() {
            Some(mut fresh) => {
                if fresh.origin != next || (!self.standby_current && !first_take) {
                    fresh.rebase(next);
                    fresh.stale = !first_take;
                }
                let done = std::mem::replace(&mut self.active, fresh);
                if first_take {
                    self.submit(done, 0, None);
                } else {
                    let prefetch = (next + window_size) % self.loop_length;
                    self.submit(done, prefetch, Some(self.loop_length));
                }
            }
            None => {
                self.overruns += 1;
                self.emit(AudioEvent::Overrun { origin: next });
                self.active.rebase(next);
                // a first-take window is rewritten in full, so it is never stale
                self.active.stale = !first_take;
            }
        }
    }

    // ---- transport -------------------------------------------------------

    fn conditions(&self) -> Conditions {
        let (scratch_ready, scratch_full) = match &self.scratch {
            ScratchSlot::Ready(scratch) => (true, scratch.is_full()),
            _ => (false, false),
        };
        Conditions {
            scratch_ready,
            scratch_full,
            first_take_ready: self.first_take_ready(),
            memory_full: self.state == TransportState::FirstRecord
                && self.loop_length >= self.max_loop_length,
            ..self.gesture.conditions()
        }
    }

    fn closing_length(&self) -> usize {
        self.loop_length - self.loop_length % self.config.window_size
    }

    fn first_take_ready(&self) -> bool {
        self.state == TransportState::FirstRecord
            && self.closing_length() >= self.config.min_loop_length()
            && self.standby_current
            && self
                .standby
                .as_ref()
                .is_some_and(|window| window.origin == 0 && !window.stale)
    }

    fn step_transport(&mut self) {
        let conditions = self.conditions();
        let Some(Transition { next, effect }) = gesture::transition(self.state, &conditions)
        else {
            return;
        };

        self.apply(effect);
        if effect == Effect::ToggleUndo {
            self.gesture.rearm();
        } else {
            self.gesture.reset();
        }

        if next != self.state {
            self.emit(AudioEvent::StateChanged {
                from: self.state,
                to: next,
            });
            self.state = next;
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::BeginFirstTake | Effect::Reset => self.reset(),
            Effect::CloseFirstTake => self.close_first_take(),
            Effect::OpenScratch => {
                let limit = self.config.scratch_capacity_for(self.loop_length);
                if let ScratchSlot::Ready(scratch) = &mut self.scratch {
                    scratch.begin(self.loop_time, limit);
                }
            }
            Effect::PromoteScratch => self.promote_scratch(),
            Effect::DiscardScratch => self.discard_scratch(),
            Effect::CancelScratch => {
                self.discard_scratch();
                self.toggle_undo();
            }
            Effect::ToggleUndo => self.toggle_undo(),
        }
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.tracker.reset();
        self.sweeping = None;
        self.loop_length = 0;
        self.loop_time = 0;
        self.active.clear();
        self.standby_current = false;
        self.scratch = match std::mem::replace(&mut self.scratch, ScratchSlot::InFlight) {
            ScratchSlot::Ready(mut scratch) => {
                scratch.clear();
                ScratchSlot::Ready(scratch)
            }
            ScratchSlot::Committed(merge) => {
                let mut scratch = merge.scratch;
                scratch.clear();
                ScratchSlot::Ready(scratch)
            }
            ScratchSlot::InFlight => ScratchSlot::InFlight,
        };
    }

    fn close_first_take(&mut self) {
        let length = self.closing_length();
        let Some(start) = self.standby.take() else {
            return;
        };
        // whatever the partial window holds lies past the end of the loop
        let complete = self.active.is_exhausted();
        let mut tail = std::mem::replace(&mut self.active, start);
        tail.stale = !complete;

        self.loop_length = length;
        self.loop_time = 0;
        self.tracker
            .set_first_take(ActiveRegion::new(0, length, length));
        let prefetch = self.config.window_size % length;
        self.submit(tail, prefetch, Some(length));
        self.emit(AudioEvent::FirstTakeClosed {
            loop_length: length,
        });
    }

    fn promote_scratch(&mut self) {
        let scratch = match std::mem::replace(&mut self.scratch, ScratchSlot::InFlight) {
            ScratchSlot::Ready(scratch) => scratch,
            other => {
                self.scratch = other;
                return;
            }
        };
        let region = ActiveRegion::new(scratch.start(), scratch.fill(), self.loop_length);
        // an undone region is superseded as a silent shadow; the new one plays
        let undone = self.tracker.undo();
        self.tracker.supersede(region);
        if undone {
            self.toggle_undo();
        }
        let sweep = self.reclaim_slot();
        self.emit(AudioEvent::ScratchCommitted {
            start: region.start,
            size: region.size,
        });
        self.scratch = ScratchSlot::Committed(ScratchMerge {
            scratch,
            regions: self.tracker.snapshot(),
            sweep,
        });
    }

    /// Keep a slot free for the next promotion. A shadow hides nothing older
    /// than itself and is dropped at once; a merging region is folded into
    /// the base layer by the transfer that carries the scratch buffer.
    fn reclaim_slot(&mut self) -> Option<RegionSweep> {
        if !self.tracker.is_full() {
            return None;
        }
        let (index, region) = self.tracker.oldest()?;
        if !region.merge {
            self.tracker.remove(index, &region);
            return None;
        }
        let sweep = RegionSweep {
            index,
            region,
            active: None,
        };
        self.sweeping = Some(sweep);
        Some(sweep)
    }

    fn discard_scratch(&mut self) {
        if let ScratchSlot::Ready(scratch) = &mut self.scratch {
            scratch.clear();
        }
    }

    fn toggle_undo(&mut self) {
        let undo = self.tracker.toggle_undo();
        self.emit(AudioEvent::UndoToggled(undo));
    }

    // ---- audio -----------------------------------------------------------

    fn render(&mut self, input: i16) -> i16 {
        // first take parked at the memory limit
        if self.active.is_exhausted() {
            return input;
        }

        let t = self.loop_time;
        let frame = self.active.current();
        let first_take = self.state == TransportState::FirstRecord;

        let mut mixed = input;
        if self.tracker.is_live(t, self.loop_length) {
            mixed = add(mixed, frame.new);
        }
        if !first_take {
            mixed = add(mixed, frame.base);
        }

        match self.state {
            TransportState::FirstRecord => self.active.set_current(Frame {
                base: 0,
                new: input,
            }),
            TransportState::Record => {
                let base = if self.tracker.claim(t, self.loop_length) {
                    add(frame.base, frame.new)
                } else {
                    frame.base
                };
                self.active.set_current(Frame { base, new: input });
            }
            TransportState::FirstTempRecord | TransportState::TempRecord => {
                if let ScratchSlot::Ready(scratch) = &mut self.scratch {
                    scratch.push(input);
                }
            }
            _ => {}
        }

        self.active.offset += 1;
        if first_take {
            self.loop_length += 1;
            self.loop_time = self.loop_length;
        } else {
            self.loop_time = (t + 1) % self.loop_length;
            if self.state == TransportState::Record {
                self.tracker.grow_active(self.loop_length);
            }
        }

        if self.active.is_exhausted() {
            self.advance_window();
        }
        mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBank;
    use crate::audio::{FRAME_BYTES, MAX_OLD_REGIONS};
    use crossbeam::channel::{Receiver, bounded};
    use std::thread;
    use std::time::Duration;

    const W: usize = 8;

    fn test_config(positions: usize) -> EngineConfig {
        EngineConfig {
            sample_rate: 1000,
            window_size: W,
            scratch_capacity: 12,
            hold_threshold: 4,
            memory_bytes: positions * FRAME_BYTES,
        }
    }

    struct Rig {
        engine: LooperEngine,
        streaming: StreamingManager<MemoryBank>,
        events: Receiver<AudioEvent>,
        /// Run the background pass after every sample.
        serviced: bool,
    }

    impl Rig {
        fn new(positions: usize) -> Self {
            let config = test_config(positions);
            let (tx, rx) = bounded(1024);
            let bank = MemoryBank::new(config.memory_bytes);
            let (engine, streaming) = create_engine(config, bank);
            Self {
                engine: engine.with_events(tx.clone()),
                streaming: streaming.with_events(tx),
                events: rx,
                serviced: true,
            }
        }

        fn step(&mut self, input: i16, down: bool) -> i16 {
            let output = self.engine.process(input, down);
            if self.serviced {
                self.streaming.service();
            }
            output
        }

        fn run(&mut self, input: i16, samples: usize) -> Vec<i16> {
            (0..samples).map(|_| self.step(input, false)).collect()
        }

        /// Press for two samples, release on the third.
        fn tap(&mut self, input: i16) -> Vec<i16> {
            vec![
                self.step(input, true),
                self.step(input, true),
                self.step(input, false),
            ]
        }

        fn hold(&mut self, samples: usize) {
            for _ in 0..samples {
                self.step(0, true);
            }
            self.step(0, false);
        }

        /// Play one full loop of silence and return `(position, output)` pairs.
        fn play_loop(&mut self) -> Vec<(usize, i16)> {
            (0..self.engine.loop_length())
                .map(|_| {
                    let t = self.engine.loop_time();
                    (t, self.step(0, false))
                })
                .collect()
        }

        fn overrun_events(&self) -> usize {
            self.events
                .try_iter()
                .filter(|event| matches!(event, AudioEvent::Overrun { .. }))
                .count()
        }

        fn frame_at(&self, position: usize) -> Frame {
            let at = position * FRAME_BYTES;
            Frame::from_bytes(&self.streaming.memory().as_bytes()[at..at + FRAME_BYTES])
        }
    }

    /// Hold the footswitch in Record until the scratch merge is back and the
    /// press ends the overdub. Returns the first position not recorded.
    fn record_until_play(rig: &mut Rig, input: i16) -> usize {
        loop {
            let t = rig.engine.loop_time();
            rig.step(input, true);
            if rig.engine.state() == TransportState::Play {
                rig.step(0, false);
                return t;
            }
        }
    }

    fn take_sample(t: usize) -> i16 {
        100 + 3 * t as i16
    }

    /// Record a first take of `windows` windows whose sample at position `t`
    /// is `take_sample(t)`, and close it.
    fn record_take(rig: &mut Rig, windows: usize) {
        rig.step(take_sample(0), true);
        rig.step(take_sample(0), true);
        rig.step(take_sample(0), false);
        assert_eq!(rig.engine.state(), TransportState::FirstRecord);

        while rig.engine.loop_length() < windows * W {
            let x = take_sample(rig.engine.loop_length());
            rig.step(x, false);
        }
        for down in [true, true, false] {
            let x = take_sample(rig.engine.loop_length());
            rig.step(x, down);
        }
        assert_eq!(rig.engine.state(), TransportState::FirstPlayback);
        assert_eq!(rig.engine.loop_length(), windows * W);
    }

    #[test]
    fn test_idle_passes_input_through() {
        let mut rig = Rig::new(128);
        assert_eq!(rig.run(1234, 20), vec![1234; 20]);
        assert_eq!(rig.engine.loop_time(), 0);
        assert!(!rig.engine.transfer_pending());
    }

    fn first_take_then_playback(c: i16, expected: i16) {
        let mut rig = Rig::new(128);
        let mut recorded = rig.tap(c);
        assert_eq!(rig.engine.state(), TransportState::FirstRecord);
        recorded.extend(rig.run(c, 38));
        recorded.push(rig.step(c, true));
        recorded.push(rig.step(c, true));
        assert!(recorded.iter().all(|&y| y == c));

        // the release closes the take and is the first playback sample
        let mut played = vec![rig.step(c, false)];
        assert_eq!(rig.engine.state(), TransportState::FirstPlayback);
        assert_eq!(rig.engine.loop_length(), 40);
        played.extend(rig.run(c, 39));
        assert!(played.iter().all(|&y| y == expected), "{:?}", played);
        assert_eq!(rig.engine.loop_time(), 0);
    }

    #[test]
    fn test_first_take_plays_back_doubled() {
        first_take_then_playback(1000, 2000);
    }

    #[test]
    fn test_first_take_playback_saturates() {
        first_take_then_playback(20_000, i16::MAX);
        first_take_then_playback(-20_000, i16::MIN);
    }

    #[test]
    fn test_first_take_waits_for_minimum_length() {
        let mut rig = Rig::new(128);
        rig.tap(1);
        rig.run(1, 10);
        rig.tap(1);
        assert_eq!(rig.engine.state(), TransportState::FirstRecord);
        // the early tap stays latched and closes the take once it is long enough
        while rig.engine.state() == TransportState::FirstRecord {
            rig.step(1, false);
        }
        assert_eq!(rig.engine.loop_length(), 4 * W);
    }

    #[test]
    fn test_first_take_closes_when_memory_is_full() {
        let mut rig = Rig::new(48);
        rig.tap(5);
        rig.run(5, 60);
        assert_eq!(rig.engine.state(), TransportState::FirstPlayback);
        assert_eq!(rig.engine.loop_length(), 48);
        // the last window made it to memory before playback reached it
        assert_eq!(rig.frame_at(47), Frame { base: 0, new: 5 });
        assert!(rig.play_loop().iter().all(|&(_, y)| y == 5));
    }

    #[test]
    fn test_overrun_reported_once_and_window_survives() {
        let mut rig = Rig::new(128);
        rig.serviced = false;
        rig.tap(0);
        // positions 1..=16 without a background pass: two exhaustions
        for t in 1..=16 {
            rig.step(t as i16, false);
        }
        assert_eq!(rig.engine.overruns(), 1);
        assert_eq!(rig.overrun_events(), 1);

        rig.serviced = true;
        rig.streaming.service();
        for t in 0..8 {
            assert_eq!(
                rig.frame_at(t),
                Frame {
                    base: 0,
                    new: t as i16
                }
            );
        }
        rig.run(0, 40);
        assert_eq!(rig.engine.overruns(), 1);
        assert_eq!(rig.overrun_events(), 0);
    }

    #[test]
    fn test_overrun_during_playback_recovers() {
        let mut rig = Rig::new(128);
        record_take(&mut rig, 5);
        rig.serviced = false;
        // the playhead crosses two window boundaries while the transfer stalls
        rig.run(0, 17);
        assert_eq!(rig.engine.overruns(), 1);

        // one more glitched sample, then the fresh window is adopted mid-way
        rig.serviced = true;
        rig.run(0, 2);
        let played = rig.play_loop();
        let played_again = rig.play_loop();
        assert_eq!(rig.engine.overruns(), 1);
        assert_eq!(rig.overrun_events(), 1);
        for (t, y) in played.into_iter().chain(played_again) {
            assert_eq!(y, take_sample(t), "position {}", t);
        }
    }

    #[test]
    fn test_tap_cancelled_overdub_leaves_loop_unchanged() {
        let mut rig = Rig::new(128);
        record_take(&mut rig, 5);
        let mut before = rig.play_loop();
        before.sort();
        let undo_before = rig.engine.undo();

        rig.run(0, 6);
        rig.step(0, true);
        rig.step(0, true);
        rig.step(3000, false);
        assert_eq!(rig.engine.state(), TransportState::FirstTempRecord);
        rig.run(3000, 3);
        rig.tap(3000);
        assert_eq!(rig.engine.state(), TransportState::Stopped);

        rig.tap(0);
        assert_eq!(rig.engine.state(), TransportState::Playback1);
        let mut after = rig.play_loop();
        after.sort();
        assert_eq!(after, before);
        assert_eq!(rig.engine.undo(), undo_before);
        for (t, y) in after {
            assert_eq!(y, take_sample(t));
        }
    }

    /// First take, then a 12-sample temp-record capture of `b` starting at
    /// position 9, promoted at position 21 and recorded inline for `record`
    /// samples (at least one).
    fn overdub(rig: &mut Rig, b: i16, record: usize) {
        record_take(rig, 5);
        rig.run(0, 6);
        rig.step(0, true);
        rig.step(0, true);
        rig.step(b, false);
        assert_eq!(rig.engine.state(), TransportState::FirstTempRecord);
        rig.run(b, 11);
        assert_eq!(rig.engine.loop_time(), 21);
        for _ in 0..record {
            rig.step(b, false);
        }
        assert_eq!(rig.engine.state(), TransportState::Record);
    }

    #[test]
    fn test_overdub_undo_and_redo() {
        let b = 1000;
        let mut rig = Rig::new(128);
        overdub(&mut rig, b, 9);
        assert_eq!(rig.engine.old_regions(), 1);

        // the press ends Record; its release is not a tap
        rig.step(0, true);
        assert_eq!(rig.engine.state(), TransportState::Play);
        rig.step(0, false);
        assert_eq!(rig.engine.state(), TransportState::Play);

        let overdubbed = |t: usize| (9..30).contains(&t);
        for (t, y) in rig.play_loop() {
            let expected = if overdubbed(t) { take_sample(t) + b } else { take_sample(t) };
            assert_eq!(y, expected, "position {}", t);
        }

        rig.hold(6);
        assert!(rig.engine.undo());
        assert_eq!(rig.engine.state(), TransportState::Play);
        for (t, y) in rig.play_loop() {
            assert_eq!(y, take_sample(t), "undone, position {}", t);
        }

        rig.hold(6);
        assert!(!rig.engine.undo());
        for (t, y) in rig.play_loop() {
            let expected = if overdubbed(t) { take_sample(t) + b } else { take_sample(t) };
            assert_eq!(y, expected, "redone, position {}", t);
        }
        assert_eq!(rig.engine.overruns(), 0);
    }

    #[test]
    fn test_record_waits_for_scratch_merge() {
        let mut rig = Rig::new(128);
        overdub(&mut rig, 500, 1);
        rig.serviced = false;
        // merge has not run: the press is ignored
        rig.step(500, false);
        rig.step(500, false);
        rig.step(500, true);
        assert_eq!(rig.engine.state(), TransportState::Record);
    }

    #[test]
    fn test_first_take_retires_after_full_overdub() {
        let mut rig = Rig::new(128);
        overdub(&mut rig, 7, 1);
        // 12 positions merged in the background, 28 claimed inline
        for _ in 0..26 {
            rig.step(7, false);
        }
        assert_eq!(rig.engine.old_regions(), 1);
        rig.step(7, false);
        assert_eq!(rig.engine.old_regions(), 0);
        assert_eq!(rig.engine.loop_time(), 9);
    }

    #[test]
    fn test_quick_tap_stops_and_resumes() {
        let mut rig = Rig::new(128);
        record_take(&mut rig, 4);
        rig.step(0, true);
        rig.step(0, false);
        assert_eq!(rig.engine.state(), TransportState::FirstStop);

        let parked = rig.engine.loop_time();
        assert_eq!(rig.run(77, 10), vec![77; 10]);
        assert_eq!(rig.engine.loop_time(), parked);

        rig.tap(0);
        assert_eq!(rig.engine.state(), TransportState::FirstPlayback);
        assert_eq!(rig.engine.loop_time(), parked + 1);
    }

    #[test]
    fn test_hold_in_stop_resets() {
        let mut rig = Rig::new(128);
        record_take(&mut rig, 4);
        rig.step(0, true);
        rig.step(0, false);
        rig.hold(6);
        assert_eq!(rig.engine.state(), TransportState::Idle);
        assert_eq!(rig.engine.loop_length(), 0);
        assert_eq!(rig.engine.old_regions(), 0);
        assert_eq!(rig.run(9, 3), vec![9; 3]);
    }

    #[test]
    fn test_status_mirrors_engine() {
        let mut rig = Rig::new(128);
        let status = rig.engine.status();
        record_take(&mut rig, 4);
        rig.run(0, 3);
        assert_eq!(status.state(), TransportState::FirstPlayback);
        assert_eq!(status.loop_length(), 32);
        assert_eq!(status.loop_time(), rig.engine.loop_time());
        assert!(!status.undo());
        assert_eq!(status.overruns(), 0);

        let changes: Vec<_> = rig
            .events
            .try_iter()
            .filter_map(|event| match event {
                AudioEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![TransportState::FirstRecord, TransportState::FirstPlayback]
        );
    }

    #[test]
    fn test_more_overdubs_than_region_slots_lose_nothing() {
        let mut rig = Rig::new(1024);
        record_take(&mut rig, 100);

        let mut overdubs = Vec::new();
        for k in 0..=MAX_OLD_REGIONS {
            let b = 1000 + 10 * k as i16;
            rig.run(0, 6);
            rig.step(0, true);
            rig.step(0, true);
            let start = rig.engine.loop_time();
            rig.step(b, false);
            rig.run(b, 11);
            rig.step(b, false);
            assert_eq!(rig.engine.state(), TransportState::Record);
            let end = record_until_play(&mut rig, b);
            assert!(start < end);
            assert!(rig.engine.old_regions() <= MAX_OLD_REGIONS);
            overdubs.push((start..end, b));
        }
        // the first take and the first overdub were folded into the base layer
        assert_eq!(rig.engine.old_regions(), MAX_OLD_REGIONS - 1);
        let folds = rig
            .events
            .try_iter()
            .filter(|event| matches!(event, AudioEvent::RegionFolded { .. }))
            .count();
        assert_eq!(folds, 2);

        for _ in 0..2 {
            for (t, y) in rig.play_loop() {
                let overdub = overdubs
                    .iter()
                    .find(|(span, _)| span.contains(&t))
                    .map_or(0, |&(_, b)| b);
                assert_eq!(y, take_sample(t) + overdub, "position {}", t);
            }
        }
        assert_eq!(rig.engine.overruns(), 0);
    }

    #[test]
    fn test_refilled_overdub_after_cancel_clears_undo() {
        let (b, c) = (1000, 300);
        let mut rig = Rig::new(128);
        overdub(&mut rig, b, 9);
        rig.step(0, true);
        rig.step(0, false);
        assert_eq!(rig.engine.state(), TransportState::Play);

        // into temp record, then hold: the capture is dropped and the overdub undone
        rig.run(0, 6);
        rig.tap(0);
        assert_eq!(rig.engine.state(), TransportState::TempRecord);
        rig.hold(6);
        assert_eq!(rig.engine.state(), TransportState::Play);
        assert!(rig.engine.undo());

        rig.run(0, 6);
        rig.step(0, true);
        rig.step(0, true);
        let start = rig.engine.loop_time();
        rig.step(c, false);
        assert_eq!(rig.engine.state(), TransportState::TempRecord);
        rig.run(c, 11);
        rig.step(c, false);
        assert_eq!(rig.engine.state(), TransportState::Record);
        assert!(!rig.engine.undo());
        let end = record_until_play(&mut rig, c);
        assert!(start < end);

        let toggles: Vec<_> = rig
            .events
            .try_iter()
            .filter_map(|event| match event {
                AudioEvent::UndoToggled(undo) => Some(undo),
                _ => None,
            })
            .collect();
        assert_eq!(toggles, vec![true, false]);

        // the undone overdub stays silent under the new one
        for (t, y) in rig.play_loop() {
            let expected = if (start..end).contains(&t) {
                take_sample(t) + c
            } else {
                take_sample(t)
            };
            assert_eq!(y, expected, "position {}", t);
        }
        assert!(!rig.engine.undo());
    }

    /// Wait for the streaming thread instead of servicing inline.
    fn paced(engine: &mut LooperEngine, input: i16, down: bool) -> i16 {
        for _ in 0..1000 {
            if !engine.transfer_pending() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
            engine.collect();
        }
        assert!(!engine.transfer_pending(), "streaming thread never answered");
        engine.process(input, down)
    }

    #[test]
    fn test_streaming_thread_serves_engine() {
        let (c, b) = (200, 50);
        let (mut engine, mut streaming) =
            create_engine(test_config(128), MemoryBank::new(128 * FRAME_BYTES));
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let worker = thread::spawn(move || {
            streaming.run(&flag);
            streaming
        });

        for down in [true, true, false] {
            paced(&mut engine, c, down);
        }
        while engine.loop_length() < 5 * W {
            paced(&mut engine, c, false);
        }
        for down in [true, true, false] {
            paced(&mut engine, c, down);
        }
        assert_eq!(engine.state(), TransportState::FirstPlayback);
        assert_eq!(engine.loop_length(), 5 * W);

        for _ in 0..6 {
            paced(&mut engine, 0, false);
        }
        paced(&mut engine, 0, true);
        paced(&mut engine, 0, true);
        let start = engine.loop_time();
        for _ in 0..12 {
            paced(&mut engine, b, false);
        }
        paced(&mut engine, b, false);
        assert_eq!(engine.state(), TransportState::Record);
        let end = loop {
            let t = engine.loop_time();
            paced(&mut engine, b, true);
            if engine.state() == TransportState::Play {
                break t;
            }
        };
        paced(&mut engine, 0, false);

        for _ in 0..2 * engine.loop_length() {
            let t = engine.loop_time();
            let expected = if (start..end).contains(&t) { c + b } else { c };
            assert_eq!(paced(&mut engine, 0, false), expected, "position {}", t);
        }
        assert_eq!(engine.overruns(), 0);

        running.store(false, Ordering::Relaxed);
        let streaming = worker.join().unwrap();
        let at = start * FRAME_BYTES;
        let frame = Frame::from_bytes(&streaming.memory().as_bytes()[at..at + FRAME_BYTES]);
        assert_eq!(frame, Frame { base: c, new: b });

        // the worker also stops once the engine is gone
        let worker = thread::spawn(move || {
            let mut streaming = streaming;
            streaming.run(&AtomicBool::new(true));
        });
        drop(engine);
        worker.join().unwrap();
    }

    #[test]
    fn test_loop_limited_by_memory_capacity() {
        let (engine, streaming) =
            create_engine(test_config(128), MemoryBank::new(50 * FRAME_BYTES));
        assert_eq!(engine.config().memory_bytes, 50 * FRAME_BYTES);
        assert_eq!(engine.config().max_loop_length(), 48);

        let (tx, rx) = bounded(64);
        let mut rig = Rig {
            engine: engine.with_events(tx),
            streaming,
            events: rx,
            serviced: true,
        };
        rig.tap(5);
        rig.run(5, 60);
        assert_eq!(rig.engine.state(), TransportState::FirstPlayback);
        assert_eq!(rig.engine.loop_length(), 48);
    }
}
