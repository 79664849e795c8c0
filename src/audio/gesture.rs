// src/audio/gesture.rs
// Footswitch interpretation: edge latching, tap/hold timing and the transport
// transition table.

use super::TransportState;

/// Latches footswitch edges and counts samples since the last transport
/// change and since the last press.
#[derive(Debug, Clone)]
pub struct Gesture {
    threshold: usize,
    down: bool,
    pressed: bool,
    released: bool,
    since_transition: usize,
    since_press: usize,
}

impl Gesture {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            down: false,
            pressed: false,
            released: false,
            since_transition: 0,
            since_press: 0,
        }
    }

    /// Feed the switch level for one sample period.
    pub fn sample(&mut self, down: bool) {
        self.since_transition = self.since_transition.saturating_add(1);
        match (self.down, down) {
            (false, true) => {
                self.pressed = true;
                self.since_press = 0;
            }
            // a release only counts when it completes a latched press
            (true, false) => {
                if self.pressed {
                    self.released = true;
                }
            }
            (true, true) => self.since_press = self.since_press.saturating_add(1),
            (false, false) => {}
        }
        self.down = down;
    }

    /// Clear edges and both timers; called on every transport change.
    pub fn reset(&mut self) {
        self.pressed = false;
        self.released = false;
        self.since_transition = 0;
        self.since_press = 0;
    }

    /// Consume the current press without a transport change.
    pub fn rearm(&mut self) {
        self.pressed = false;
        self.released = false;
        self.since_press = 0;
    }

    pub fn tap(&self) -> bool {
        self.pressed && self.released
    }

    pub fn held(&self) -> bool {
        self.pressed && !self.released && self.down && self.since_press > self.threshold
    }

    pub fn settled(&self) -> bool {
        self.since_transition > self.threshold
    }

    pub fn conditions(&self) -> Conditions {
        Conditions {
            tap: self.tap(),
            held: self.held(),
            settled: self.settled(),
            pressed: self.pressed,
            idle: !self.pressed && !self.down,
            ..Conditions::default()
        }
    }
}

/// Everything a transition may depend on for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    /// Press followed by release since the last reset.
    pub tap: bool,
    /// Switch down past the hold threshold with no release yet.
    pub held: bool,
    /// The current state has lasted past the hold threshold.
    pub settled: bool,
    /// A press edge is latched.
    pub pressed: bool,
    /// No button activity since the last reset.
    pub idle: bool,
    pub scratch_full: bool,
    /// Scratch is home, merged and free for a new capture.
    pub scratch_ready: bool,
    /// First take is long enough and the loop start is prefetched.
    pub first_take_ready: bool,
    pub memory_full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    BeginFirstTake,
    CloseFirstTake,
    OpenScratch,
    PromoteScratch,
    DiscardScratch,
    /// Discard the capture and toggle undo.
    CancelScratch,
    ToggleUndo,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: TransportState,
    pub effect: Effect,
}

fn to(next: TransportState, effect: Effect) -> Option<Transition> {
    Some(Transition { next, effect })
}

/// The transport table. Rows are checked top to bottom within a state; `None`
/// means stay put.
pub fn transition(state: TransportState, c: &Conditions) -> Option<Transition> {
    use Effect as E;
    use TransportState as S;

    match state {
        S::Idle => {
            if c.tap {
                return to(S::FirstRecord, E::BeginFirstTake);
            }
        }
        S::FirstRecord => {
            if (c.tap || c.memory_full) && c.first_take_ready {
                return to(S::FirstPlayback, E::CloseFirstTake);
            }
        }
        S::FirstPlayback => {
            if c.tap && c.settled && c.scratch_ready {
                return to(S::FirstTempRecord, E::OpenScratch);
            }
            if c.tap && !c.settled {
                return to(S::FirstStop, E::None);
            }
            if c.held {
                return to(S::Idle, E::Reset);
            }
        }
        S::FirstStop => {
            if c.tap {
                return to(S::FirstPlayback, E::None);
            }
            if c.held {
                return to(S::Idle, E::Reset);
            }
        }
        S::FirstTempRecord => {
            if c.tap {
                return to(S::Stopped, E::DiscardScratch);
            }
            if c.held {
                return to(S::Idle, E::Reset);
            }
            if c.scratch_full && c.idle {
                return to(S::Record, E::PromoteScratch);
            }
        }
        S::Record => {
            if c.pressed && c.scratch_ready {
                return to(S::Play, E::None);
            }
        }
        S::Play => {
            if c.tap && c.settled && c.scratch_ready {
                return to(S::TempRecord, E::OpenScratch);
            }
            if c.tap && !c.settled {
                return to(S::Stopped, E::None);
            }
            if c.held {
                return to(S::Play, E::ToggleUndo);
            }
        }
        S::TempRecord => {
            if c.tap {
                return to(S::Stopped, E::DiscardScratch);
            }
            if c.held {
                return to(S::Play, E::CancelScratch);
            }
            if c.scratch_full && c.idle {
                return to(S::Record, E::PromoteScratch);
            }
        }
        S::Stopped => {
            if c.tap {
                return to(S::Playback1, E::None);
            }
            if c.held {
                return to(S::Idle, E::Reset);
            }
        }
        S::Playback1 => {
            if c.tap && c.settled && c.scratch_ready {
                return to(S::TempRecord, E::OpenScratch);
            }
            if c.tap && !c.settled {
                return to(S::Stopped, E::None);
            }
        }
    }
    None
}
