//! Station selector: current index and volume, plus whether a station change
//! is still waiting for its stream to confirm.

use radioclick_proto::protocol::{Gesture, SelectorState, MAX_VOLUME, SKIP_STRIDE};
use tokio::time::Instant;

use crate::supervisor::Generation;

/// Index after `gesture` in a catalog of `len` stations.  Always `< len`.
pub fn next_index(gesture: Gesture, index: usize, len: usize) -> usize {
    debug_assert!(len > 0);
    let index = index % len;
    match gesture {
        Gesture::Next => (index + 1) % len,
        Gesture::Previous => (index + len - 1) % len,
        Gesture::SkipForward => (index + SKIP_STRIDE % len) % len,
        Gesture::VolumeUp | Gesture::VolumeDown => index,
    }
}

pub fn next_volume(gesture: Gesture, volume: u8, step: u8) -> u8 {
    match gesture {
        Gesture::VolumeUp => volume.saturating_add(step).min(MAX_VOLUME),
        Gesture::VolumeDown => volume.saturating_sub(step),
        _ => volume,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A player was started and has until `deadline` to report audio.
    Transitioning {
        generation: Generation,
        deadline: Instant,
    },
}

/// What the core loop must do after a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Tune { index: usize },
    Volume { volume: u8 },
}

#[derive(Debug)]
pub struct Selector {
    len: usize,
    state: SelectorState,
    volume_step: u8,
    phase: Phase,
}

impl Selector {
    /// `state` is reduced to the catalog first, so a stale saved index is safe.
    pub fn new(len: usize, state: SelectorState, volume_step: u8) -> Self {
        let len = len.max(1);
        Self {
            len,
            state: SelectorState {
                current_index: state.current_index % len,
                volume: state.volume.min(MAX_VOLUME),
            },
            volume_step,
            phase: Phase::Idle,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn apply(&mut self, gesture: Gesture) -> Option<Action> {
        if gesture.changes_station() {
            let index = next_index(gesture, self.state.current_index, self.len);
            self.state.current_index = index;
            return Some(Action::Tune { index });
        }
        let volume = next_volume(gesture, self.state.volume, self.volume_step);
        if volume == self.state.volume {
            return None;
        }
        self.state.volume = volume;
        Some(Action::Volume { volume })
    }

    /// Move on to the next station after giving up on the current one.
    pub fn advance(&mut self) -> usize {
        self.state.current_index = next_index(Gesture::Next, self.state.current_index, self.len);
        self.state.current_index
    }

    pub fn begin_transition(&mut self, generation: Generation, deadline: Instant) {
        self.phase = Phase::Transitioning {
            generation,
            deadline,
        };
    }

    /// Returns true if `generation` is the transition being waited on.
    pub fn confirm(&mut self, generation: Generation) -> bool {
        match self.phase {
            Phase::Transitioning { generation: g, .. } if g == generation => {
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn abandon(&mut self) {
        self.phase = Phase::Idle;
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Idle => None,
            Phase::Transitioning { deadline, .. } => Some(deadline),
        }
    }
}
