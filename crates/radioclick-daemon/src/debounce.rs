//! Turns raw button/IR codes into gestures.
//!
//! The IR remote has one key per intent, so its codes map straight through.
//! The push button has only presses: a single press means `Next`, two presses
//! inside `window` mean `SkipForward`.  Telling them apart needs a timer; the
//! debouncer only records the deadline and the core loop calls `expire` when
//! it passes.

use std::time::Duration;

use radioclick_proto::protocol::{Gesture, InputCode, RawInputEvent};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    /// Deadline of the single press waiting for a partner.
    pending: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    pub fn feed(&mut self, event: RawInputEvent) -> Option<Gesture> {
        match event.code {
            InputCode::Release => None,
            InputCode::KeyNext => Some(Gesture::Next),
            InputCode::KeyPrevious => Some(Gesture::Previous),
            InputCode::KeyVolumeUp => Some(Gesture::VolumeUp),
            InputCode::KeyVolumeDown => Some(Gesture::VolumeDown),
            InputCode::Press => self.press(event.at),
        }
    }

    fn press(&mut self, at: Instant) -> Option<Gesture> {
        match self.pending.take() {
            Some(deadline) if at < deadline => {
                trace!("debounce: second press inside window");
                Some(Gesture::SkipForward)
            }
            Some(_) => {
                // The earlier window ran out before the loop got to it.
                self.pending = Some(at + self.window);
                Some(Gesture::Next)
            }
            None => {
                self.pending = Some(at + self.window);
                None
            }
        }
    }

    /// Resolve a pending single press once its window has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Gesture> {
        match self.pending {
            Some(deadline) if now >= deadline => {
                self.pending = None;
                Some(Gesture::Next)
            }
            _ => None,
        }
    }
}
