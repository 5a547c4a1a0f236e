use tokio::time::Instant;

use crate::error::RadioError;

/// How far a double press jumps through the catalog.
pub const SKIP_STRIDE: usize = 10;

pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub name: String,
    pub url: String,
}

/// The station list for this session.  Never empty, never mutated after load.
/// A station's identity is its index; names may repeat.
#[derive(Debug, Clone)]
pub struct Catalog {
    stations: Vec<Station>,
}

impl Catalog {
    pub fn new(stations: Vec<Station>) -> Result<Self, RadioError> {
        if stations.is_empty() {
            return Err(RadioError::PlaylistUnavailable(
                "playlist contains no stations".to_string(),
            ));
        }
        Ok(Self { stations })
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// Always false for a constructed catalog.
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Station at `idx` reduced modulo the catalog length.
    pub fn station(&self, idx: usize) -> &Station {
        &self.stations[idx % self.stations.len()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Button,
    Ir,
}

/// Discrete code delivered by a hardware source.  The button only ever
/// produces `Press`/`Release`; the IR receiver produces the named keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCode {
    Press,
    Release,
    KeyNext,
    KeyPrevious,
    KeyVolumeUp,
    KeyVolumeDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInputEvent {
    pub source: InputSource,
    pub code: InputCode,
    pub at: Instant,
}

impl RawInputEvent {
    pub fn new(source: InputSource, code: InputCode, at: Instant) -> Self {
        Self { source, code, at }
    }

    pub fn now(source: InputSource, code: InputCode) -> Self {
        Self::new(source, code, Instant::now())
    }
}

/// A disambiguated user intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Next,
    Previous,
    /// Jump ahead by [`SKIP_STRIDE`] stations.
    SkipForward,
    VolumeUp,
    VolumeDown,
}

impl Gesture {
    pub fn changes_station(&self) -> bool {
        matches!(self, Gesture::Next | Gesture::Previous | Gesture::SkipForward)
    }
}

/// The only state that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorState {
    pub current_index: usize,
    pub volume: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Preempts a normal announcement that is being spoken.
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementRequest {
    pub text: String,
    pub priority: Priority,
}

impl AnnouncementRequest {
    pub fn now_playing(station: &Station) -> Self {
        Self {
            text: format!("Now playing: {}", station.name),
            priority: Priority::Normal,
        }
    }
}

/// Liveness of the current player process as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackHealth {
    /// Running; includes the short window before the stream confirms.
    Healthy,
    /// Running but not producing audio for longer than the stall timeout.
    Stalled,
    /// No process, or the process exited.
    #[default]
    Terminated,
}
