use thiserror::Error;

/// Failure taxonomy of the appliance.
///
/// Only `PlaylistUnavailable` is fatal, and only at startup.  Everything else
/// is recovered inside the control loop and logged.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("no usable station list: {0}")]
    PlaylistUnavailable(String),

    #[error("stream unavailable for '{station}': {reason}")]
    StreamUnavailable { station: String, reason: String },

    #[error("playback stalled on '{station}': {reason}")]
    PlaybackStalled { station: String, reason: String },

    #[error("failed to persist state: {0}")]
    PersistenceFailure(String),

    #[error("announcement failed: {0}")]
    SpeechFailure(String),
}

