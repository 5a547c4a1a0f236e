//! Where volume changes are applied.

use std::path::PathBuf;

use radioclick_proto::protocol::MAX_VOLUME;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mixer {
    /// The player's own volume property.
    Player,
    /// An ALSA simple mixer control set through `amixer`.  The player then
    /// runs at full volume.
    Alsa { binary: PathBuf, control: String },
}

impl Mixer {
    pub fn from_config(control: &str) -> Self {
        let control = control.trim();
        if control.is_empty() {
            return Mixer::Player;
        }
        match radioclick_proto::platform::find_amixer_binary() {
            Some(binary) => {
                info!("mixer: using amixer control '{}'", control);
                Mixer::Alsa {
                    binary,
                    control: control.to_string(),
                }
            }
            None => {
                warn!(
                    "mixer: amixer not found, ignoring control '{}' and using player volume",
                    control
                );
                Mixer::Player
            }
        }
    }

    /// Volume to launch the player with.
    pub fn player_volume(&self, volume: u8) -> u8 {
        match self {
            Mixer::Player => volume.min(MAX_VOLUME),
            Mixer::Alsa { .. } => MAX_VOLUME,
        }
    }

    /// Apply `volume` to the hardware mixer.  No-op for `Player`.
    pub async fn apply(&self, volume: u8) -> anyhow::Result<()> {
        let Mixer::Alsa { binary, control } = self else {
            return Ok(());
        };
        let status = tokio::process::Command::new(binary)
            .args(["-q", "sset", control.as_str()])
            .arg(format!("{}%", volume.min(MAX_VOLUME)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("amixer sset {} exited: {}", control, status);
        }
        Ok(())
    }
}
