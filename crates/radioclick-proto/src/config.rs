use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

pub const DEFAULT_PLAYLIST_URL: &str =
    "https://raw.githubusercontent.com/theaetet/radioclick/refs/heads/main/all_radio.m3u";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Station list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    /// Local m3u/TOML file or http(s) URL.  Blank means the built-in remote list.
    #[serde(default)]
    pub playlist_path: String,
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
    /// How many times the remote list is fetched before giving up.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// evdev device name of the IR receiver (see `/proc/bus/input/devices`).
    #[serde(default = "default_ir_device_name")]
    pub ir_device_name: String,
    /// BCM line offset of the push button.
    #[serde(default = "default_button_pin")]
    pub button_pin: u32,
    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: PathBuf,
    /// Contact bounce filter for the button.
    #[serde(default = "default_bounce_ms")]
    pub bounce_ms: u64,
    /// Window in which a second press turns Next into SkipForward.
    #[serde(default = "default_double_click_ms")]
    pub double_click_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Initial volume (percent) when no saved state exists.
    #[serde(default = "default_volume")]
    pub volume: u8,
    /// Initial station when no saved state exists.
    #[serde(default)]
    pub last_index: usize,
    #[serde(default = "default_volume_step")]
    pub volume_step: u8,
    /// ALSA simple mixer control (e.g. "Master", "PCM").  Blank uses mpv's
    /// own volume property.
    #[serde(default)]
    pub mixer_control: String,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Pause before starting over when every station failed.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    #[serde(default = "default_announce_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// tracing filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            playlist_path: String::new(),
            remote_url: default_remote_url(),
            fetch_attempts: default_fetch_attempts(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            ir_device_name: default_ir_device_name(),
            button_pin: default_button_pin(),
            gpio_chip: default_gpio_chip(),
            bounce_ms: default_bounce_ms(),
            double_click_ms: default_double_click_ms(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            last_index: 0,
            volume_step: default_volume_step(),
            mixer_control: String::new(),
            startup_timeout_ms: default_startup_timeout_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            enabled: default_announce_enabled(),
            tts_voice: default_tts_voice(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            log_level: default_log_level(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

fn default_remote_url() -> String {
    DEFAULT_PLAYLIST_URL.to_string()
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_ir_device_name() -> String {
    "gpio_ir_recv".to_string()
}

fn default_button_pin() -> u32 {
    27
}

fn default_gpio_chip() -> PathBuf {
    PathBuf::from("/dev/gpiochip0")
}

fn default_bounce_ms() -> u64 {
    100
}

fn default_double_click_ms() -> u64 {
    400
}

fn default_volume() -> u8 {
    80
}

fn default_volume_step() -> u8 {
    5
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_stall_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_idle_backoff_ms() -> u64 {
    30_000
}

fn default_announce_enabled() -> bool {
    true
}

fn default_tts_voice() -> String {
    "en+f1".to_string()
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_persist_debounce_ms() -> u64 {
    500
}

impl InputConfig {
    pub fn double_click_window(&self) -> Duration {
        Duration::from_millis(self.double_click_ms)
    }

    pub fn bounce_time(&self) -> Duration {
        Duration::from_millis(self.bounce_ms)
    }
}

impl PlaybackConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

impl DaemonConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl Config {
    /// Load the config at `path`, writing defaults when the file is absent.
    ///
    /// Keys missing from an existing file are filled in from the defaults
    /// and the file is rewritten, so upgrades surface new options to the user.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let mut table: toml::Table = toml::from_str(&content)?;
        let toml::Value::Table(defaults) = toml::Value::try_from(Self::default())? else {
            anyhow::bail!("default config did not serialize to a table");
        };
        let added = fill_missing(&mut table, &defaults);

        let config: Self = toml::Value::Table(table).try_into()?;
        if added > 0 {
            tracing::info!("config: added {} missing key(s) to {}", added, path.display());
            config.save_to(path)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Directory that relative playlist paths are resolved against.
    pub fn base_dir(config_path: &Path) -> PathBuf {
        config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(platform::config_dir)
    }
}

/// Copy keys present in `defaults` but absent from `table`, recursing into
/// sub-tables.  Returns the number of keys inserted.
fn fill_missing(table: &mut toml::Table, defaults: &toml::Table) -> usize {
    let mut added = 0;
    for (key, default) in defaults {
        match (table.get_mut(key), default) {
            (None, _) => {
                table.insert(key.clone(), default.clone());
                added += 1;
            }
            (Some(toml::Value::Table(sub)), toml::Value::Table(default_sub)) => {
                added += fill_missing(sub, default_sub);
            }
            _ => {}
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.playlist.playlist_path.is_empty());
        assert!(config.playlist.remote_url.starts_with("https://"));
        assert_eq!(config.input.ir_device_name, "gpio_ir_recv");
        assert_eq!(config.input.button_pin, 27);
        assert_eq!(config.playback.volume, 80);
        assert_eq!(config.playback.last_index, 0);
        assert_eq!(config.announce.tts_voice, "en+f1");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.input.double_click_window(), Duration::from_millis(400));
        assert!(config.daemon.state_file.ends_with("radioclick/state.json"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.playback.volume, 80);
    }

    #[test]
    fn test_load_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[playback]\nvolume = 42\n\n[input]\nbutton_pin = 17\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.playback.volume, 42);
        assert_eq!(config.input.button_pin, 17);
        assert_eq!(config.input.double_click_ms, 400);

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("tts_voice"));
        assert!(rewritten.contains("volume = 42"));
    }

    #[test]
    fn test_base_dir_is_config_parent() {
        let base = Config::base_dir(Path::new("/etc/radioclick/config.toml"));
        assert_eq!(base, PathBuf::from("/etc/radioclick"));
    }
}
