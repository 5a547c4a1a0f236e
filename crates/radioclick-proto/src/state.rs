use crate::error::RadioError;
use crate::protocol::{SelectorState, Station, MAX_VOLUME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk form of [`SelectorState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub last_index: usize,
    pub volume: u8,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl PersistentState {
    pub fn from_selector(state: &SelectorState) -> Self {
        Self {
            last_index: state.current_index,
            volume: state.volume,
            saved_at: Some(Utc::now()),
        }
    }

    /// Map the saved record onto a catalog of `catalog_len` stations.
    /// The catalog may have shrunk since the record was written.
    pub fn restore(&self, catalog_len: usize) -> SelectorState {
        SelectorState {
            current_index: self.last_index % catalog_len.max(1),
            volume: self.volume.min(MAX_VOLUME),
        }
    }
}

/// Read the saved record.  Absence and corruption both yield `None`.
pub fn load_persistent(state_file: &Path) -> Option<PersistentState> {
    let content = std::fs::read_to_string(state_file).ok()?;
    match serde_json::from_str::<PersistentState>(&content) {
        Ok(persistent) => Some(persistent),
        Err(e) => {
            tracing::warn!(
                "state: ignoring unreadable {}: {}",
                state_file.display(),
                e
            );
            None
        }
    }
}

/// Starting state: the saved record if usable, else the configured defaults.
pub fn initial_state(
    state_file: &Path,
    catalog_len: usize,
    default_index: usize,
    default_volume: u8,
) -> SelectorState {
    let persistent = load_persistent(state_file).unwrap_or(PersistentState {
        last_index: default_index,
        volume: default_volume,
        saved_at: None,
    });
    persistent.restore(catalog_len)
}

/// Write the record next to its final path and rename it into place so a
/// power cut never leaves a truncated file behind.
pub async fn save_persistent(
    state_file: &Path,
    persistent: &PersistentState,
) -> Result<(), RadioError> {
    let fail = |e: &dyn std::fmt::Display| {
        RadioError::PersistenceFailure(format!("{}: {}", state_file.display(), e))
    };

    if let Some(parent) = state_file.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| fail(&e))?;
    }

    let json = serde_json::to_string_pretty(persistent).map_err(|e| fail(&e))?;
    let tmp = state_file.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(|e| fail(&e))?;
    tokio::fs::rename(&tmp, state_file)
        .await
        .map_err(|e| fail(&e))?;
    Ok(())
}

// ── playlist parsing ──────────────────────────────────────────────────────────

/// Decode ISO-8859-1 bytes.  Every byte maps to the code point of the same
/// value, so this never fails.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// True when the first non-blank line is the `#EXTM3U` header.
pub fn has_m3u_header(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .is_some_and(|l| l.starts_with("#EXTM3U"))
}

/// Parse an m3u playlist.  Stream lines are the ones starting with `http`;
/// a preceding `#EXTINF:<duration>,<title>` names the stream, otherwise the
/// URL doubles as the name.
pub fn parse_m3u_from_str(content: &str) -> Vec<Station> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                let title = rest[comma_idx + 1..].trim();
                if !title.is_empty() {
                    pending_name = Some(title.to_string());
                }
            }
            continue;
        }

        if !line.starts_with("http") {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());
        stations.push(Station { name, url });
    }

    stations
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Matches the TOML `[[station]]` table.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    name: String,
    url: String,
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| Station {
            name: s.name,
            url: s.url,
        })
        .collect();
    Ok(stations)
}
