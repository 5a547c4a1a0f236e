//! Station catalog loading.
//!
//! Sources, in order:
//!
//! 1. `playlist_path` when it names a readable local playlist (`.toml` with
//!    `[[station]]` tables, or an m3u that starts with `#EXTM3U`);
//! 2. `playlist_path` fetched over HTTP when it is a URL;
//! 3. otherwise, or when the local file is unusable, `remote_url`.
//!
//! An empty or unreachable remote list is `PlaylistUnavailable`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use radioclick_proto::config::PlaylistConfig;
use radioclick_proto::protocol::{Catalog, Station};
use radioclick_proto::state::{
    decode_latin1, has_m3u_header, parse_m3u_from_str, parse_stations_from_toml_str,
};
use radioclick_proto::RadioError;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Remote(String),
    Local(PathBuf),
}

fn resolve(playlist_path: &str, remote_url: &str, base_dir: &Path) -> Source {
    let path = playlist_path.trim();
    if path.is_empty() {
        return Source::Remote(remote_url.to_string());
    }
    if path.starts_with("http://") || path.starts_with("https://") {
        return Source::Remote(path.to_string());
    }
    let path = PathBuf::from(path);
    if path.is_absolute() {
        Source::Local(path)
    } else {
        Source::Local(base_dir.join(path))
    }
}

pub async fn load(config: &PlaylistConfig, base_dir: &Path) -> Result<Catalog, RadioError> {
    let attempts = config.fetch_attempts.max(1);
    let stations = match resolve(&config.playlist_path, &config.remote_url, base_dir) {
        Source::Remote(url) => fetch_remote(&url, attempts).await?,
        Source::Local(path) => match load_local(&path) {
            Ok(stations) => {
                info!(
                    "catalog: loaded {} stations from {}",
                    stations.len(),
                    path.display()
                );
                stations
            }
            Err(e) => {
                warn!(
                    "catalog: {} unusable ({}), falling back to {}",
                    path.display(),
                    e,
                    config.remote_url
                );
                fetch_remote(&config.remote_url, attempts).await?
            }
        },
    };
    Catalog::new(stations)
}

/// Read a playlist file.  Fails on an unreadable file, a missing m3u
/// header, or a list without stations.
pub fn load_local(path: &Path) -> anyhow::Result<Vec<Station>> {
    let bytes = std::fs::read(path)?;
    let content = decode_latin1(&bytes);

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let stations = if is_toml {
        parse_stations_from_toml_str(&content)?
    } else {
        if !has_m3u_header(&content) {
            anyhow::bail!("missing #EXTM3U header");
        }
        parse_m3u_from_str(&content)
    };

    if stations.is_empty() {
        anyhow::bail!("no stations in playlist");
    }
    Ok(stations)
}

async fn fetch_remote(url: &str, attempts: u32) -> Result<Vec<Station>, RadioError> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| RadioError::PlaylistUnavailable(e.to_string()))?;

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match fetch_once(&client, url).await {
            Ok(stations) if !stations.is_empty() => {
                info!("catalog: fetched {} stations from {}", stations.len(), url);
                return Ok(stations);
            }
            Ok(_) => {
                // An empty list will not get better by asking again.
                return Err(RadioError::PlaylistUnavailable(format!(
                    "{} lists no stations",
                    url
                )));
            }
            Err(e) => {
                warn!("catalog: fetch {}/{} of {} failed: {}", attempt, attempts, url, e);
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(FETCH_BACKOFF).await;
        }
    }
    Err(RadioError::PlaylistUnavailable(format!(
        "{}: {}",
        url, last_error
    )))
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<Station>> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    Ok(parse_m3u_from_str(&text))
}
