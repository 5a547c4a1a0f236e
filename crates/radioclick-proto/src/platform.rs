use std::path::PathBuf;

const APP_DIR: &str = "radioclick";

/// Path of the mpv IPC socket for this daemon instance.  Only one player
/// process exists at a time, so a single per-pid path is enough.
pub fn mpv_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("{}-mpv-{}.sock", APP_DIR, std::process::id()))
}

pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_path().display())
}

pub fn data_dir() -> PathBuf {
    // XDG-style ~/.local/share/radioclick/, matching what the appliance image expects
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join(APP_DIR)
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

pub fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':') {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find mpv binary for playback.
/// Checks beside the current exe first (bundled images), then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    find_beside_exe(&["mpv"]).or_else(|| find_on_path(&["mpv"]))
}

/// Find the espeak binary used for announcements.  `espeak-ng` ships an
/// `espeak` compatible CLI on most distributions, so accept either.
pub fn find_espeak_binary() -> Option<PathBuf> {
    find_on_path(&["espeak", "espeak-ng"])
}

/// Find amixer (alsa-utils) for hardware mixer volume.
pub fn find_amixer_binary() -> Option<PathBuf> {
    find_on_path(&["amixer"])
}
