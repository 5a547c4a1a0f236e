//! Coalescing writer for the saved station/volume.
//!
//! The core loop hands every new `SelectorState` to `submit`, which only
//! replaces the value in a `watch` channel.  One background task waits for a
//! change, lets `debounce` pass so button mashing collapses into one write,
//! then writes whatever is newest.  At most one write is in flight.

use std::path::PathBuf;
use std::time::Duration;

use radioclick_proto::protocol::SelectorState;
use radioclick_proto::state::{save_persistent, PersistentState};
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct StateWriter {
    tx: watch::Sender<Option<SelectorState>>,
    task: tokio::task::JoinHandle<()>,
}

impl StateWriter {
    /// `written` is the state already on disk, if any; submitting it again
    /// does not cause a write.
    pub fn spawn(path: PathBuf, debounce: Duration, written: Option<SelectorState>) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(write_loop(path, debounce, rx, written));
        Self { tx, task }
    }

    pub fn submit(&self, state: SelectorState) {
        self.tx.send_replace(Some(state));
    }

    /// Write any pending state and stop the writer.
    pub async fn flush(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("state writer: task failed: {}", e);
        }
    }
}

async fn write_loop(
    path: PathBuf,
    debounce: Duration,
    mut rx: watch::Receiver<Option<SelectorState>>,
    mut written: Option<SelectorState>,
) {
    loop {
        let mut closed = rx.changed().await.is_err();
        if !closed {
            // Let the burst settle.  Closing the channel (flush) cuts it short.
            let settle = tokio::time::sleep(debounce);
            tokio::pin!(settle);
            loop {
                tokio::select! {
                    _ = &mut settle => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            closed = true;
                            break;
                        }
                    }
                }
            }
        }
        let latest = *rx.borrow_and_update();

        if let Some(state) = latest {
            if written != Some(state) {
                match save_persistent(&path, &PersistentState::from_selector(&state)).await {
                    Ok(()) => {
                        debug!(
                            "state writer: saved index={} volume={}",
                            state.current_index, state.volume
                        );
                        written = Some(state);
                    }
                    // The next successful write supersedes this one.
                    Err(e) => warn!("state writer: {}", e),
                }
            }
        }

        if closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radioclick_proto::state::load_persistent;

    fn state(index: usize, volume: u8) -> SelectorState {
        SelectorState {
            current_index: index,
            volume,
        }
    }

    #[tokio::test]
    async fn test_burst_collapses_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = StateWriter::spawn(path.clone(), Duration::from_millis(50), None);

        for i in 0..20 {
            writer.submit(state(i, 80));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let saved = load_persistent(&path).unwrap();
        assert_eq!(saved.last_index, 19);
        writer.flush().await;
    }

    #[tokio::test]
    async fn test_flush_writes_pending_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = StateWriter::spawn(path.clone(), Duration::from_secs(60), None);

        writer.submit(state(4, 35));
        writer.flush().await;

        let saved = load_persistent(&path).unwrap();
        assert_eq!((saved.last_index, saved.volume), (4, 35));
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = StateWriter::spawn(path.clone(), Duration::from_millis(10), Some(state(2, 50)));

        writer.submit(state(2, 50));
        writer.flush().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        let writer = StateWriter::spawn(path.clone(), Duration::from_millis(10), None);

        writer.submit(state(1, 10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.submit(state(2, 10));
        writer.flush().await;
        assert!(path.is_dir());
    }
}
