//! Hardware input tasks.
//!
//! One task per source, each feeding `CoreEvent::Input` into the core
//! channel.  A source that cannot be opened (or that disappears) is retried
//! every few seconds until the cancellation token fires, so unplugging the IR
//! receiver does not take the button down with it.
//!
//! Linux only: the button is read through the GPIO character device
//! (`gpio-cdev`), the remote through evdev.  The line is not biased by us;
//! the button is expected to pull the pin low against an external or
//! firmware pull-up (`gpio=27=ip,pu` in `config.txt`), so a falling edge is a
//! press.

#[cfg(target_os = "linux")]
mod button;
#[cfg(target_os = "linux")]
mod ir;

use std::future::Future;
use std::time::Duration;

use radioclick_proto::protocol::InputCode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
use radioclick_proto::config::InputConfig;
#[cfg(target_os = "linux")]
use tokio::sync::mpsc;

#[cfg(target_os = "linux")]
use crate::core::CoreEvent;

const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// Drops contact bounce from a mechanical button.
///
/// A press within `bounce` of the last accepted edge is chatter from that
/// edge and is discarded.  Releases always pass; the debouncer ignores them
/// but they restart the bounce window.
#[derive(Debug)]
pub struct BounceFilter {
    bounce: Duration,
    last_edge: Option<Instant>,
}

impl BounceFilter {
    pub fn new(bounce: Duration) -> Self {
        Self {
            bounce,
            last_edge: None,
        }
    }

    pub fn accept(&mut self, code: InputCode, at: Instant) -> bool {
        let chatter = code == InputCode::Press
            && self
                .last_edge
                .is_some_and(|last| at.saturating_duration_since(last) < self.bounce);
        if chatter {
            return false;
        }
        self.last_edge = Some(at);
        true
    }
}

/// Keep a source open until `cancel` fires, reopening it after failures.
async fn keep_open<F, Fut>(name: &'static str, cancel: CancellationToken, mut open: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut failures = 0u32;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = open() => result,
        };
        match result {
            Ok(()) => {
                debug!("{}: core channel closed", name);
                break;
            }
            // Warn once; a missing device would otherwise log every few seconds.
            Err(e) if failures == 0 => warn!("{}: {}; retrying every {:?}", name, e, REOPEN_DELAY),
            Err(e) => debug!("{}: {}", name, e),
        }
        failures = failures.saturating_add(1);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(REOPEN_DELAY) => {}
        }
    }
    info!("{}: stopped", name);
}

#[cfg(target_os = "linux")]
pub fn spawn_sources(
    config: &InputConfig,
    tx: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = Vec::new();

    let chip = config.gpio_chip.clone();
    let pin = config.button_pin;
    let bounce = config.bounce_time();
    let button_tx = tx.clone();
    tasks.push(tokio::spawn(keep_open("button", cancel.clone(), move || {
        button::run(chip.clone(), pin, bounce, button_tx.clone())
    })));

    let device_name = config.ir_device_name.trim().to_string();
    if device_name.is_empty() {
        info!("ir: no device configured");
    } else {
        tasks.push(tokio::spawn(keep_open("ir", cancel, move || {
            ir::run(device_name.clone(), tx.clone())
        })));
    }

    tasks
}

#[cfg(not(target_os = "linux"))]
pub fn spawn_sources(
    _config: &radioclick_proto::config::InputConfig,
    _tx: tokio::sync::mpsc::Sender<crate::core::CoreEvent>,
    _cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    warn!("input: GPIO and IR input need Linux; running without controls");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_chatter_is_dropped() {
        let t0 = Instant::now();
        let mut f = BounceFilter::new(Duration::from_millis(100));
        let ms = |n| t0 + Duration::from_millis(n);

        assert!(f.accept(InputCode::Press, ms(0)));
        assert!(f.accept(InputCode::Release, ms(3)));
        assert!(!f.accept(InputCode::Press, ms(5)));
        assert!(f.accept(InputCode::Release, ms(120)));
        // Chatter on release.
        assert!(!f.accept(InputCode::Press, ms(125)));
        assert!(f.accept(InputCode::Press, ms(300)));
    }

    #[test]
    fn test_quick_double_press_survives() {
        let t0 = Instant::now();
        let mut f = BounceFilter::new(Duration::from_millis(100));
        let ms = |n| t0 + Duration::from_millis(n);

        assert!(f.accept(InputCode::Press, ms(0)));
        assert!(f.accept(InputCode::Release, ms(110)));
        assert!(f.accept(InputCode::Press, ms(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_open_retries_until_cancelled() {
        let cancel = CancellationToken::new();
        let opens = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = opens.clone();
        let task = tokio::spawn(keep_open("test", cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("no such device"))
            }
        }));

        tokio::time::sleep(REOPEN_DELAY * 2 + Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
