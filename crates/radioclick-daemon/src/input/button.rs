//! Push button on a GPIO line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use gpio_cdev::{AsyncLineEventHandle, Chip, EventRequestFlags, EventType, LineRequestFlags};
use radioclick_proto::protocol::{InputCode, InputSource, RawInputEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, trace};

use super::BounceFilter;
use crate::core::CoreEvent;

const CONSUMER: &str = "radioclick";

fn edge_code(event_type: EventType) -> InputCode {
    match event_type {
        EventType::FallingEdge => InputCode::Press,
        EventType::RisingEdge => InputCode::Release,
    }
}

/// Forward edges from `pin` until the line fails (error) or the core is gone
/// (`Ok`).
pub async fn run(
    chip_path: PathBuf,
    pin: u32,
    bounce: Duration,
    tx: mpsc::Sender<CoreEvent>,
) -> anyhow::Result<()> {
    let mut chip =
        Chip::new(&chip_path).with_context(|| format!("opening {}", chip_path.display()))?;
    let line = chip
        .get_line(pin)
        .with_context(|| format!("line {} on {}", pin, chip_path.display()))?;
    let handle = line
        .events(
            LineRequestFlags::INPUT,
            EventRequestFlags::BOTH_EDGES,
            CONSUMER,
        )
        .with_context(|| format!("requesting edge events on line {}", pin))?;
    let mut events = AsyncLineEventHandle::new(handle)?;
    info!("button: listening on {} line {}", chip_path.display(), pin);

    let mut filter = BounceFilter::new(bounce);
    while let Some(event) = events.next().await {
        let code = edge_code(event?.event_type());
        let at = Instant::now();
        if !filter.accept(code, at) {
            trace!("button: bounce {:?} dropped", code);
            continue;
        }
        let raw = RawInputEvent::new(InputSource::Button, code, at);
        if tx.send(CoreEvent::Input(raw)).await.is_err() {
            return Ok(());
        }
    }
    anyhow::bail!("edge event stream on line {} ended", pin)
}
