//! IR remote through the kernel's evdev interface (`gpio_ir_recv` with an
//! rc keymap loaded).

use evdev::{InputEventKind, Key};
use radioclick_proto::protocol::{InputCode, InputSource, RawInputEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::CoreEvent;

/// evdev key values.
const KEY_DOWN: i32 = 1;

fn key_code(key: Key) -> Option<InputCode> {
    match key {
        Key::KEY_NEXT => Some(InputCode::KeyNext),
        Key::KEY_PREVIOUS => Some(InputCode::KeyPrevious),
        Key::KEY_VOLUMEUP => Some(InputCode::KeyVolumeUp),
        Key::KEY_VOLUMEDOWN => Some(InputCode::KeyVolumeDown),
        _ => None,
    }
}

pub async fn run(device_name: String, tx: mpsc::Sender<CoreEvent>) -> anyhow::Result<()> {
    let (path, device) = evdev::enumerate()
        .find(|(_, d)| d.name() == Some(device_name.as_str()))
        .ok_or_else(|| anyhow::anyhow!("no input device named '{}'", device_name))?;
    info!("ir: listening on '{}' ({})", device_name, path.display());

    let mut events = device.into_event_stream()?;
    loop {
        let event = events.next_event().await?;
        let InputEventKind::Key(key) = event.kind() else {
            continue;
        };
        // Releases and autorepeat are ignored.
        if event.value() != KEY_DOWN {
            continue;
        }
        let Some(code) = key_code(key) else {
            debug!("ir: unmapped key {:?}", key);
            continue;
        };
        let raw = RawInputEvent::now(InputSource::Ir, code);
        if tx.send(CoreEvent::Input(raw)).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_keys_are_mapped() {
        assert_eq!(key_code(Key::KEY_NEXT), Some(InputCode::KeyNext));
        assert_eq!(key_code(Key::KEY_PREVIOUS), Some(InputCode::KeyPrevious));
        assert_eq!(key_code(Key::KEY_VOLUMEUP), Some(InputCode::KeyVolumeUp));
        assert_eq!(key_code(Key::KEY_VOLUMEDOWN), Some(InputCode::KeyVolumeDown));
        assert_eq!(key_code(Key::KEY_A), None);
    }
}
