/// Announcer: speaks station names one at a time.
///
/// Requests go through an unbounded channel into a single task that holds at
/// most one pending request:
///
/// - a `Normal` request replaces a pending `Normal` one (only the newest
///   station name matters);
/// - a pending `Interrupt` is never displaced: a later `Normal` is dropped
///   quietly, a later `Interrupt` is dropped with a warning;
/// - an `Interrupt` arriving while a `Normal` is being spoken cancels it.
///
/// Speech is mixed over the running stream; the stream is not paused.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use radioclick_proto::config::AnnounceConfig;
use radioclick_proto::protocol::{AnnouncementRequest, Priority};
use radioclick_proto::RadioError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Text-to-speech backend.  Dropping the returned future must stop speech.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), RadioError>;
}

pub struct Espeak {
    binary: PathBuf,
    voice: String,
}

#[async_trait]
impl SpeechSynth for Espeak {
    async fn speak(&self, text: &str) -> Result<(), RadioError> {
        let status = tokio::process::Command::new(&self.binary)
            .arg(format!("-v{}", self.voice))
            .arg(text)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| RadioError::SpeechFailure(e.to_string()))?;
        if !status.success() {
            return Err(RadioError::SpeechFailure(format!("espeak exited: {}", status)));
        }
        Ok(())
    }
}

/// Used when speech is disabled or espeak is missing.
pub struct Silent;

#[async_trait]
impl SpeechSynth for Silent {
    async fn speak(&self, text: &str) -> Result<(), RadioError> {
        debug!("announcer: (silent) {}", text);
        Ok(())
    }
}

pub fn synth_from_config(config: &AnnounceConfig) -> Arc<dyn SpeechSynth> {
    if !config.enabled {
        info!("TTS disabled in config");
        return Arc::new(Silent);
    }
    match radioclick_proto::platform::find_espeak_binary() {
        Some(binary) => {
            info!(
                "TTS enabled via {} with voice '{}'",
                binary.display(),
                config.tts_voice
            );
            Arc::new(Espeak {
                binary,
                voice: config.tts_voice.clone(),
            })
        }
        None => {
            info!("TTS disabled: 'espeak' not found");
            Arc::new(Silent)
        }
    }
}

#[derive(Clone)]
pub struct Announcer {
    tx: mpsc::UnboundedSender<AnnouncementRequest>,
}

impl Announcer {
    pub fn spawn(synth: Arc<dyn SpeechSynth>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, synth));
        (Self { tx }, task)
    }

    pub fn announce(&self, text: impl Into<String>, priority: Priority) {
        self.submit(AnnouncementRequest {
            text: text.into(),
            priority,
        });
    }

    pub fn submit(&self, request: AnnouncementRequest) {
        if self.tx.send(request).is_err() {
            warn!("announcer: task gone, dropping announcement");
        }
    }
}

/// Put `incoming` into the single pending slot.
fn into_slot(
    pending: Option<AnnouncementRequest>,
    incoming: AnnouncementRequest,
) -> AnnouncementRequest {
    match pending {
        Some(held) if held.priority == Priority::Interrupt => {
            if incoming.priority == Priority::Interrupt {
                warn!(
                    "announcer: dropping interrupt '{}', '{}' is still pending",
                    incoming.text, held.text
                );
            } else {
                debug!("announcer: dropping '{}' behind interrupt", incoming.text);
            }
            held
        }
        Some(held) => {
            debug!("announcer: '{}' superseded by '{}'", held.text, incoming.text);
            incoming
        }
        None => incoming,
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<AnnouncementRequest>, synth: Arc<dyn SpeechSynth>) {
    let mut pending: Option<AnnouncementRequest> = None;
    let mut closed = false;

    loop {
        let mut current = match pending.take() {
            Some(req) => req,
            None if closed => break,
            None => match rx.recv().await {
                Some(req) => req,
                None => break,
            },
        };
        // Anything queued behind it competes for the same slot.
        while let Ok(next) = rx.try_recv() {
            current = into_slot(Some(current), next);
        }

        debug!("announcer: speaking '{}'", current.text);
        let speech = synth.speak(&current.text);
        tokio::pin!(speech);

        loop {
            tokio::select! {
                result = &mut speech => {
                    if let Err(e) = result {
                        warn!("announcer: {}", e);
                    }
                    break;
                }
                incoming = rx.recv(), if !closed => match incoming {
                    Some(req)
                        if req.priority == Priority::Interrupt
                            && current.priority == Priority::Normal =>
                    {
                        info!("announcer: '{}' interrupted by '{}'", current.text, req.text);
                        pending = Some(req);
                        break;
                    }
                    Some(req) => pending = Some(into_slot(pending.take(), req)),
                    None => closed = true,
                },
            }
        }
    }
    debug!("announcer: task exiting");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Spoken {
        Finished(String),
        Cancelled(String),
    }

    #[derive(Default)]
    struct Log {
        entries: Vec<Spoken>,
        speaking: usize,
        max_speaking: usize,
    }

    /// Records what was said; each utterance takes `duration`.
    #[derive(Clone, Default)]
    pub struct RecordingSynth {
        duration: Duration,
        log: Arc<Mutex<Log>>,
    }

    impl RecordingSynth {
        pub fn with_duration(duration: Duration) -> Self {
            Self {
                duration,
                log: Arc::default(),
            }
        }

        pub fn entries(&self) -> Vec<Spoken> {
            self.log.lock().unwrap().entries.clone()
        }

        pub fn finished(&self) -> Vec<String> {
            self.entries()
                .into_iter()
                .filter_map(|s| match s {
                    Spoken::Finished(t) => Some(t),
                    Spoken::Cancelled(_) => None,
                })
                .collect()
        }

        pub fn max_concurrent(&self) -> usize {
            self.log.lock().unwrap().max_speaking
        }
    }

    struct Utterance {
        text: String,
        done: bool,
        log: Arc<Mutex<Log>>,
    }

    impl Drop for Utterance {
        fn drop(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.speaking -= 1;
            let text = std::mem::take(&mut self.text);
            log.entries.push(if self.done {
                Spoken::Finished(text)
            } else {
                Spoken::Cancelled(text)
            });
        }
    }

    #[async_trait]
    impl SpeechSynth for RecordingSynth {
        async fn speak(&self, text: &str) -> Result<(), RadioError> {
            let mut utterance = {
                let mut log = self.log.lock().unwrap();
                log.speaking += 1;
                log.max_speaking = log.max_speaking.max(log.speaking);
                Utterance {
                    text: text.to_string(),
                    done: false,
                    log: Arc::clone(&self.log),
                }
            };
            tokio::time::sleep(self.duration).await;
            utterance.done = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSynth, Spoken};
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_newest_normal_replaces_pending() {
        let synth = RecordingSynth::with_duration(Duration::from_secs(2));
        let (announcer, task) = Announcer::spawn(Arc::new(synth.clone()));

        announcer.announce("Now playing: A", Priority::Normal);
        tokio::time::sleep(Duration::from_millis(100)).await;
        announcer.announce("Now playing: B", Priority::Normal);
        announcer.announce("Now playing: C", Priority::Normal);
        drop(announcer);
        task.await.unwrap();

        assert_eq!(synth.finished(), vec!["Now playing: A", "Now playing: C"]);
        assert_eq!(synth.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_preempts_normal() {
        let synth = RecordingSynth::with_duration(Duration::from_secs(2));
        let (announcer, task) = Announcer::spawn(Arc::new(synth.clone()));

        announcer.announce("Now playing: A", Priority::Normal);
        tokio::time::sleep(Duration::from_millis(500)).await;
        announcer.announce("No stations available", Priority::Interrupt);
        drop(announcer);
        task.await.unwrap();

        assert_eq!(
            synth.entries(),
            vec![
                Spoken::Cancelled("Now playing: A".into()),
                Spoken::Finished("No stations available".into()),
            ]
        );
        assert_eq!(synth.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_does_not_displace_pending_interrupt() {
        let synth = RecordingSynth::with_duration(Duration::from_secs(2));
        let (announcer, task) = Announcer::spawn(Arc::new(synth.clone()));

        announcer.announce("Fatal", Priority::Interrupt);
        tokio::time::sleep(Duration::from_millis(100)).await;
        announcer.announce("Second fatal", Priority::Interrupt);
        announcer.announce("Now playing: B", Priority::Normal);
        drop(announcer);
        task.await.unwrap();

        assert_eq!(synth.finished(), vec!["Fatal", "Second fatal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_interrupt_is_kept_over_later_interrupt() {
        let synth = RecordingSynth::with_duration(Duration::from_secs(2));
        let (announcer, task) = Announcer::spawn(Arc::new(synth.clone()));

        announcer.announce("Fatal", Priority::Interrupt);
        tokio::time::sleep(Duration::from_millis(100)).await;
        announcer.announce("Second fatal", Priority::Interrupt);
        announcer.announce("Third fatal", Priority::Interrupt);
        drop(announcer);
        task.await.unwrap();

        assert_eq!(synth.finished(), vec!["Fatal", "Second fatal"]);
    }

    #[test]
    fn test_into_slot_rules() {
        let normal = |t: &str| AnnouncementRequest {
            text: t.into(),
            priority: Priority::Normal,
        };
        let interrupt = |t: &str| AnnouncementRequest {
            text: t.into(),
            priority: Priority::Interrupt,
        };
        assert_eq!(into_slot(Some(normal("a")), normal("b")).text, "b");
        assert_eq!(into_slot(Some(interrupt("x")), normal("b")).text, "x");
        assert_eq!(into_slot(Some(normal("a")), interrupt("x")).text, "x");
        assert_eq!(into_slot(Some(interrupt("x")), interrupt("y")).text, "x");
        assert_eq!(into_slot(None, normal("a")).text, "a");
    }

    #[tokio::test]
    async fn test_silent_synth_never_fails() {
        assert!(Silent.speak("anything").await.is_ok());
    }
}
