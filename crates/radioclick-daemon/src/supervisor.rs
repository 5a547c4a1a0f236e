/// Playback supervisor: owns the one live audio-output process.
///
/// ```text
///   Supervisor::start()
///         │
///         ├── AudioOutput::launch()   → PlayerProcess + PlayerSignal receiver
///         └── monitor task            ← PlayerSignal (Streaming / Buffering / Exited)
///                                        └── CoreEvent::Playback { generation, .. } → core loop
/// ```
///
/// Every started process gets a fresh generation.  The core loop holds the
/// matching `PlaybackHandle`; `stop` consumes it, and `start` is refused
/// while one is outstanding, so two players can never overlap.  Reports
/// from a superseded generation are dropped by `observe`.
use std::time::Duration;

use async_trait::async_trait;
use radioclick_proto::protocol::{PlaybackHealth, Station};
use radioclick_proto::RadioError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;
use crate::mixer::Mixer;

pub type Generation = u64;

/// Raw liveness signal from a player process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerSignal {
    /// Audio is flowing.
    Streaming,
    /// Connected but waiting for data.
    Buffering,
    /// The process is gone.
    Exited(String),
}

/// What the monitor reports to the core loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { generation: Generation },
    Stalled { generation: Generation, reason: String },
    Exited { generation: Generation, reason: String },
}

impl PlaybackEvent {
    pub fn generation(&self) -> Generation {
        match self {
            PlaybackEvent::Started { generation }
            | PlaybackEvent::Stalled { generation, .. }
            | PlaybackEvent::Exited { generation, .. } => *generation,
        }
    }
}

/// Launches player processes.  The mpv implementation lives in `mpv.rs`.
#[async_trait]
pub trait AudioOutput: Send {
    async fn launch(
        &mut self,
        url: &str,
        volume: u8,
    ) -> anyhow::Result<(Box<dyn PlayerProcess>, mpsc::Receiver<PlayerSignal>)>;
}

/// One running player.
#[async_trait]
pub trait PlayerProcess: Send {
    async fn set_volume(&mut self, volume: u8) -> anyhow::Result<()>;
    /// Stop the process and wait until it has exited.
    async fn terminate(&mut self) -> anyhow::Result<()>;
    fn is_running(&mut self) -> bool;
}

/// Proof that a player was started.  Not `Clone`: handing it back to
/// `Supervisor::stop` is the only way to release the audio output.
#[derive(Debug)]
pub struct PlaybackHandle {
    generation: Generation,
    station_index: usize,
}

impl PlaybackHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn station_index(&self) -> usize {
        self.station_index
    }
}

struct ActivePlayer {
    generation: Generation,
    station: Station,
    process: Box<dyn PlayerProcess>,
    monitor: tokio::task::JoinHandle<()>,
    health: PlaybackHealth,
}

pub struct Supervisor {
    output: Box<dyn AudioOutput>,
    mixer: Mixer,
    volume: u8,
    /// Buffering longer than this after audio started counts as a stall.
    stall_timeout: Duration,
    events_tx: mpsc::Sender<CoreEvent>,
    next_generation: Generation,
    active: Option<ActivePlayer>,
}

impl Supervisor {
    pub fn new(
        output: Box<dyn AudioOutput>,
        mixer: Mixer,
        volume: u8,
        stall_timeout: Duration,
        events_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        Self {
            output,
            mixer,
            volume,
            stall_timeout,
            events_tx,
            next_generation: 1,
            active: None,
        }
    }

    /// Launch a player for `station`.  Fails with `StreamUnavailable` if the
    /// process cannot be spawned or connected to before `deadline`, or if the
    /// previous handle was never returned through `stop`.
    ///
    /// `deadline` is the same instant the caller waits on for the first audio,
    /// so launching and confirmation share one startup budget.
    pub async fn start(
        &mut self,
        station_index: usize,
        station: &Station,
        deadline: Instant,
    ) -> Result<PlaybackHandle, RadioError> {
        let unavailable = |reason: String| RadioError::StreamUnavailable {
            station: station.name.clone(),
            reason,
        };

        if let Some(active) = &self.active {
            return Err(unavailable(format!(
                "player generation {} is still active",
                active.generation
            )));
        }

        if let Mixer::Alsa { .. } = self.mixer {
            if let Err(e) = self.mixer.apply(self.volume).await {
                warn!("supervisor: mixer volume not applied: {}", e);
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let player_volume = self.mixer.player_volume(self.volume);
        let launched =
            tokio::time::timeout_at(deadline, self.output.launch(&station.url, player_volume))
                .await;
        let (process, signals) = match launched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(unavailable(e.to_string())),
            Err(_) => return Err(unavailable("player did not come up in time".to_string())),
        };

        info!(
            "supervisor: generation {} playing '{}' ({})",
            generation, station.name, station.url
        );
        let monitor = tokio::spawn(monitor_player(
            generation,
            signals,
            self.events_tx.clone(),
            self.stall_timeout,
        ));

        self.active = Some(ActivePlayer {
            generation,
            station: station.clone(),
            process,
            monitor,
            health: PlaybackHealth::Healthy,
        });

        Ok(PlaybackHandle {
            generation,
            station_index,
        })
    }

    /// Terminate the player behind `handle` and wait for it to exit.
    pub async fn stop(&mut self, handle: PlaybackHandle) {
        match self.active.take() {
            Some(mut active) if active.generation == handle.generation => {
                active.monitor.abort();
                if let Err(e) = active.process.terminate().await {
                    warn!(
                        "supervisor: terminating generation {} ('{}'): {}",
                        active.generation, active.station.name, e
                    );
                }
                debug!("supervisor: generation {} stopped", active.generation);
            }
            Some(other) => {
                warn!(
                    "supervisor: stop for generation {} but generation {} is active",
                    handle.generation, other.generation
                );
                self.active = Some(other);
            }
            None => {}
        }
    }

    pub async fn set_volume(&mut self, volume: u8) -> anyhow::Result<()> {
        self.volume = volume;
        match self.mixer {
            Mixer::Player => {
                if let Some(active) = self.active.as_mut() {
                    active.process.set_volume(volume).await?;
                }
                Ok(())
            }
            Mixer::Alsa { .. } => self.mixer.apply(volume).await,
        }
    }

    pub fn health(&mut self) -> PlaybackHealth {
        match self.active.as_mut() {
            None => PlaybackHealth::Terminated,
            Some(active) => {
                if !active.process.is_running() {
                    active.health = PlaybackHealth::Terminated;
                }
                active.health
            }
        }
    }

    /// Fold a monitor report into the tracked health.  Returns false for
    /// reports about a generation that is no longer current.
    pub fn observe(&mut self, event: &PlaybackEvent) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.generation != event.generation() {
            return false;
        }
        active.health = match event {
            PlaybackEvent::Started { .. } => PlaybackHealth::Healthy,
            PlaybackEvent::Stalled { .. } => PlaybackHealth::Stalled,
            PlaybackEvent::Exited { .. } => PlaybackHealth::Terminated,
        };
        true
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Translate raw player signals into playback events for one generation.
async fn monitor_player(
    generation: Generation,
    mut signals: mpsc::Receiver<PlayerSignal>,
    events_tx: mpsc::Sender<CoreEvent>,
    stall_timeout: Duration,
) {
    let mut started = false;
    let mut stall_deadline: Option<Instant> = None;

    loop {
        let event = tokio::select! {
            signal = signals.recv() => match signal {
                Some(PlayerSignal::Streaming) => {
                    stall_deadline = None;
                    if started {
                        continue;
                    }
                    started = true;
                    PlaybackEvent::Started { generation }
                }
                Some(PlayerSignal::Buffering) => {
                    if started && stall_deadline.is_none() {
                        stall_deadline = Some(Instant::now() + stall_timeout);
                    }
                    continue;
                }
                Some(PlayerSignal::Exited(reason)) => PlaybackEvent::Exited { generation, reason },
                None => PlaybackEvent::Exited {
                    generation,
                    reason: "player signal channel closed".to_string(),
                },
            },
            _ = sleep_until_opt(stall_deadline) => {
                stall_deadline = None;
                PlaybackEvent::Stalled {
                    generation,
                    reason: format!("no audio for {:?}", stall_timeout),
                }
            }
        };

        let last = matches!(event, PlaybackEvent::Exited { .. });
        if events_tx.send(CoreEvent::Playback(event)).await.is_err() || last {
            break;
        }
    }
}
