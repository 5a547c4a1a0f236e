/// Coordinator: single-owner event loop for the appliance.
///
/// Input tasks, player monitors, the heartbeat and the signal handler all
/// send `CoreEvent` messages into one channel.  The coordinator owns the
/// debouncer, selector and supervisor exclusively; nothing else touches the
/// current station or volume.
///
/// Timers are loop deadlines rather than tasks:
///
/// - the debouncer's double-press window;
/// - the selector's start confirmation (`startup_timeout`);
/// - the next recovery attempt.
///
/// Recovery: a station that fails to start or stops producing audio is
/// retried after `retry_backoff` (plus up to 20% jitter), up to
/// `max_retries` times, then the selector moves on to the next station.
/// When a whole cycle of the catalog has failed, "No stations available" is
/// announced and the loop waits `idle_backoff` before trying again.
///
/// The counts start over only on a user tune or once a station has played
/// for `stable_after`; a stream that connects and drops again at once keeps
/// counting against its station.
use std::time::Duration;

use radioclick_proto::config::PlaybackConfig;
use radioclick_proto::protocol::{
    AnnouncementRequest, Catalog, Gesture, PlaybackHealth, Priority, RawInputEvent,
    SelectorState,
};
use radioclick_proto::RadioError;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::announcer::Announcer;
use crate::debounce::Debouncer;
use crate::persist::StateWriter;
use crate::selector::{Action, Phase, Selector};
use crate::supervisor::{sleep_until_opt, PlaybackEvent, PlaybackHandle, Supervisor};

pub const NO_STATIONS: &str = "No stations available";

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the coordinator loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A code from the button or the IR receiver.
    Input(RawInputEvent),
    /// Report from a player monitor.
    Playback(PlaybackEvent),
    /// Periodic process liveness check.
    HeartbeatTick,
    Shutdown,
}

// ── CoreSettings ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    pub startup_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub idle_backoff: Duration,
    /// Playback this long counts as recovered.
    pub stable_after: Duration,
}

impl CoreSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            idle_backoff: config.idle_backoff(),
            stable_after: config.stall_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Start the current station again.
    Same,
    /// Give up on the current station and tune the next one.
    Advance,
}

fn jittered(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=0.2);
    base + base.mul_f64(extra)
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct Coordinator {
    catalog: Catalog,
    debouncer: Debouncer,
    selector: Selector,
    supervisor: Supervisor,
    announcer: Announcer,
    writer: StateWriter,
    settings: CoreSettings,
    /// Handle of the running player.  `None` between a stop and a start.
    playing: Option<PlaybackHandle>,
    /// When the current player confirmed audio.
    playing_since: Option<Instant>,
    /// Consecutive failures of the current station.
    attempts: u32,
    /// Stations given up on since playback was last stable.
    failed_stations: usize,
    retry: Option<(Instant, Retry)>,
}

impl Coordinator {
    pub fn new(
        catalog: Catalog,
        debouncer: Debouncer,
        selector: Selector,
        supervisor: Supervisor,
        announcer: Announcer,
        writer: StateWriter,
        settings: CoreSettings,
    ) -> Self {
        Self {
            catalog,
            debouncer,
            selector,
            supervisor,
            announcer,
            writer,
            settings,
            playing: None,
            playing_since: None,
            attempts: 0,
            failed_stations: 0,
            retry: None,
        }
    }

    /// Tune the restored station and run until `Shutdown` or until every
    /// sender is gone.  Returns the final state, which has been written out.
    pub async fn run(mut self, mut events: mpsc::Receiver<CoreEvent>) -> SelectorState {
        let state = self.selector.state();
        info!(
            "core: starting with {} stations at index {} volume {}",
            self.catalog.len(),
            state.current_index,
            state.volume
        );
        self.tune(true).await;

        loop {
            let debounce_at = self.debouncer.deadline();
            let confirm_at = self.selector.deadline();
            let retry_at = self.retry.map(|(at, _)| at);

            tokio::select! {
                // Queued input is classified before the press window is
                // allowed to expire.
                biased;

                evt = events.recv() => match evt {
                    None => {
                        info!("core: event channel closed, shutting down");
                        break;
                    }
                    Some(CoreEvent::Shutdown) => {
                        info!("core: shutdown requested");
                        break;
                    }
                    Some(CoreEvent::Input(raw)) => {
                        debug!("core: input {:?} {:?}", raw.source, raw.code);
                        if let Some(gesture) = self.debouncer.feed(raw) {
                            self.on_gesture(gesture).await;
                        }
                    }
                    Some(CoreEvent::Playback(evt)) => self.on_playback(evt).await,
                    Some(CoreEvent::HeartbeatTick) => self.on_heartbeat().await,
                },

                _ = sleep_until_opt(debounce_at) => {
                    if let Some(gesture) = self.debouncer.expire(Instant::now()) {
                        self.on_gesture(gesture).await;
                    }
                }

                _ = sleep_until_opt(confirm_at) => self.on_start_timeout().await,

                _ = sleep_until_opt(retry_at) => self.on_retry().await,
            }
        }

        self.shutdown().await
    }

    async fn on_gesture(&mut self, gesture: Gesture) {
        info!("core: gesture {:?}", gesture);
        match self.selector.apply(gesture) {
            Some(Action::Tune { index }) => {
                debug!("core: tuning index {}", index);
                self.attempts = 0;
                self.failed_stations = 0;
                self.tune(true).await;
            }
            Some(Action::Volume { volume }) => {
                if let Err(e) = self.supervisor.set_volume(volume).await {
                    warn!("core: volume {}: {}", volume, e);
                }
                self.writer.submit(self.selector.state());
            }
            None => debug!("core: {:?} changes nothing", gesture),
        }
    }

    /// Stop whatever is playing and start the selector's current station.
    async fn tune(&mut self, announce: bool) {
        self.retry = None;
        self.release().await;

        let index = self.selector.state().current_index;
        let station = self.catalog.station(index).clone();
        self.writer.submit(self.selector.state());

        // Launching and the first audio share one deadline.
        let deadline = Instant::now() + self.settings.startup_timeout;
        let started = self.supervisor.start(index, &station, deadline).await;
        if announce {
            self.announcer.submit(AnnouncementRequest::now_playing(&station));
        }
        match started {
            Ok(handle) => {
                self.selector.begin_transition(handle.generation(), deadline);
                self.playing = Some(handle);
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn release(&mut self) {
        self.playing_since = None;
        if let Some(handle) = self.playing.take() {
            debug!("core: stopping index {}", handle.station_index());
            self.supervisor.stop(handle).await;
        }
    }

    async fn on_playback(&mut self, evt: PlaybackEvent) {
        if !self.supervisor.observe(&evt) {
            debug!("core: ignoring stale {:?}", evt);
            return;
        }
        let station = self.current_name();
        match evt {
            PlaybackEvent::Started { generation } => {
                if self.selector.confirm(generation) {
                    info!("core: '{}' is playing", station);
                    self.playing_since = Some(Instant::now());
                }
            }
            PlaybackEvent::Stalled { reason, .. } => {
                self.fail(RadioError::PlaybackStalled { station, reason }).await;
            }
            PlaybackEvent::Exited { reason, .. } => {
                // Exiting before any audio means the stream never opened.
                let err = if matches!(self.selector.phase(), Phase::Transitioning { .. }) {
                    RadioError::StreamUnavailable { station, reason }
                } else {
                    RadioError::PlaybackStalled { station, reason }
                };
                self.fail(err).await;
            }
        }
    }

    async fn on_start_timeout(&mut self) {
        let reason = format!("no audio within {:?}", self.settings.startup_timeout);
        let station = self.current_name();
        self.fail(RadioError::StreamUnavailable { station, reason }).await;
    }

    async fn on_heartbeat(&mut self) {
        if self.playing.is_some() && self.supervisor.health() == PlaybackHealth::Terminated {
            warn!("core: heartbeat: player process died");
            let station = self.current_name();
            let reason = "player process died".to_string();
            self.fail(RadioError::PlaybackStalled { station, reason }).await;
        }
    }

    async fn on_retry(&mut self) {
        let Some((_, retry)) = self.retry.take() else {
            return;
        };
        match retry {
            Retry::Same => self.tune(false).await,
            Retry::Advance => {
                let index = self.selector.advance();
                info!("core: moving on to index {}", index);
                self.tune(true).await;
            }
        }
    }

    /// Apply the recovery policy after `err`.  Never tunes directly; the next
    /// attempt is always a loop deadline.
    async fn fail(&mut self, err: RadioError) {
        warn!("core: {}", err);
        let stable = self
            .playing_since
            .is_some_and(|since| since.elapsed() >= self.settings.stable_after);
        if stable {
            debug!("core: station had recovered, counting failures afresh");
            self.attempts = 0;
            self.failed_stations = 0;
        }
        self.release().await;
        self.selector.abandon();

        self.attempts += 1;
        if self.attempts <= self.settings.max_retries {
            let delay = jittered(self.settings.retry_backoff);
            info!(
                "core: retry {}/{} in {:?}",
                self.attempts, self.settings.max_retries, delay
            );
            self.schedule(delay, Retry::Same);
            return;
        }

        self.attempts = 0;
        self.failed_stations += 1;
        if self.failed_stations >= self.catalog.len() {
            self.failed_stations = 0;
            error!(
                "core: all {} stations failed, waiting {:?}",
                self.catalog.len(),
                self.settings.idle_backoff
            );
            self.announcer.announce(NO_STATIONS, Priority::Interrupt);
            self.schedule(self.settings.idle_backoff, Retry::Same);
        } else {
            self.schedule(Duration::ZERO, Retry::Advance);
        }
    }

    fn schedule(&mut self, delay: Duration, retry: Retry) {
        self.retry = Some((Instant::now() + delay, retry));
    }

    fn current_name(&self) -> String {
        let index = self.selector.state().current_index;
        self.catalog.station(index).name.clone()
    }

    async fn shutdown(mut self) -> SelectorState {
        self.release().await;
        let state = self.selector.state();
        self.writer.submit(state);
        self.writer.flush().await;
        info!(
            "core: stopped at index {} volume {}",
            state.current_index, state.volume
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::testing::{RecordingSynth, Spoken};
    use crate::mixer::Mixer;
    use crate::supervisor::testing::{Call, ScriptedOutput};
    use crate::supervisor::PlayerSignal;
    use radioclick_proto::protocol::{InputCode, InputSource, Station};
    use radioclick_proto::state::{load_persistent, PersistentState};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn url(name: &str) -> String {
        format!("http://{}.example/stream", name.to_lowercase())
    }

    fn settings() -> CoreSettings {
        CoreSettings {
            startup_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff: Duration::from_secs(2),
            idle_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(10),
        }
    }

    struct Harness {
        output: ScriptedOutput,
        synth: RecordingSynth,
        events: mpsc::Sender<CoreEvent>,
        core: tokio::task::JoinHandle<SelectorState>,
        speech: tokio::task::JoinHandle<()>,
        state_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn start(names: &[&str], index: usize, output: ScriptedOutput, settings: CoreSettings) -> Self {
            let stations = names
                .iter()
                .map(|n| Station {
                    name: n.to_string(),
                    url: url(n),
                })
                .collect();
            let catalog = Catalog::new(stations).unwrap();
            let state = SelectorState {
                current_index: index,
                volume: 80,
            };

            let (tx, rx) = mpsc::channel(64);
            let stall = Duration::from_secs(10);
            let supervisor =
                Supervisor::new(Box::new(output.clone()), Mixer::Player, 80, stall, tx.clone());
            let synth = RecordingSynth::with_duration(Duration::from_millis(100));
            let (announcer, speech) = Announcer::spawn(Arc::new(synth.clone()));
            let dir = tempfile::tempdir().unwrap();
            let state_path = dir.path().join("state.json");
            let writer = StateWriter::spawn(state_path.clone(), Duration::from_millis(10), None);

            let core = Coordinator::new(
                catalog.clone(),
                Debouncer::new(Duration::from_millis(400)),
                Selector::new(catalog.len(), state, 5),
                supervisor,
                announcer,
                writer,
                settings,
            );
            Self {
                output,
                synth,
                events: tx,
                core: tokio::spawn(core.run(rx)),
                speech,
                state_path,
                _dir: dir,
            }
        }

        async fn ir(&self, code: InputCode) {
            let raw = RawInputEvent::now(InputSource::Ir, code);
            self.events.send(CoreEvent::Input(raw)).await.unwrap();
        }

        async fn press(&self) {
            let raw = RawInputEvent::now(InputSource::Button, InputCode::Press);
            self.events.send(CoreEvent::Input(raw)).await.unwrap();
        }

        async fn heartbeat(&self) {
            self.events.send(CoreEvent::HeartbeatTick).await.unwrap();
        }

        /// Shut down and return the final state, what was spoken, and what
        /// was written to the state file.
        async fn finish(self) -> (SelectorState, Vec<Spoken>, Option<PersistentState>) {
            self.events.send(CoreEvent::Shutdown).await.unwrap();
            let state = self.core.await.unwrap();
            self.speech.await.unwrap();
            assert_eq!(self.synth.max_concurrent(), 1);
            // Read while the temp dir is still alive.
            let saved = load_persistent(&self.state_path);
            (state, self.synth.entries(), saved)
        }
    }

    async fn settle(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_restarts_on_following_station() {
        let h = Harness::start(&["A", "B", "C"], 0, ScriptedOutput::default(), settings());
        settle(0.2).await;
        h.ir(InputCode::KeyNext).await;
        settle(0.2).await;

        let output = h.output.clone();
        let (state, spoken, saved) = h.finish().await;

        assert_eq!(state.current_index, 1);
        assert_eq!(
            output.calls(),
            vec![
                Call::Launch(url("A")),
                Call::Terminate(url("A")),
                Call::Launch(url("B")),
                Call::Terminate(url("B")),
            ]
        );
        assert!(spoken.contains(&Spoken::Finished("Now playing: B".into())));
        assert_eq!(saved.unwrap().last_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_wraps_to_first_station() {
        let h = Harness::start(&["A", "B", "C"], 2, ScriptedOutput::default(), settings());
        settle(0.2).await;
        h.ir(InputCode::KeyNext).await;
        settle(0.2).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 0);
        assert_eq!(output.launches(), vec![url("C"), url("A")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_press_skips_and_single_press_advances() {
        let names = ["A", "B", "C", "D", "E"];
        let h = Harness::start(&names, 3, ScriptedOutput::default(), settings());
        settle(0.2).await;

        h.press().await;
        h.press().await;
        settle(1.0).await;
        assert_eq!(h.output.launches(), vec![url("D"), url("D")]);

        h.press().await;
        settle(1.0).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 4);
        assert_eq!(output.launches(), vec![url("D"), url("D"), url("E")]);
        assert_eq!(output.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_station_is_retried_then_skipped() {
        let output = ScriptedOutput::default();
        output.fail(&url("B"));
        let h = Harness::start(&["A", "B", "C"], 0, output, settings());
        settle(0.2).await;
        h.ir(InputCode::KeyNext).await;
        settle(20.0).await;

        assert_eq!(
            h.output.launches(),
            vec![url("A"), url("B"), url("B"), url("B"), url("C")]
        );

        // Still taking input.
        h.ir(InputCode::KeyNext).await;
        settle(0.5).await;

        let output = h.output.clone();
        let (state, spoken, _) = h.finish().await;
        assert_eq!(state.current_index, 0);
        assert_eq!(output.launches().last(), Some(&url("A")));
        assert_eq!(output.overlaps(), 0);
        assert!(spoken.contains(&Spoken::Finished("Now playing: C".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stations_failing_announces_and_idles() {
        let output = ScriptedOutput::default();
        output.fail(&url("A"));
        output.fail(&url("B"));
        let settings = CoreSettings {
            max_retries: 0,
            ..settings()
        };
        let h = Harness::start(&["A", "B"], 0, output, settings);
        settle(1.0).await;
        assert_eq!(h.output.launches(), vec![url("A"), url("B")]);

        settle(30.0).await;
        assert_eq!(
            h.output.launches(),
            vec![url("A"), url("B"), url("B"), url("A")]
        );

        let (state, spoken, _) = h.finish().await;
        assert_eq!(state.current_index, 0);
        assert!(spoken.contains(&Spoken::Finished(NO_STATIONS.into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_restarts_same_station() {
        let h = Harness::start(&["A", "B"], 0, ScriptedOutput::default(), settings());
        settle(1.0).await;
        h.output.signal_latest(PlayerSignal::Buffering).await;
        settle(15.0).await;

        let output = h.output.clone();
        let (state, spoken, _) = h.finish().await;
        assert_eq!(state.current_index, 0);
        assert_eq!(output.launches(), vec![url("A"), url("A")]);
        assert!(output.calls().contains(&Call::Terminate(url("A"))));
        // Retries are not announced.
        let announced = spoken.iter().filter(|s| matches!(s, Spoken::Finished(_))).count();
        assert_eq!(announced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_exit_restarts_same_station() {
        let h = Harness::start(&["A", "B"], 0, ScriptedOutput::default(), settings());
        settle(1.0).await;
        h.output
            .signal_latest(PlayerSignal::Exited("end of file".into()))
            .await;
        settle(5.0).await;

        let output = h.output.clone();
        h.finish().await;
        assert_eq!(output.launches(), vec![url("A"), url("A")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_restarts_dead_player() {
        let h = Harness::start(&["A", "B"], 0, ScriptedOutput::default(), settings());
        settle(1.0).await;
        h.heartbeat().await;
        settle(1.0).await;
        assert_eq!(h.output.launches(), vec![url("A")]);

        // Dies without an exit report.
        h.output.crash_latest();
        h.heartbeat().await;
        settle(5.0).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 0);
        assert_eq!(output.launches(), vec![url("A"), url("A")]);
        assert_eq!(output.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_dropping_after_connect_is_given_up() {
        let output = ScriptedOutput::default();
        output.flap(&url("A"));
        let h = Harness::start(&["A", "B", "C"], 0, output, settings());
        settle(15.0).await;

        let output = h.output.clone();
        let (state, spoken, _) = h.finish().await;
        assert_eq!(state.current_index, 1);
        assert_eq!(
            output.launches(),
            vec![url("A"), url("A"), url("A"), url("B")]
        );
        assert!(spoken.contains(&Spoken::Finished("Now playing: B".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_launch_counts_against_startup_deadline() {
        let output = ScriptedOutput::default();
        output.slow(&url("A"), Duration::from_secs(3));
        output.silence(&url("A"));
        let settings = CoreSettings {
            max_retries: 0,
            ..settings()
        };
        let h = Harness::start(&["A", "B"], 0, output, settings);
        // Launch ends at 3 s; the confirmation deadline is still 5 s.
        settle(5.5).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 1);
        assert_eq!(output.launches(), vec![url("A"), url("B")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_start_times_out_and_moves_on() {
        let output = ScriptedOutput::default();
        output.silence(&url("B"));
        let settings = CoreSettings {
            max_retries: 1,
            ..settings()
        };
        let h = Harness::start(&["A", "B", "C"], 0, output, settings);
        settle(0.2).await;
        h.ir(InputCode::KeyNext).await;
        settle(20.0).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 2);
        assert_eq!(output.launches(), vec![url("A"), url("B"), url("B"), url("C")]);
        assert_eq!(output.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_gesture_supersedes_pending_start() {
        let output = ScriptedOutput::default();
        output.silence(&url("B"));
        let h = Harness::start(&["A", "B", "C"], 0, output, settings());
        settle(0.2).await;
        h.ir(InputCode::KeyNext).await;
        settle(1.0).await;
        h.ir(InputCode::KeyNext).await;
        // Past B's confirmation deadline and any retry it could have caused.
        settle(10.0).await;

        let output = h.output.clone();
        let (state, _, _) = h.finish().await;
        assert_eq!(state.current_index, 2);
        assert_eq!(output.launches(), vec![url("A"), url("B"), url("C")]);
        assert_eq!(output.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_gesture_does_not_restart() {
        let h = Harness::start(&["A", "B"], 0, ScriptedOutput::default(), settings());
        settle(0.2).await;
        h.ir(InputCode::KeyVolumeUp).await;
        settle(0.2).await;

        let output = h.output.clone();
        let (state, _, saved) = h.finish().await;
        assert_eq!(state.volume, 85);
        assert_eq!(output.launches(), vec![url("A")]);
        assert!(output.calls().contains(&Call::SetVolume(85)));
        assert_eq!(saved.unwrap().volume, 85);
    }
}
