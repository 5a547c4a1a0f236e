mod announcer;
mod catalog;
mod core;
mod debounce;
mod input;
mod mixer;
mod mpv;
mod persist;
mod selector;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use radioclick_proto::config::Config;
use radioclick_proto::state::{initial_state, load_persistent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{CoreEvent, CoreSettings, Coordinator};
use crate::supervisor::Supervisor;

const HEARTBEAT: Duration = Duration::from_secs(10);

/// Internet radio for a Raspberry Pi with one button and an IR remote.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(log_level: &str) -> anyhow::Result<PathBuf> {
    let data_dir = radioclick_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
    Ok(log_path)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)?;

    let log_path = init_logging(&config.daemon.log_level)?;
    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", config_path);

    let base_dir = Config::base_dir(&config_path);
    let catalog = match catalog::load(&config.playlist, &base_dir).await {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let station_count = catalog.len();
    let state_file = &config.daemon.state_file;
    let state = initial_state(
        state_file,
        station_count,
        config.playback.last_index,
        config.playback.volume,
    );
    let written = load_persistent(state_file).map(|p| p.restore(station_count));

    // Event channel: every external input funnels into the coordinator
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    let (announcer, announcer_task) =
        announcer::Announcer::spawn(announcer::synth_from_config(&config.announce));
    let writer = persist::StateWriter::spawn(
        state_file.clone(),
        config.daemon.persist_debounce(),
        written,
    );

    let mixer = mixer::Mixer::from_config(&config.playback.mixer_control);
    let supervisor = Supervisor::new(
        Box::new(mpv::MpvOutput::new()?),
        mixer,
        state.volume,
        config.playback.stall_timeout(),
        event_tx.clone(),
    );

    let cancel = CancellationToken::new();
    let input_tasks = input::spawn_sources(&config.input, event_tx.clone(), cancel.clone());

    let heartbeat_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(CoreEvent::HeartbeatTick).await.is_err() {
                break;
            }
        }
    });

    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Signal received, shutting down");
        let _ = signal_tx.send(CoreEvent::Shutdown).await;
    });
    drop(event_tx);

    let coordinator = Coordinator::new(
        catalog,
        debounce::Debouncer::new(config.input.double_click_window()),
        selector::Selector::new(station_count, state, config.playback.volume_step),
        supervisor,
        announcer,
        writer,
        CoreSettings::from_config(&config.playback),
    );

    info!("Initialised, running event loop");
    coordinator.run(event_rx).await;

    cancel.cancel();
    for task in input_tasks {
        let _ = task.await;
    }
    // Dropping the speech future kills espeak.
    announcer_task.abort();
    Ok(())
}
