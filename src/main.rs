use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camview::config::{AppConfig, ConfigStore, LogConfig, LogFormat, StreamDescriptor};
use camview::events::{EventBus, TileEvent};
use camview::whep::{RtpVideoSink, TileRegistry};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camview command line arguments
#[derive(Parser, Debug)]
#[command(name = "camview")]
#[command(version, about = "Headless WHEP camera wall client", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON, created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// WHEP server root, e.g. http://127.0.0.1:8889 (overrides config)
    #[arg(short = 'b', long, value_name = "URL")]
    base_url: Option<String>,

    /// Camera key to show; repeat for several tiles (replaces configured streams)
    #[arg(long = "camera", value_name = "KEY")]
    cameras: Vec<String>,

    /// Basic-auth credentials as user:password (overrides config)
    #[arg(long, value_name = "USER:PASS")]
    auth: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Sinks of mounted tiles, by tile id
type Sinks = HashMap<String, Arc<RtpVideoSink>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration before logging so the log section applies
    let store = match &args.config {
        Some(path) => Some(ConfigStore::load(path).await?),
        None => None,
    };
    let mut config = store
        .as_ref()
        .map(|s| (*s.get()).clone())
        .unwrap_or_default();
    apply_overrides(&mut config, &args);

    init_logging(args.log_level, args.verbose, &config.log);

    tracing::info!("Starting camview v{}", env!("CARGO_PKG_VERSION"));
    if let Some(store) = &store {
        tracing::info!("Configuration file: {}", store.path().display());
    }

    config.connection.validate()?;
    if config.streams.is_empty() {
        anyhow::bail!("No cameras configured; pass --camera or list streams in the config file");
    }

    let events = Arc::new(EventBus::new());
    spawn_event_logger(events.subscribe());

    let registry = TileRegistry::new(config.connection.clone(), events)?;
    let mut sinks = Sinks::new();
    sync_streams(&registry, &mut sinks, &config.streams).await;
    tracing::info!(
        "Watching {} camera(s) on {}",
        registry.tile_count().await,
        config.connection.base_url
    );

    let (reload_tx, mut reload_rx) = mpsc::channel(1);
    spawn_reload_listener(reload_tx);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for CTRL+C: {}", e);
                }
                tracing::info!("Shutdown signal received");
                break;
            }
            Some(()) = reload_rx.recv() => {
                if let Some(store) = &store {
                    if let Err(e) = reload(store, &registry, &mut sinks, &args).await {
                        tracing::error!("Configuration reload failed: {}", e);
                    }
                }
                retry_failed(&registry).await;
            }
        }
    }

    registry.shutdown().await;
    for (tile_id, sink) in &sinks {
        let stats = sink.stats();
        tracing::info!(
            "Tile {}: received {} frames ({} packets, {} bytes)",
            tile_id,
            stats.frames,
            stats.packets,
            stats.bytes
        );
    }
    tracing::info!("camview stopped");
    Ok(())
}

/// CLI flags win over the configuration file
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(base_url) = &args.base_url {
        config.connection.base_url = base_url.clone();
    }
    if let Some(auth) = &args.auth {
        config.connection.auth_credentials = Some(auth.clone());
    }
    if !args.cameras.is_empty() {
        config.streams = args
            .cameras
            .iter()
            .map(|key| StreamDescriptor::new(key.clone(), key.clone()))
            .collect();
    }
}

/// Mount, swap and unmount tiles so the registry matches `streams`
async fn sync_streams(registry: &TileRegistry, sinks: &mut Sinks, streams: &[StreamDescriptor]) {
    let mut wanted = Vec::with_capacity(streams.len());

    for stream in streams {
        if wanted.contains(&stream.id) {
            tracing::warn!("Duplicate stream id {}, ignored", stream.id);
            continue;
        }
        wanted.push(stream.id.clone());

        if registry.descriptor(&stream.id).await.is_some() {
            if let Err(e) = registry.update(&stream.id, stream.clone()).await {
                tracing::error!("Failed to update tile {}: {}", stream.id, e);
            }
            continue;
        }

        let sink = sinks
            .entry(stream.id.clone())
            .or_insert_with(|| Arc::new(RtpVideoSink::new(stream.id.clone())))
            .clone();
        if let Err(e) = registry.mount(&stream.id, stream.clone(), sink).await {
            tracing::error!("Failed to mount tile {}: {}", stream.id, e);
            sinks.remove(&stream.id);
        }
    }

    for tile_id in registry.tile_ids().await {
        if !wanted.contains(&tile_id) {
            if let Err(e) = registry.unmount(&tile_id).await {
                tracing::error!("Failed to unmount tile {}: {}", tile_id, e);
            }
            sinks.remove(&tile_id);
        }
    }
}

async fn reload(
    store: &ConfigStore,
    registry: &TileRegistry,
    sinks: &mut Sinks,
    args: &CliArgs,
) -> anyhow::Result<()> {
    if store.reload().await? {
        let mut config = (*store.get()).clone();
        apply_overrides(&mut config, args);

        if config.connection != registry.connection_config() {
            tracing::info!("Connection settings changed, reconnecting all tiles");
            registry.reconfigure(config.connection.clone()).await?;
        }
        sync_streams(registry, sinks, &config.streams).await;
        tracing::info!("Configuration reloaded ({} tiles)", registry.tile_count().await);
    } else {
        tracing::info!("Configuration unchanged");
    }
    Ok(())
}

/// Manual retry of every tile that gave up
async fn retry_failed(registry: &TileRegistry) {
    let retried = registry.retry_exhausted().await;
    if !retried.is_empty() {
        tracing::info!("Retrying failed tiles: {}", retried.join(", "));
    }
}

#[cfg(unix)]
fn spawn_reload_listener(tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading");
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_tx: mpsc::Sender<()>) {}

/// Log tile events; `tile.failed` is the host error notification
fn spawn_event_logger(mut rx: broadcast::Receiver<TileEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged, missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &TileEvent) {
    match event {
        TileEvent::StateChanged {
            tile_id,
            state,
            retry_count,
            ..
        } => tracing::info!("[{}] {} (retries {})", tile_id, state, retry_count),
        TileEvent::HealthChanged {
            tile_id, healthy, ..
        } => {
            if *healthy {
                tracing::info!("[{}] live", tile_id);
            } else {
                tracing::info!("[{}] buffering", tile_id);
            }
        }
        TileEvent::Reconnecting {
            tile_id,
            attempt,
            max_attempts,
            delay_ms,
            ..
        } => tracing::info!(
            "[{}] reconnecting in {}ms ({}/{})",
            tile_id,
            delay_ms,
            attempt,
            max_attempts
        ),
        TileEvent::Failed {
            tile_id,
            stream,
            error,
            terminal,
            ..
        } => {
            if *terminal {
                tracing::error!(
                    "[{}] camera {} unavailable: {} (send SIGHUP to retry)",
                    tile_id,
                    stream.camera_key,
                    error
                );
            } else {
                tracing::warn!("[{}] camera {} failed: {}", tile_id, stream.camera_key, error);
            }
        }
        TileEvent::Removed { tile_id, .. } => tracing::debug!("[{}] removed", tile_id),
    }
}

/// Initialize logging with tracing
fn init_logging(level: Option<LogLevel>, verbose_count: u8, log: &LogConfig) {
    // CLI level first, then the config file
    let configured = level.or_else(|| {
        log.level
            .as_deref()
            .and_then(|s| LogLevel::from_str(s, true).ok())
    });

    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => configured.unwrap_or_default(),
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "camview=error,webrtc=error",
        LogLevel::Warn => "camview=warn,webrtc=warn",
        LogLevel::Info => "camview=info,webrtc=warn",
        LogLevel::Verbose => "camview=debug,webrtc=warn",
        LogLevel::Debug => "camview=debug,webrtc=info",
        LogLevel::Trace => "camview=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = match log.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
