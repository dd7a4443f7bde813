//! Entry point: parse CLI/config, wire up the registry/queue/dispatcher,
//! run the accept loop, and shut down cleanly on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telemetryd::config::{Cli, DaemonConfig};
use telemetryd::dispatcher::{Dispatcher, ExemplarHook, StatsSink};
use telemetryd::exporter::LoggingExporter;
use telemetryd::metrics;
use telemetryd::queue;
use telemetryd::registry::Registry;
use telemetryd::span::Exporter;
use tracing_subscriber::{fmt, EnvFilter};

/// Default stats sink: logs every submission at trace level. Stands in for
/// the upstream telemetry runtime's view-data sink, which is injected at
/// construction and considered external per the daemon's egress interface.
struct LoggingSink;

impl StatsSink for LoggingSink {
    fn submit(&self, measure_name: &str, value: f64, tags: &[(String, String)]) {
        tracing::trace!(measure = measure_name, value, ?tags, "stats submission");
    }
}

/// Default exemplar hook: logs the attachment context at trace level. Stands
/// in for the upstream telemetry runtime's exemplar extraction subsystem.
struct LoggingExemplarHook;

impl ExemplarHook for LoggingExemplarHook {
    fn observe(&self, attachments: &[(String, String)]) {
        tracing::trace!(?attachments, "exemplar attachment context");
    }
}

/// Handle to request and observe accept-loop shutdown, in the style of
/// `hdds-logger`'s `StopHandle`.
#[derive(Clone)]
struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::resolve(&cli).context("failed to resolve configuration")?;

    fmt()
        .with_env_filter(EnvFilter::new(config.env_filter()))
        .with_target(false)
        .init();

    tracing::info!(
        socket_path = %config.socket_path.display(),
        queue_capacity = config.queue_capacity,
        "starting telemetryd"
    );

    if let Err(err) = run(config) {
        tracing::error!(error = %err, "startup failed");
        std::process::exit(1);
    }

    Ok(())
}

fn run(config: DaemonConfig) -> Result<()> {
    let registry = Registry::new();
    metrics::register_internal_measures(&registry);

    let (queue_tx, queue_rx) = queue::bounded(config.queue_capacity);

    let exporters: Vec<Arc<dyn Exporter>> = vec![Arc::new(LoggingExporter)];
    let sink: Arc<dyn StatsSink> = Arc::new(LoggingSink);
    let exemplar_hook: Arc<dyn ExemplarHook> = Arc::new(LoggingExemplarHook);
    let dispatcher = Dispatcher::new(queue_rx, registry, exporters, sink, exemplar_hook);

    let dispatcher_thread = std::thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || dispatcher.run())
        .context("failed to spawn dispatcher thread")?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path).with_context(|| {
            format!(
                "failed to remove stale socket at {}",
                config.socket_path.display()
            )
        })?;
    }

    let listener = UnixListener::bind(&config.socket_path).with_context(|| {
        format!("failed to bind socket at {}", config.socket_path.display())
    })?;
    std::fs::set_permissions(
        &config.socket_path,
        std::fs::Permissions::from_mode(config.socket_mode),
    )
    .context("failed to set socket file permissions")?;

    let running = Arc::new(AtomicBool::new(true));
    let stop_handle = StopHandle {
        running: running.clone(),
    };
    let socket_path_for_signal = config.socket_path.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        stop_handle.stop();
        // Unblock the blocking accept() call on the main thread.
        let _ = UnixStream::connect(&socket_path_for_signal);
    })
    .context("failed to install signal handler")?;

    accept_loop(&listener, &running, queue_tx);

    drop(listener);
    dispatcher_thread
        .join()
        .map_err(|_| anyhow::anyhow!("dispatcher thread panicked"))?;

    if config.socket_path.exists() {
        let _ = std::fs::remove_file(&config.socket_path);
    }

    tracing::info!("telemetryd shut down cleanly");
    Ok(())
}

fn accept_loop(listener: &UnixListener, running: &AtomicBool, queue_tx: queue::QueueHandle) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                let queue_tx = queue_tx.clone();
                std::thread::spawn(move || telemetryd::connection::handle_connection(stream, queue_tx));
            }
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                tracing::error!(error = %err, "accept failed");
                return;
            }
        }
    }
}
