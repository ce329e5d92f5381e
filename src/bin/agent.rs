use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tvbox_monitor::agent_modules::config::{AgentConfig, LoggingConfig};
use tvbox_monitor::agent_modules::metrics::{Sampler, SysinfoSource};
use tvbox_monitor::agent_modules::queue::{ReadingQueue, SledQueue};
use tvbox_monitor::agent_modules::scheduler::spawn_pipeline;
use tvbox_monitor::agent_modules::sink::InfluxSink;
use tvbox_monitor::agent_modules::uploader::Uploader;
use tvbox_monitor::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "tvbox-agent", version = VERSION, about = "Samples host health and ships it to InfluxDB in batches")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "agent_config.toml")]
    config: PathBuf,

    /// Exit successfully without starting the pipeline.
    #[arg(long)]
    health_check: bool,
}

fn init_logging(config: &LoggingConfig) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(&config.directory, "agent.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // RUST_LOG wins over the configured level.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler; only Ctrl-C will stop the agent."),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C.");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if args.health_check {
        println!("Health check successful.");
        return Ok(());
    }

    if let Err(e) = dotenv::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env file: {e}");
        }
    }

    let loaded = AgentConfig::load(&args.config);
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(&logging);
    info!(version = VERSION, "Starting agent...");

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Critical error loading configuration. Exiting.");
            return Err(e.into());
        }
    };
    config.apply_env_overrides();
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration is incomplete. Exiting.");
        return Err(e.into());
    }
    info!(path = %args.config.display(), config = ?config, "Loaded configuration.");

    let queue: Arc<dyn ReadingQueue> = match SledQueue::open(
        &config.queue.path,
        &config.queue.tree,
        config.queue.flush_on_write,
    ) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!(error = %e, path = %config.queue.path.display(), "Failed to open reading queue. Exiting.");
            return Err(e.into());
        }
    };
    let sink = match InfluxSink::new(&config.influx) {
        Ok(sink) => sink,
        Err(e) => {
            error!(error = %e, url = %config.influx.url, "Failed to build InfluxDB client. Exiting.");
            return Err(e.into());
        }
    };

    let source = SysinfoSource::new(
        Duration::from_millis(config.sampler.cpu_window_ms),
        config.sampler.temperature_path.clone(),
    );
    let sampler = Sampler::new(source, Arc::clone(&queue));
    let uploader = Uploader::new(
        Arc::clone(&queue),
        sink,
        config.effective_device_name(),
        config.influx.measurement.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let shutdown_tx = Arc::new(shutdown_tx);

    info!(device = config.effective_device_name(), "Initializing routines...");
    let mut handles = spawn_pipeline(
        sampler,
        uploader,
        Duration::from_secs(config.sample_interval_seconds()),
        Duration::from_secs(config.upload_interval_seconds()),
        config.uploader.final_flush_on_shutdown,
        shutdown_rx,
    );

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested.");
        let _ = signal_tx.send(());
    });

    // Any task ending stops the whole pipeline.
    while !handles.is_empty() {
        let (result, _index, remaining) = futures::future::select_all(handles).await;
        match result {
            Ok(()) => info!(remaining = remaining.len(), "Pipeline task finished."),
            Err(join_error) => {
                error!(error = ?join_error, "A pipeline task panicked. Stopping the agent.");
            }
        }
        let _ = shutdown_tx.send(());
        handles = remaining;
    }

    info!("Agent stopped.");
    Ok(())
}
