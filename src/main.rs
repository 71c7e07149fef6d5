use acquisition_flux::config::Config;
use acquisition_flux::decoders::DecoderRegistry;
use acquisition_flux::logging::init_logging;
use acquisition_flux::service::Service;
use std::fs;
use std::process::ExitCode;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Resolves once Ctrl+C or SIGTERM (sent by systemd on stop) is received.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => warn!("Service received Ctrl+C and will stop."),
                    _ = term.recv() => info!("Service received SIGTERM and will stop."),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {:?}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::args().skip(1).any(|arg| arg == "--version" || arg == "-V") {
        println!("{} - {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_DESCRIPTION"));
        println!("Version {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Service PID: {}...", std::process::id());

    if let Err(e) = fs::create_dir_all(&config.working_dirpath) {
        error!(
            "Cannot create working directory {}: {}",
            config.working_dirpath.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let mut service = Service::new(config.working_dirpath.clone(), DecoderRegistry::with_builtin());
    if let Err(e) = service.set_db_connection(&config.db_url) {
        error!("Database connection failed: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = service.run().await {
        error!("MQTT acquisition service error: {}", e);
        return ExitCode::FAILURE;
    }
    for (subscriber_id, e) in service.start_failures() {
        warn!("Subscriber {} is not running: {}", subscriber_id, e);
    }

    let mut status = interval(Duration::from_secs(config.status_interval_secs));
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => info!("{}", service.status_summary()),
        }
    }

    service.stop().await;
    info!("All services shut down successfully.");
    ExitCode::SUCCESS
}
