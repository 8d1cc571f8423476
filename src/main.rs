//! vpn-steer binary: parse flags, install logging, run until a signal arrives

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use vpn_steer::config::CliArgs;
use vpn_steer::logger::{self, log, LogLevel};
use vpn_steer::runner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    let level = LogLevel::resolve(cli.log_level.as_deref(), cli.debug);
    logger::init_logger(level, cli.log_file.as_deref())?;

    log::info!(
        tun = ?cli.tun_mode().name(),
        socks = ?cli.socks,
        level = level.as_str(),
        "Starting vpn-steer"
    );

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(i), Ok(t)) => (i, t),
                    (Err(e), _) | (_, Err(e)) => {
                        log::error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_on_signal.cancel();
    });

    let result = runner::run(cli, level, cancel).await;
    match &result {
        Ok(()) => log::info!("Stopped"),
        Err(e) => log::error!(error = %e, "Exiting with error"),
    }
    result
}
