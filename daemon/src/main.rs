//! voiceturn-daemon: background voice turn controller
//!
//! Runs the assistant state machine and serves it over a Unix socket. A
//! front end process owning the microphone, recognizer and speaker
//! connects, subscribes, obeys engine commands and reports back.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voiceturn::bridge::Bridge;
use voiceturn::ipc::Server;
use voiceturn::lifecycle::ShutdownSignal;
use voiceturn::{Assistant, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voiceturn-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, "configuration loaded");

    let mut shutdown = ShutdownSignal::new()?;

    let bridge = Bridge::new();
    let (assistant, machine) = Assistant::spawn(
        &config.assistant,
        |notifier| Ok(bridge.recognizer(notifier)),
        bridge.engines(),
    )?;
    let events = assistant.events().await?;

    let server = Server::new(&config.socket_path, assistant.clone(), bridge)?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = server.publish(events) => {
            info!("event stream ended");
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    assistant.shutdown();
    if let Err(e) = machine.await {
        error!(?e, "state machine task failed");
    }
    server.shutdown().await;

    info!("voiceturn-daemon stopped");

    Ok(())
}
