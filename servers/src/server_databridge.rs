use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

mod bridge_logic;
use bridge_logic::{config, downstream, sessions::SessionRegistry};
use lib_bridge::{BatchCache, Broadcaster, TransportSink, setup_logging};

const APP_NAME: &str = "server_databridge";

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_file) = config::load_config();
    let log_file = setup_logging(&config.log_dir(), config.log_level(), APP_NAME)?;
    log::info!("Logging to {}", log_file.display());
    config_file.log();

    let bridge_config = config.bridge_config();
    bridge_config.validate()?;
    log::info!(
        "Bridge pool: {} slots x {} bytes, lease limit {} ms; cache: {} entries / {} ms.",
        bridge_config.pool_capacity,
        bridge_config.slot_size_bytes,
        bridge_config.max_lease_ms,
        bridge_config.cache_max_entries,
        bridge_config.cache_flush_interval_ms
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let sessions = Arc::new(SessionRegistry::new());
    let transport: Arc<dyn TransportSink> = sessions.clone();
    let broadcaster = Arc::new(Broadcaster::new(&bridge_config, transport)?);
    let cache = Arc::new(BatchCache::new(Arc::clone(&broadcaster), &bridge_config)?);

    let app_state = downstream::AppState {
        broadcaster: Arc::clone(&broadcaster),
        cache: Arc::clone(&cache),
        sessions,
        shutdown: shutdown_tx.clone(),
    };

    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Could not install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
        result = &mut downstream_handle => {
            match result {
                Ok(Ok(())) => log::warn!("Downstream server stopped unexpectedly."),
                Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
                Err(e) => log::error!("Downstream server task panicked: {}", e),
            }
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    if !downstream_handle.is_finished() {
        match downstream_handle.await {
            Ok(Err(e)) => log::error!("Downstream server failed during shutdown: {}", e),
            Err(e) => log::error!("Downstream server task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    // Whatever is still cached goes out before the pool stops.
    if let Err(e) = cache.flush().await {
        log::warn!("Final cache flush failed: {}", e);
    }
    cache.shutdown().await;
    broadcaster.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}
