use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use pressforward::config::RetrievalConfig;
use pressforward::db::Database;
use pressforward::logging::configure_logging;
use pressforward::retrieval::{ModuleRegistry, RetrievalEvent, Scheduler};
use pressforward::store::Ports;
use pressforward::{web, TARGET_RETRIEVAL};

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let config = RetrievalConfig::from_env();
    info!(
        "Starting pressforward {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let db = Arc::new(Database::new(&config.database_path).await?);
    match db.collect_stats().await {
        Ok(stats) => info!("Database stats (feeds:items:metas:options): {}", stats),
        Err(err) => warn!("Failed to collect database stats: {}", err),
    }

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        Ports::from_backend(db),
        ModuleRegistry::with_defaults(),
    ));

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            error!("Failed to listen for ctrl-c");
        }
        let _ = cancel_tx.send(true);
    });

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: TARGET_RETRIEVAL, "Event logger skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = {
        let scheduler = Arc::clone(&scheduler);
        let bind_address = config.bind_address.clone();
        let port = config.port;
        tokio::spawn(async move {
            if let Err(err) = web::api_loop(scheduler, &bind_address, port).await {
                error!("API server stopped: {}", err);
            }
        })
    };

    let mut period = scheduler.tick_period().await;
    info!(target: TARGET_RETRIEVAL, "Retrieving feeds every {} minutes", period.as_secs() / 60);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_rx.changed() => break,
        }
        tokio::select! {
            outcome = scheduler.tick() => {
                info!(target: TARGET_RETRIEVAL, "Tick finished: {:?}", outcome);
            }
            _ = cancel_rx.changed() => break,
        }

        let current = scheduler.tick_period().await;
        if current != period {
            info!(
                target: TARGET_RETRIEVAL,
                "Retrieval frequency changed to {} minutes",
                current.as_secs() / 60
            );
            period = current;
            ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
    }

    info!("Shutting down");
    server.abort();
    Ok(())
}

fn log_event(event: &RetrievalEvent) {
    match event {
        RetrievalEvent::ItemsIngested { feed_id, new_items } => {
            info!(target: TARGET_RETRIEVAL, "Feed {} added {} items", feed_id, new_items)
        }
        RetrievalEvent::FeedError {
            feed_id,
            error_count,
            message,
        } => warn!(
            target: TARGET_RETRIEVAL,
            "Feed {} error #{}: {}", feed_id, error_count, message
        ),
        RetrievalEvent::CycleComplete => info!(target: TARGET_RETRIEVAL, "Retrieval cycle complete"),
        RetrievalEvent::CursorRepaired { reason } => {
            warn!(target: TARGET_RETRIEVAL, "Retrieval cursor repaired: {}", reason)
        }
    }
}
