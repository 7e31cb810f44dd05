mod auction;
mod config;
mod event;
mod event_log;
mod persistence;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

const DEMO_ROOM: &str = "demo";

/// A waiting room with two bidders and a few players, for trying things out
async fn seed_demo(persistence: &persistence::InMemoryPersistence) {
    persistence.add_room(DEMO_ROOM, "host").await;
    persistence.add_bidder(DEMO_ROOM, "bidder-alice", "alice", 1000).await;
    persistence.add_bidder(DEMO_ROOM, "bidder-bob", "bob", 1000).await;
    for (item_id, base_price) in [("player-1", 100), ("player-2", 200), ("player-3", 50)] {
        persistence.add_item(DEMO_ROOM, item_id, base_price).await;
    }
    info!(room_id = DEMO_ROOM, "demo room seeded");
}

async fn run(
    config: config::Config,
    persistence: persistence::SharedPersistence,
    svc_ctr: service::ServiceControl,
) -> Result<()> {
    let events = Arc::new(event_log::InMemoryEventLog::with_capacity(
        config.event_log_capacity,
    ));
    let runtime = service::AuctionRuntime::new(persistence, events.clone(), config.timer);

    let recovered = runtime
        .recover_live_rooms()
        .await
        .context("failed to recover live rooms")?;
    info!(recovered, "auction runtime ready");

    let res = svc_ctr
        .run(
            "http",
            service::run_http_server(
                config.listen_addr,
                service::AppState {
                    runtime: runtime.clone(),
                    events,
                },
                svc_ctr.clone(),
            ),
        )
        .await;

    runtime.shutdown();
    res
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env()?;
    info!(timer = ?config.timer, listen_addr = %config.listen_addr, "starting");

    let tokio_runtime = tokio::runtime::Runtime::new()?;

    let persistence: persistence::SharedPersistence = match &config.database_url {
        Some(url) => Arc::new(persistence::PostgresPersistence::connect(url)?),
        None => {
            let persistence = persistence::InMemoryPersistence::new();
            if config.seed_demo {
                tokio_runtime.block_on(seed_demo(&persistence));
            }
            Arc::new(persistence)
        }
    };

    let svc_ctr = service::ServiceControl::new();

    ctrlc::set_handler({
        let svc_ctr = svc_ctr.clone();
        move || {
            eprintln!("Stopping all services...");
            svc_ctr.stop_all();
        }
    })?;

    tokio_runtime.block_on(run(config, persistence, svc_ctr))
}
