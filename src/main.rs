//! Route Master - Passenger Tracker
//!
//! Follows one bus and prints its last known location on every update.
//!
//! Usage: `route-master [BUS_ID]` (defaults to `BUS12`).

use anyhow::Context;
use tracing::info;

use route_master_lib::{config::ClientConfig, logging, AppState};

const DEFAULT_BUS_ID: &str = "BUS12";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    logging::init(&config.log_dir());
    info!("Route Master tracker starting...");

    let bus_id = std::env::args()
        .nth(1)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BUS_ID.to_string());

    let app = AppState::open(&config).context("Failed to initialize client")?;
    info!("Using API at {}", app.api.base_url());

    let mut poller = app.poller();
    let mut updates = poller.subscribe();
    poller.activate(bus_id);

    println!("{}", poller.view());

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}\n", poller.view());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    poller.teardown();
    Ok(())
}
