//! `agent-pulse` — run the background service in the foreground.
//!
//! The relay wire transport is injected at the [`Service`] boundary; this
//! binary wires up the bundled in-process event store, which is what local
//! and embedded deployments use. Container deployments swap in their own
//! transport behind the same trait.

use std::sync::Arc;

use agentpulse::relay::{loopback::LoopbackRelay, RelayTransport};
use agentpulse::{Config, Service};
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    agentpulse::logging::init();

    let cfg = Config::from_env();
    log::info!(
        "starting agent-pulse (data dir: {}, {} relay(s))",
        cfg.data_dir.display(),
        cfg.relays.len()
    );

    let relays: Vec<Arc<dyn RelayTransport>> = cfg
        .relays
        .iter()
        .map(|url| LoopbackRelay::new(url.clone()) as Arc<dyn RelayTransport>)
        .collect();

    let service = Service::start(cfg, relays).await?;
    service.run().await?;
    Ok(())
}
