//! Scenario runner.
//!
//! Loads a JSON scenario (or falls back to the built-in defaults), runs the
//! simulation to completion and logs the aggregate metrics. The heavy lifting
//! lives in the library; this binary only wires logging, configuration and
//! reporting together.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{LevelFilter, info};

use lorawan_network_simulator::{ScenarioConfig, Simulator};

fn main() -> Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("lorawan_network_simulator"), LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match env::args().nth(1) {
        Some(path) => ScenarioConfig::load(Path::new(&path))
            .with_context(|| format!("loading scenario {path}"))?,
        None => {
            info!("no scenario file given, using built-in defaults");
            ScenarioConfig {
                packets_to_send: 1000,
                ..ScenarioConfig::default()
            }
        }
    };
    let max_steps = config.max_steps;

    let mut sim = Simulator::new(config).context("building simulator")?;
    info!(
        "starting run: {} nodes, {} gateways",
        sim.nodes.len(),
        sim.gateways.len()
    );
    sim.run(max_steps);

    let metrics = sim.get_metrics();
    info!("simulated time: {:.1} s", sim.current_time);
    info!(
        "packets: sent {} delivered {} collided {} no-coverage {}",
        sim.packets_sent,
        sim.packets_delivered,
        sim.packets_lost_collision,
        sim.packets_lost_no_signal
    );
    info!(
        "PDR {:.3}, avg delay {:.3} s, throughput {:.1} bps, energy {:.3} J, retransmissions {}",
        metrics.pdr,
        metrics.avg_delay_s,
        metrics.throughput_bps,
        metrics.energy_j,
        metrics.retransmissions
    );
    for (sf, count) in &metrics.sf_distribution {
        if *count > 0 {
            info!(
                "SF{sf}: {count} nodes, PDR {:.3}",
                metrics.pdr_by_sf.get(sf).copied().unwrap_or(0.0)
            );
        }
    }
    for (gw_id, pdr) in &metrics.pdr_by_gateway {
        info!("gateway {gw_id}: delivery share {pdr:.3}");
    }
    Ok(())
}
