use std::path::Path;
use std::time::{Duration, Instant};

use cemslink_core::monitor::{HttpProbe, Probe};

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = super::load_partial_config(config_path)?;
    let endpoints = config.monitor.probe_endpoints.clone();
    let probe = HttpProbe::new(
        endpoints.clone(),
        Duration::from_secs(config.monitor.probe_timeout_secs.max(1)),
    );

    println!("Probing connectivity ({} endpoint(s))", endpoints.len());
    for url in &endpoints {
        println!("  {url}");
    }
    println!();

    let rt = super::runtime()?;
    let t0 = Instant::now();
    let result = rt.block_on(probe.check());
    let elapsed = t0.elapsed();

    if result.reachable {
        println!(
            "  Online via {} ({}, {:.3}s)",
            result.endpoint.as_deref().unwrap_or("?"),
            result.detail,
            elapsed.as_secs_f64()
        );
        Ok(())
    } else {
        println!("  Offline: {}", result.detail);
        anyhow::bail!("no probe endpoint reachable")
    }
}
