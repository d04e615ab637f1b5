use std::path::Path;

use cemslink_core::Orchestrator;

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;

    println!("cemslink v{}", cemslink_core::VERSION);
    println!("   device   {}", config.device_id);
    println!("   station  {}", config.station_id);
    println!("   endpoint {}", config.endpoint);
    println!("   cadence  {} in {}", config.cadence, config.timezone);
    println!("   sources  {}", config.sources.len());
    println!("   queue    {}", config.queue_file.display());
    println!();
    println!("   Press Ctrl+C to stop.");
    println!();

    let orchestrator = Orchestrator::from_config(config)?;
    let shutdown = super::ctrlc_shutdown()?;
    let rt = super::runtime()?;
    rt.block_on(orchestrator.run(shutdown))?;
    Ok(())
}
