use std::path::Path;
use std::sync::Arc;

use cemslink_core::{FailureQueue, Transmitter};

fn open(config_path: &Path) -> anyhow::Result<(cemslink_core::Config, FailureQueue)> {
    let config = super::load_partial_config(config_path)?;
    let queue = FailureQueue::open(config.queue_file.clone(), config.queue_capacity.max(1));
    Ok((config, queue))
}

pub fn list(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let (config, queue) = open(config_path)?;
    let items = queue.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!(
        "Failure queue: {} ({} / {} items)",
        config.queue_file.display(),
        items.len(),
        queue.capacity()
    );
    if items.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "  {:<36} {:>15} {:>7} {:>6}  {}",
        "ID", "Captured (ms)", "Params", "Tries", "Last error"
    );
    println!("  {}", "-".repeat(90));
    for item in &items {
        println!(
            "  {:<36} {:>15} {:>7} {:>6}  {}",
            item.id,
            item.captured_at_ms,
            item.envelope.params.len(),
            item.retry_count,
            item.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub fn clear(config_path: &Path) -> anyhow::Result<()> {
    let (config, queue) = open(config_path)?;
    let removed = queue.clear();
    queue.persist()?;
    println!(
        "Removed {removed} item(s) from {}",
        config.queue_file.display()
    );
    Ok(())
}

pub fn drain(config_path: &Path) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let queue = FailureQueue::open(config.queue_file.clone(), config.queue_capacity);
    if queue.is_empty() {
        println!("Failure queue is empty.");
        return Ok(());
    }
    let transmitter = Transmitter::new(
        config.endpoint.clone(),
        Arc::new(config.codec()?),
        config.retry_policy(),
        config.request_timeout(),
    );

    println!("Draining {} item(s) to {}", queue.len(), config.endpoint);
    let rt = super::runtime()?;
    let report = rt.block_on(queue.drain(&transmitter))?;
    println!("  {report}");
    if let Some(outcome) = report.aborted {
        anyhow::bail!("drain stopped: {outcome}");
    }
    Ok(())
}
