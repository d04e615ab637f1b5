use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use cemslink_core::codec::validate_timestamp;
use cemslink_core::schedule::aligned_floor;
use cemslink_core::{AveragedSet, AveragedValue, Transmitter};

pub fn run(
    config_path: &Path,
    parameter: &str,
    value: f64,
    unit: &str,
    show_payload: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let codec = Arc::new(config.codec()?);
    let tz = codec.timezone();
    let granularity = config.cadence.minutes();

    let mut set = AveragedSet::new();
    set.insert(
        parameter,
        AveragedValue {
            value,
            unit: unit.to_string(),
            samples: 1,
        },
    );
    let boundary = aligned_floor(Utc::now(), granularity, &tz);
    let envelope = codec.build(&set, boundary)?;
    validate_timestamp(envelope.timestamp_ms, Utc::now(), granularity, &tz)
        .context("test envelope would be refused")?;

    println!("Sending test envelope");
    println!("  Endpoint:  {}", config.endpoint);
    println!("  Device:    {}", envelope.device_id);
    println!("  Station:   {}", envelope.station_id);
    println!(
        "  Timestamp: {} ({})",
        boundary.with_timezone(&tz),
        envelope.timestamp_ms
    );
    println!("  Value:     {parameter} = {value} {unit}");

    if show_payload {
        let sealed = codec.seal(&envelope, Utc::now())?;
        println!();
        println!("  Plaintext: {}", envelope.to_canonical_json()?);
        println!("  Body:      {}", sealed.body());
        println!("  Signature: {}", sealed.signature());
    }
    println!();

    let transmitter = Transmitter::new(
        config.endpoint.clone(),
        codec,
        config.retry_policy(),
        config.request_timeout(),
    );
    let rt = super::runtime()?;
    let delivery = rt.block_on(transmitter.send_with_retry(&envelope));

    println!("  Outcome:   {}", delivery.outcome);
    println!("  Attempts:  {}", delivery.attempts);
    if !delivery.outcome.is_success() {
        anyhow::bail!("test envelope was not accepted: {}", delivery.outcome);
    }
    Ok(())
}
