use std::path::Path;

use chrono::Utc;
use chrono_tz::Tz;

use cemslink_core::schedule::{AlignmentScheduler, Cadence};

pub fn run(
    config_path: &Path,
    cadence: Option<Cadence>,
    timezone: Option<&str>,
    count: usize,
) -> anyhow::Result<()> {
    let config = super::load_partial_config(config_path)?;
    let cadence = cadence.unwrap_or(config.cadence);
    let tz_name = timezone.unwrap_or(&config.timezone);
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone '{tz_name}'"))?;

    let now = Utc::now();
    let mut scheduler = AlignmentScheduler::new(cadence, tz);

    println!("Cadence:  {cadence}");
    println!("Timezone: {tz}");
    println!("Now:      {}", now.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z"));
    println!();
    for i in 0..count.max(1) {
        let at = scheduler.next_dispatch(now);
        let wait = (at - now).num_seconds();
        println!(
            "  #{:<2} {}  (+{}m{:02}s, {} ms)",
            i + 1,
            at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z"),
            wait / 60,
            wait % 60,
            at.timestamp_millis()
        );
    }
    Ok(())
}
