use std::path::Path;

use anyhow::Context;
use chrono_tz::Tz;

use cemslink_core::codec::parse_private_key;
use cemslink_receiver::{DATA_PATH, ReceiverConfig};

pub struct ReceiverArgs<'a> {
    pub config_path: &'a Path,
    pub host: &'a str,
    pub port: u16,
    pub secret: Option<String>,
    pub private_key: Option<&'a Path>,
    pub station: Option<String>,
    pub device: Option<String>,
    pub granularity: u32,
    pub timezone: &'a str,
}

pub fn run(args: ReceiverArgs<'_>) -> anyhow::Result<()> {
    let secret = match args.secret {
        Some(secret) => secret,
        None => super::load_partial_config(args.config_path)?.token_id,
    };
    if secret.trim().is_empty() {
        anyhow::bail!("no shared secret: pass --secret or set TOKEN_ID");
    }

    let mut config = ReceiverConfig::new(secret);
    if let Some(path) = args.private_key {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        config.private_key = Some(parse_private_key(&pem)?);
    }
    config.expected_station = args.station;
    config.expected_device = args.device;
    config.granularity_minutes = args.granularity.max(1);
    config.timezone = args
        .timezone
        .parse::<Tz>()
        .map_err(|_| anyhow::anyhow!("unknown timezone '{}'", args.timezone))?;

    let base = format!("http://{}:{}", args.host, args.port);
    println!("cemslink bench receiver v{}", cemslink_core::VERSION);
    println!("   {base}");
    println!();
    println!("   Endpoints:");
    println!("     POST {DATA_PATH}   Encrypted envelope (X-Device-Id, signature headers)");
    println!("     GET  /health                Counters");
    println!("     GET  /received              Accepted envelopes");
    println!("     POST /simulate              {{\"http_status\":503,\"http_count\":3}} or {{\"app_status\":91}}");
    println!("     DELETE /simulate            Clear simulation");
    println!();
    println!(
        "   Signature check: {}",
        if config.private_key.is_some() { "on" } else { "off" }
    );
    println!(
        "   Alignment:       {} min in {}",
        config.granularity_minutes, config.timezone
    );
    println!();

    let rt = super::runtime()?;
    rt.block_on(cemslink_receiver::run_server(config, args.host, args.port))
        .with_context(|| format!("serving on {}:{}", args.host, args.port))
}
