pub mod probe;
pub mod queue;
pub mod receiver;
pub mod run;
pub mod schedule;
pub mod send_test;

use std::path::Path;

use anyhow::Context;
use tokio::sync::watch;

use cemslink_core::Config;

/// Full, validated configuration for commands that talk to the endpoint.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load_layered(path).with_context(|| format!("loading {}", path.display()))
}

/// Configuration without credential checks, for local inspection commands.
pub fn load_partial_config(path: &Path) -> anyhow::Result<Config> {
    Config::load_overlay(path).with_context(|| format!("loading {}", path.display()))
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

/// A shutdown flag flipped by Ctrl+C.
pub fn ctrlc_shutdown() -> anyhow::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Ctrl+C received, stopping");
        let _ = tx.send(true);
    })
    .context("installing Ctrl+C handler")?;
    Ok(rx)
}
