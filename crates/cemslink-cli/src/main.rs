//! CLI for cemslink — aligned, encrypted CEMS data delivery.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cemslink_core::config::DEFAULT_CONFIG_FILE;
use cemslink_core::schedule::Cadence;

#[derive(Parser)]
#[command(name = "cemslink")]
#[command(about = "cemslink — aligned, encrypted stack-emission data delivery")]
#[command(version = cemslink_core::VERSION)]
struct Cli {
    /// Config file (JSON). Environment variables and .env override it.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the datalogger: poll sources, dispatch aligned windows, drain the
    /// failure queue, monitor connectivity. Stops on Ctrl+C.
    Run,

    /// Send one aligned envelope through the full retry policy and print the outcome
    SendTest {
        /// Parameter name
        #[arg(long, default_value = "ph")]
        parameter: String,

        /// Averaged value to report
        #[arg(long, default_value = "7.0")]
        value: f64,

        /// Unit
        #[arg(long, default_value = "pH")]
        unit: String,

        /// Print the plaintext envelope and sealed request before sending
        #[arg(long)]
        show_payload: bool,
    },

    /// Run the bench receiver (decrypts and validates envelopes)
    Receiver {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Shared secret (defaults to the config's token_id)
        #[arg(long)]
        secret: Option<String>,

        /// PEM private key; enables signature verification
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Only accept this station id
        #[arg(long)]
        station: Option<String>,

        /// Only accept this device id
        #[arg(long)]
        device: Option<String>,

        /// Required timestamp alignment in minutes
        #[arg(long, default_value = "1")]
        granularity: u32,

        /// Timezone for alignment checks
        #[arg(long, default_value = "Asia/Kolkata")]
        timezone: String,
    },

    /// Inspect or operate on the persistent failure queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Probe internet connectivity once and print which endpoint answered
    Probe,

    /// Print the next dispatch boundaries
    Schedule {
        /// Cadence: fast (1 min) or normal (15 min). Defaults to the config's.
        #[arg(long)]
        cadence: Option<Cadence>,

        /// IANA timezone. Defaults to the config's.
        #[arg(long)]
        timezone: Option<String>,

        /// How many boundaries to print
        #[arg(long, default_value = "3")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued envelopes, oldest first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every queued envelope
    Clear,
    /// Re-send queued envelopes now, stopping at the first failure
    Drain,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => commands::run::run(&cli.config),
        Commands::SendTest {
            parameter,
            value,
            unit,
            show_payload,
        } => commands::send_test::run(&cli.config, &parameter, value, &unit, show_payload),
        Commands::Receiver {
            port,
            host,
            secret,
            private_key,
            station,
            device,
            granularity,
            timezone,
        } => commands::receiver::run(commands::receiver::ReceiverArgs {
            config_path: &cli.config,
            host: &host,
            port,
            secret,
            private_key: private_key.as_deref(),
            station,
            device,
            granularity,
            timezone: &timezone,
        }),
        Commands::Queue { action } => match action {
            QueueAction::List { json } => commands::queue::list(&cli.config, json),
            QueueAction::Clear => commands::queue::clear(&cli.config),
            QueueAction::Drain => commands::queue::drain(&cli.config),
        },
        Commands::Probe => commands::probe::run(&cli.config),
        Commands::Schedule {
            cadence,
            timezone,
            count,
        } => commands::schedule::run(&cli.config, cadence, timezone.as_deref(), count),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_schedule_with_cadence() {
        let cli = Cli::parse_from(["cemslink", "schedule", "--cadence", "fast", "--count", "2"]);
        match cli.command {
            Commands::Schedule { cadence, count, .. } => {
                assert_eq!(cadence, Some(Cadence::Fast));
                assert_eq!(count, 2);
            }
            _ => panic!("expected schedule"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_parse_queue_drain_with_global_config() {
        let cli = Cli::parse_from(["cemslink", "queue", "drain", "--config", "site.json"]);
        assert!(matches!(
            cli.command,
            Commands::Queue {
                action: QueueAction::Drain
            }
        ));
        assert_eq!(cli.config, PathBuf::from("site.json"));
    }

    #[test]
    fn test_rejects_unknown_cadence() {
        assert!(Cli::try_parse_from(["cemslink", "schedule", "--cadence", "hourly"]).is_err());
    }
}
