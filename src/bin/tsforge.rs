//! Command-line surface for the batch toolkit. Subcommands wire flag values
//! into the library's operation configs; all real work happens in the
//! library.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tsforge::backfill::{backfill, BackfillConfig};
use tsforge::common::{clamp_parallelism, parse_duration, parse_time};
use tsforge::database::Database;
use tsforge::error::{ForgeError, Result};
use tsforge::exporter::{export, ExportConfig};
use tsforge::generate::{generate, load_metric_config, GenerateConfig};
use tsforge::importer::{import, ImportConfig};
use tsforge::migrate::{migrate, MigrateConfig};
use tsforge::rules::load_rule_file;
use tsforge::tsdb::{DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
use tsforge::web::{run_web, WebConfig};

/// Batch toolkit for a block-structured time-series database.
#[derive(Parser, Debug)]
#[command(name = "tsforge", version, about)]
struct Cli {
    /// Enables verbose logging (repeat for more verbosity).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// Time range flags shared by the range-based commands. Values accept
/// integer milliseconds, relative times such as "6 hours ago", and dates.
#[derive(Args, Debug)]
struct TimeRangeArgs {
    /// Start of the time range.
    #[arg(long, value_parser = parse_time_flag)]
    start: DateTime<Utc>,

    /// End of the time range.
    #[arg(long, value_parser = parse_time_flag)]
    end: DateTime<Utc>,
}

impl TimeRangeArgs {
    fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(ForgeError::Config(format!(
                "start ({}) must be before end ({})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

fn parse_time_flag(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_time(raw).map_err(|e| e.to_string())
}

fn parse_duration_flag(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

fn parse_regex_flag(raw: &str) -> std::result::Result<Regex, String> {
    Regex::new(raw).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill recording rule data into a local TSDB.
    Backfill {
        /// Directory to read and write TSDB data.
        #[arg(long)]
        directory: PathBuf,

        #[command(flatten)]
        range: TimeRangeArgs,

        /// Interval at which samples will be backfilled.
        #[arg(long, default_value = "15s", value_parser = parse_duration_flag)]
        sample_interval: Duration,

        /// Config file defining the rules to evaluate.
        #[arg(long = "rule-config-file", required = true)]
        rule_config_file: Vec<PathBuf>,

        /// Rule group filters selecting the groups to backfill.
        #[arg(long = "rule-group-filter", default_value = ".+", value_parser = parse_regex_flag)]
        rule_group_filter: Vec<Regex>,

        /// Rule name filters selecting the rules to backfill.
        #[arg(long = "rule-name-filter", default_value = ".+", value_parser = parse_regex_flag)]
        rule_name_filter: Vec<Regex>,

        /// Worker parallelism, clamped to the CPU count.
        #[arg(long, default_value_t = 1)]
        parallelism: usize,
    },

    /// Migrate data from a remote endpoint to a local TSDB.
    Migrate {
        /// Output directory to write TSDB data.
        #[arg(long)]
        output_directory: PathBuf,

        #[command(flatten)]
        range: TimeRangeArgs,

        /// Interval at which samples will be migrated.
        #[arg(long, default_value = "15s", value_parser = parse_duration_flag)]
        sample_interval: Duration,

        /// Series selector to migrate (repeatable).
        #[arg(long = "matcher", required = true)]
        matcher: Vec<String>,

        /// Remote host to migrate data from.
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Remote port.
        #[arg(long, default_value_t = 9090)]
        port: u16,

        /// URL scheme of the remote host.
        #[arg(long, default_value = "http")]
        scheme: String,

        /// Worker parallelism, clamped to the CPU count.
        #[arg(long, default_value_t = 4)]
        parallelism: usize,
    },

    /// Generate series data from expression definitions.
    Generate {
        /// Output directory to generate data in.
        #[arg(long)]
        output_directory: PathBuf,

        #[command(flatten)]
        range: TimeRangeArgs,

        /// Interval at which samples will be generated.
        #[arg(long, default_value = "15s", value_parser = parse_duration_flag)]
        sample_interval: Duration,

        /// Config file defining the time series to create.
        #[arg(long)]
        metric_config_file: PathBuf,

        /// Config file defining recording rules to evaluate afterwards.
        #[arg(long = "rule-config-file")]
        rule_config_file: Vec<PathBuf>,

        /// Worker parallelism, clamped to the CPU count.
        #[arg(long, default_value_t = 1)]
        parallelism: usize,
    },

    /// Compact a local TSDB.
    Compact {
        /// Directory holding the TSDB to compact.
        #[arg(long)]
        directory: PathBuf,
    },

    /// Export remote data to a columnar document file.
    Export {
        /// File to write the export stream to.
        #[arg(long)]
        output_file: PathBuf,

        #[command(flatten)]
        range: TimeRangeArgs,

        /// Interval at which samples will be exported.
        #[arg(long, default_value = "15s", value_parser = parse_duration_flag)]
        sample_interval: Duration,

        /// Series selector to export (repeatable).
        #[arg(long = "matcher", required = true)]
        matcher: Vec<String>,

        /// Remote host to export data from.
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Remote port.
        #[arg(long, default_value_t = 9090)]
        port: u16,

        /// URL scheme of the remote host.
        #[arg(long, default_value = "http")]
        scheme: String,
    },

    /// Import columnar document files into a local TSDB.
    Import {
        /// Output directory to write TSDB data.
        #[arg(long)]
        output_directory: PathBuf,

        /// File containing the data to import (repeatable).
        #[arg(long = "data-file", required = true)]
        data_file: Vec<PathBuf>,
    },

    /// Run the alert tester web server.
    Web {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen_address: SocketAddr,

        /// Remote host queried during rule evaluation.
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Remote port.
        #[arg(long, default_value_t = 9090)]
        port: u16,

        /// URL scheme of the remote host.
        #[arg(long, default_value = "http")]
        scheme: String,

        /// Default interval at which samples are taken within a range.
        #[arg(long, default_value = "15s", value_parser = parse_duration_flag)]
        sample_interval: Duration,
    },
}

fn base_url(scheme: &str, host: &str, port: u16) -> String {
    format!("{}://{}:{}", scheme, host, port)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Backfill {
            directory,
            range,
            sample_interval,
            rule_config_file,
            rule_group_filter,
            rule_name_filter,
            parallelism,
        } => {
            range.validate()?;
            backfill(&BackfillConfig {
                directory,
                start: range.start,
                end: range.end,
                sample_interval,
                rule_config_files: rule_config_file,
                rule_group_filters: rule_group_filter,
                rule_name_filters: rule_name_filter,
                parallelism: clamp_parallelism(parallelism),
            })
        }
        Command::Migrate {
            output_directory,
            range,
            sample_interval,
            matcher,
            host,
            port,
            scheme,
            parallelism,
        } => {
            range.validate()?;
            migrate(&MigrateConfig {
                output_directory,
                start: range.start,
                end: range.end,
                sample_interval,
                matcher_expressions: matcher,
                base_url: base_url(&scheme, &host, port),
                parallelism: clamp_parallelism(parallelism),
            })
        }
        Command::Generate {
            output_directory,
            range,
            sample_interval,
            metric_config_file,
            rule_config_file,
            parallelism,
        } => {
            range.validate()?;
            let metric_config = load_metric_config(&metric_config_file)?;
            let mut rule_groups = Vec::new();
            for file in &rule_config_file {
                rule_groups.extend(load_rule_file(file)?);
            }
            generate(&GenerateConfig {
                output_directory,
                start: range.start,
                end: range.end,
                sample_interval,
                parallelism: clamp_parallelism(parallelism),
                metric_config,
                rule_groups,
            })
        }
        Command::Compact { directory } => {
            let database = Database::new(&directory, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION)?;
            database.compact()
        }
        Command::Export {
            output_file,
            range,
            sample_interval,
            matcher,
            host,
            port,
            scheme,
        } => {
            range.validate()?;
            export(&ExportConfig {
                output_file,
                base_url: base_url(&scheme, &host, port),
                start: range.start,
                end: range.end,
                sample_interval,
                matcher_expressions: matcher,
            })
        }
        Command::Import {
            output_directory,
            data_file,
        } => import(&ImportConfig {
            output_directory,
            data_files: data_file,
        }),
        Command::Web {
            listen_address,
            host,
            port,
            scheme,
            sample_interval,
        } => run_web(&WebConfig {
            listen_address,
            base_url: base_url(&scheme, &host, port),
            sample_interval,
        }),
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
