use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;

use crate::auth::Tokens;
use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::fetch::{FetchOptions, Fetcher};
use crate::secrets::Sanitizer;
use crate::state::{StateFile, DEFAULT_STATE_FILE};

#[derive(Parser)]
#[command(name = "cifetch")]
#[command(author, version, about = "Download build logs, artifacts and release assets from CI services", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from the given file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Default log filter when RUST_LOG is unset
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Download logs and artifacts newer than the last run
    Fetch {
        /// Store program state in the given file
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,

        /// Fetch everything after WHEN, ignoring stored state
        /// (RFC 3339 timestamp or e.g. "3 days ago")
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Mask configured secrets in downloaded logs
        #[arg(long, default_value_t = false)]
        sanitize_secrets: bool,
    },

    /// Download GitHub Actions logs and artifacts for one commit
    FetchCommit {
        /// Commit SHA, branch or tag
        committish: String,

        /// Mask configured secrets in downloaded logs
        #[arg(long, default_value_t = false)]
        sanitize_secrets: bool,
    },

    /// Mask configured secrets in the given files
    Sanitize {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

impl Cli {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(&self.config)?;

        match &self.command {
            Commands::Fetch {
                state,
                since,
                sanitize_secrets,
            } => {
                info!("Fetching CI assets for {}", config.repo);
                let tokens = Tokens::from_env(&config)?;
                let fetcher = Fetcher::new(
                    &config,
                    &tokens,
                    FetchOptions {
                        since_override: *since,
                        sanitize_secrets: *sanitize_secrets,
                        retry: config.retry.policy(),
                        ..Default::default()
                    },
                )?;

                let mut state = StateFile::load(state)?;
                fetcher.fetch(&mut state).await?;
                if state.is_modified() {
                    info!("State saved to {}", state.path().display());
                }
                Ok(())
            }
            Commands::FetchCommit {
                committish,
                sanitize_secrets,
            } => {
                info!("Fetching CI assets for {} at {committish}", config.repo);
                let tokens = Tokens::from_env(&config)?;
                let fetcher = Fetcher::new(
                    &config,
                    &tokens,
                    FetchOptions {
                        sanitize_secrets: *sanitize_secrets,
                        retry: config.retry.policy(),
                        ..Default::default()
                    },
                )?;
                fetcher.fetch_commit(committish).await?;
                Ok(())
            }
            Commands::Sanitize { paths } => {
                let Some(sanitizer) = Sanitizer::from_config(&config)? else {
                    warn!("No secrets configured; nothing to do");
                    return Ok(());
                };
                for path in paths {
                    sanitizer
                        .sanitize_file(path)
                        .with_context(|| format!("Failed to sanitize {}", path.display()))?;
                }
                Ok(())
            }
        }
    }
}

/// Parse an RFC 3339 timestamp (UTC when the offset is left off) or a
/// relative time such as "2 weeks ago"
fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    parse_since_at(value, Utc::now())
}

fn parse_since_at(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(at.and_utc());
        }
    }

    let words: Vec<&str> = value.split_whitespace().collect();
    let [count, unit, "ago"] = words.as_slice() else {
        bail!("Invalid time {value:?}; expected an RFC 3339 timestamp or \"N units ago\"");
    };
    let count: i64 = count
        .parse()
        .with_context(|| format!("Invalid count in {value:?}"))?;
    let seconds_per_unit = match unit.trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 7 * 86_400,
        "month" => 30 * 86_400,
        "year" => 365 * 86_400,
        other => bail!("Unknown time unit {other:?} in {value:?}"),
    };
    let offset = count
        .checked_mul(seconds_per_unit)
        .and_then(Duration::try_seconds)
        .with_context(|| format!("Time {value:?} is out of range"))?;
    Ok(now - offset)
}
