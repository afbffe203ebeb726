use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "chimer",
    about = "Chimer plays a short sound when your coding agent needs you, unless it shouldn't.",
    long_about = "Chimer turns agent lifecycle events into sounds, gated by quiet hours, cooldowns, throttling, filters and a temporary quick-disable.\n\nState shared between invocations lives in a small JSON file guarded by a lock, so parallel hooks never double-play.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Load configuration from PATH instead of ~/.config/chimer.yml.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load configuration from PATH instead of ~/.config/chimer.yml."
    )]
    pub(crate) config: Option<PathBuf>,

    /// Keep shared state at PATH instead of the configured or default location.
    #[arg(
        long = "state",
        global = true,
        value_name = "PATH",
        help = "Keep shared state at PATH instead of the configured or default location."
    )]
    pub(crate) state: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Gate an event and play its sound if every policy allows it.
    #[command(about = "Gate an event and play its sound if every policy allows it.")]
    Notify {
        /// stop, subagent_stop, permission, idle, error, session_start, session_end, pre_compact.
        #[arg(value_name = "EVENT")]
        event: String,

        /// Override the volume (0.0-1.0 or a percentage such as 70%).
        #[arg(long = "volume", value_name = "LEVEL")]
        volume: Option<String>,

        /// Use this profile for this event only.
        #[arg(long = "profile", value_name = "NAME")]
        profile: Option<String>,

        /// Attach metadata for filter rules (repeatable; also supports comma-separated lists).
        #[arg(
            long = "meta",
            value_name = "KEY=VALUE",
            action = clap::ArgAction::Append
        )]
        meta: Vec<String>,

        /// Evaluate and resolve without playing or touching state.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Mute every event for a while, optionally switching profile when it ends.
    #[command(about = "Mute every event for a while, optionally switching profile when it ends.")]
    Quiet {
        /// How long to stay quiet, e.g. 30m, 2h, 90s, or bare seconds.
        #[arg(value_name = "DURATION")]
        duration: String,

        /// Profile to switch to once the quiet period expires.
        #[arg(long = "then", value_name = "PROFILE")]
        then: Option<String>,
    },

    /// End a quick-disable early.
    #[command(about = "End a quick-disable early.")]
    Resume,

    /// Make PROFILE the active profile until changed again.
    #[command(about = "Make PROFILE the active profile until changed again.")]
    Use {
        #[arg(value_name = "PROFILE")]
        profile: String,
    },

    /// Print the shared state as JSON.
    #[command(about = "Print the shared state as JSON.")]
    Status,
}

pub(crate) fn parse_meta(raw_values: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut metadata = BTreeMap::new();
    for raw in raw_values {
        for (index, segment) in raw.split(',').enumerate() {
            let trimmed = segment.trim();
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(format!(
                    "Invalid --meta value: expected KEY=VALUE in {:?} at index {}.",
                    raw, index
                ));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(format!(
                    "Invalid --meta value: empty key in {:?} at index {}.",
                    raw, index
                ));
            }
            metadata.insert(key.to_string(), value.trim().to_string());
        }
    }
    Ok(metadata)
}
