use chrono::{Local, Utc};
use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cli::{parse_meta, Cli, CliCommand};
use crate::config::{load_config, Config, LoadedConfig};
use crate::event::{Event, EventKind};
use crate::logger::{sanitize_log_value, Logger};
use crate::pipeline::{Pipeline, Report};
use crate::player::CommandPlayer;
use crate::policy::Verdict;
use crate::state::QuickDisable;
use crate::store::StateStore;
use crate::values::{Span, Volume};

const DEFAULT_CONFIG_REL: &str = ".config/chimer.yml";
const DEFAULT_STATE_REL: &str = ".local/state/chimer/state.json";

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.log_transition(&format!("quit reason={}", sanitized));
    Quit {
        code,
        reason: reason.to_string(),
    }
}

fn usage_error(message: String) -> Quit {
    eprintln!("{}", message);
    Quit {
        code: 1,
        reason: message,
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn load_or_default(path: Option<&Path>, home: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    match load_config(path, home) {
        Ok(LoadedConfig { config, .. }) => config,
        Err(message) => {
            eprintln!("Warning: {}; using defaults", message);
            Config::default()
        }
    }
}

fn state_path(cli_state: Option<PathBuf>, config: &Config, home: Option<&Path>) -> PathBuf {
    cli_state
        .or_else(|| config.state_path.clone())
        .unwrap_or_else(|| match home {
            Some(home) => home.join(DEFAULT_STATE_REL),
            None => env::temp_dir().join("chimer").join("state.json"),
        })
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    let home = home_dir();
    let config_path = cli
        .config
        .clone()
        .or_else(|| home.as_ref().map(|home| home.join(DEFAULT_CONFIG_REL)));
    let config = load_or_default(config_path.as_deref(), home.as_deref());
    let logger = Logger::new(config.log_path.clone());
    let store = StateStore::new(
        state_path(cli.state, &config, home.as_deref()),
        config.lock_timeout.as_std(),
    );

    match cli.command {
        CliCommand::Notify {
            event,
            volume,
            profile,
            meta,
            dry_run,
        } => {
            let kind = EventKind::try_from(event.as_str()).map_err(usage_error)?;
            let metadata = parse_meta(&meta).map_err(usage_error)?;
            let volume = volume
                .as_deref()
                .map(Volume::parse)
                .transpose()
                .map_err(|err| usage_error(format!("Invalid --volume value: {}", err)))?;
            let mut event = Event::new(kind, Local::now());
            event.profile = profile;
            event.volume = volume;
            event.metadata = metadata;
            run_notify(&config, &store, &logger, &event, dry_run)
        }
        CliCommand::Quiet { duration, then } => {
            let span = Span::parse(&duration)
                .map_err(|err| usage_error(format!("Invalid quiet duration: {}", err)))?;
            run_quiet(&store, &logger, span, then)
        }
        CliCommand::Resume => run_resume(&store, &logger),
        CliCommand::Use { profile } => run_use(&config, &store, &logger, &profile),
        CliCommand::Status => run_status(&store),
    }
}

fn run_notify(
    config: &Config,
    store: &StateStore,
    logger: &Logger,
    event: &Event,
    dry_run: bool,
) -> Result<(), Quit> {
    let player = CommandPlayer::from_config(&config.player, logger);
    let interrupt_flag = Arc::new(AtomicBool::new(false));
    if !dry_run {
        if let Err(err) = ctrlc::set_handler({
            let interrupt_flag = Arc::clone(&interrupt_flag);
            move || {
                interrupt_flag.store(true, Ordering::SeqCst);
            }
        }) {
            logger.log_fields("interrupt handler", &[("error", &err.to_string())]);
        }
    }
    let pipeline = Pipeline {
        config,
        store,
        player: &player,
        logger,
        interrupt: &interrupt_flag,
    };
    let mut rng = rand::thread_rng();

    if dry_run {
        let report = pipeline.preview(event, &mut rng);
        println!("{}", render_preview(&report));
        return Ok(());
    }

    let report = pipeline.notify(event, &mut rng);
    if report.coordination_lost {
        return Err(quit(
            logger,
            "stacked dispatch could not persist queue state",
            1,
        ));
    }
    Ok(())
}

fn render_preview(report: &Report) -> String {
    let mut line = match report.verdict {
        Verdict::Proceed => "verdict=proceed".to_string(),
        Verdict::Suppress(reason) => format!("verdict=suppressed reason={}", reason),
    };
    match (&report.resolved, report.verdict) {
        (Some(resolved), _) => line.push_str(&format!(
            " profile={} sound={} volume={}",
            resolved.profile,
            resolved.sound.display(),
            resolved.volume
        )),
        (None, Verdict::Proceed) => line.push_str(" sound=none"),
        (None, Verdict::Suppress(_)) => {}
    }
    line
}

fn run_quiet(
    store: &StateStore,
    logger: &Logger,
    span: Span,
    then: Option<String>,
) -> Result<(), Quit> {
    let now = Utc::now();
    let Some(expires_at) = now.checked_add_signed(span.as_chrono()) else {
        return Err(usage_error(format!("Quiet duration {} is too long", span)));
    };
    let update = store.update(|snapshot| {
        // A quiet period replacing an active one keeps the original stash.
        let stashed = snapshot
            .quick_disable
            .as_ref()
            .filter(|record| record.is_active(now))
            .and_then(|record| record.restore_profile.clone());
        let restore_profile = then
            .clone()
            .or(stashed)
            .or_else(|| snapshot.active_profile.clone());
        snapshot.quick_disable = Some(QuickDisable {
            expires_at,
            restore_profile,
        });
    });
    if !update.committed {
        let message = format!(
            "Failed to persist quick-disable: {}",
            update.error.as_deref().unwrap_or("unknown error")
        );
        eprintln!("{}", message);
        return Err(quit(logger, &message, 1));
    }
    logger.log_fields(
        "quick_disable set",
        &[("expires_at", &expires_at.to_rfc3339())],
    );
    println!("Quiet until {}", expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

fn run_resume(store: &StateStore, logger: &Logger) -> Result<(), Quit> {
    let update = store.update(|snapshot| {
        let record = snapshot.quick_disable.take()?;
        if let Some(profile) = record.restore_profile.clone() {
            snapshot.active_profile = Some(profile);
        }
        Some(record)
    });
    if !update.committed {
        let message = format!(
            "Failed to clear quick-disable: {}",
            update.error.as_deref().unwrap_or("unknown error")
        );
        eprintln!("{}", message);
        return Err(quit(logger, &message, 1));
    }
    match update.value {
        Some(record) => {
            let restored = record.restore_profile.unwrap_or_default();
            logger.log_fields("quick_disable cleared", &[("restored", &restored)]);
            println!("Resumed notifications");
        }
        None => println!("Notifications were not paused"),
    }
    Ok(())
}

fn run_use(
    config: &Config,
    store: &StateStore,
    logger: &Logger,
    profile: &str,
) -> Result<(), Quit> {
    if !config.profiles.contains_key(profile) {
        let known = config.profiles.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(usage_error(format!(
            "Unknown profile {:?} (configured: {})",
            profile,
            if known.is_empty() { "none" } else { known.as_str() }
        )));
    }
    let update = store.update(|snapshot| {
        snapshot.active_profile = Some(profile.to_string());
    });
    if !update.committed {
        let message = format!(
            "Failed to persist active profile: {}",
            update.error.as_deref().unwrap_or("unknown error")
        );
        eprintln!("{}", message);
        return Err(quit(logger, &message, 1));
    }
    logger.log_fields("profile use", &[("profile", profile)]);
    println!("Active profile: {}", profile);
    Ok(())
}

fn run_status(store: &StateStore) -> Result<(), Quit> {
    let snapshot = store.load();
    let active = snapshot
        .quick_disable
        .as_ref()
        .is_some_and(|record| record.is_active(Utc::now()));
    let mut value = serde_json::to_value(&snapshot).map_err(|err| Quit {
        code: 1,
        reason: err.to_string(),
    })?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "quick_disable_active".to_string(),
            serde_json::Value::Bool(active),
        );
        object.insert(
            "state_path".to_string(),
            serde_json::Value::String(store.path().display().to_string()),
        );
    }
    let rendered = serde_json::to_string_pretty(&value).map_err(|err| Quit {
        code: 1,
        reason: err.to_string(),
    })?;
    println!("{}", rendered);
    Ok(())
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            eprintln!("{err}");
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    match run_with_args(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
