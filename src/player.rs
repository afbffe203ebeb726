use shell_escape::unix::escape;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PlayerConfig;
use crate::logger::Logger;
use crate::values::Volume;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Detached,
    Bounded(Duration),
    Complete(Duration),
}

pub(crate) trait Player {
    fn play(&self, path: &Path, volume: Volume, wait: Wait) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub(crate) struct CommandPlayer<'a> {
    command: String,
    args: Vec<String>,
    logger: &'a Logger,
}

impl<'a> CommandPlayer<'a> {
    pub(crate) fn from_config(config: &PlayerConfig, logger: &'a Logger) -> Self {
        let (default_command, default_args) = platform_default();
        let command = config
            .command
            .clone()
            .filter(|command| !command.trim().is_empty())
            .unwrap_or_else(|| default_command.to_string());
        let args = match &config.args {
            Some(args) => args.clone(),
            None if config.command.is_some() => vec!["{path}".to_string()],
            None => default_args.iter().map(|arg| arg.to_string()).collect(),
        };
        Self {
            command,
            args,
            logger,
        }
    }

    pub(crate) fn expand_args(&self, path: &Path, volume: Volume) -> Vec<String> {
        let path = path.display().to_string();
        let level = volume.get();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{path}", &path)
                    .replace("{volume_percent}", &format!("{}", (level * 100.0).round() as u32))
                    .replace("{volume_pa}", &format!("{}", (level * 65536.0).round() as u32))
                    .replace("{volume}", &format!("{:.2}", level))
            })
            .collect()
    }
}

impl Player for CommandPlayer<'_> {
    fn play(&self, path: &Path, volume: Volume, wait: Wait) -> Result<(), String> {
        if !path.is_file() {
            return Err(format!("sound file not found: {}", path.display()));
        }
        if !command_exists(&self.command) {
            return Err(format!("audio player not found: {}", self.command));
        }

        let args = self.expand_args(path, volume);
        self.logger.log_fields(
            "player start",
            &[("command", &render_command(&self.command, &args))],
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format!("failed to launch {}: {}", self.command, err))?;

        let (bound, kill_on_timeout) = match wait {
            Wait::Detached => return Ok(()),
            Wait::Bounded(bound) => (bound, false),
            Wait::Complete(bound) => (bound, true),
        };

        let deadline = Instant::now() + bound;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(1);
                    self.logger
                        .log_fields("player exit", &[("code", &code.to_string())]);
                    if status.success() {
                        return Ok(());
                    }
                    return Err(format!("{} exited with code {}", self.command, code));
                }
                Ok(None) => {}
                Err(err) => return Err(format!("failed to wait on {}: {}", self.command, err)),
            }
            if Instant::now() >= deadline {
                if kill_on_timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    self.logger.log_fields(
                        "player timeout",
                        &[("action", "killed"), ("after", &format!("{:?}", bound))],
                    );
                } else {
                    self.logger.log_fields(
                        "player timeout",
                        &[("action", "detached"), ("after", &format!("{:?}", bound))],
                    );
                }
                return Ok(());
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

const MACOS_PLAYER: (&str, &[&str]) = ("afplay", &["-v", "{volume}", "{path}"]);
const PULSE_PLAYER: (&str, &[&str]) = ("paplay", &["--volume={volume_pa}", "{path}"]);

fn platform_default() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "macos") {
        MACOS_PLAYER
    } else {
        PULSE_PLAYER
    }
}

pub(crate) fn render_command(command: &str, args: &[String]) -> String {
    let mut rendered = escape(command.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(escape(arg.into()).as_ref());
    }
    rendered
}

pub(crate) fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file() || path.is_symlink();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|path| {
        let full = path.join(name);
        full.is_file() || full.is_symlink()
    })
}
