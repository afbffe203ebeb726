use regex::Regex;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::event::EventKind;
use crate::state::THROTTLE_TIMESTAMP_CAP;
use crate::values::{ClockTime, Span, Volume};

pub(crate) const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) enabled: bool,
    pub(crate) active_profile: String,
    pub(crate) volume: Volume,
    pub(crate) cooldown: Option<Span>,
    pub(crate) throttle: Option<ThrottleConfig>,
    pub(crate) quiet_hours: QuietHours,
    pub(crate) dispatch: DispatchConfig,
    pub(crate) player: PlayerConfig,
    pub(crate) lock_timeout: Span,
    pub(crate) state_path: Option<PathBuf>,
    pub(crate) log_path: Option<PathBuf>,
    pub(crate) base_dir: Option<PathBuf>,
    pub(crate) profiles: BTreeMap<String, Profile>,
    pub(crate) events: BTreeMap<EventKind, EventConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            active_profile: DEFAULT_PROFILE.to_string(),
            volume: Volume::default(),
            cooldown: None,
            throttle: None,
            quiet_hours: QuietHours::default(),
            dispatch: DispatchConfig::default(),
            player: PlayerConfig::default(),
            lock_timeout: Span::from_millis(300),
            state_path: None,
            log_path: None,
            base_dir: None,
            profiles: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }
}

impl Config {
    pub(crate) fn event(&self, kind: EventKind) -> Option<&EventConfig> {
        self.events.get(&kind)
    }

    pub(crate) fn cooldown_for(&self, kind: EventKind) -> Option<Span> {
        self.event(kind)
            .and_then(|event| event.cooldown)
            .or(self.cooldown)
            .filter(|span| !span.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ThrottleConfig {
    pub(crate) max_events: u32,
    pub(crate) window: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct QuietWindow {
    pub(crate) start: ClockTime,
    pub(crate) end: ClockTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct QuietHours {
    pub(crate) default: Option<QuietWindow>,
    pub(crate) weekday: Option<QuietWindow>,
    pub(crate) weekend: Option<QuietWindow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DispatchMode {
    #[default]
    Immediate,
    Stacked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OverflowPolicy {
    #[default]
    Reject,
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DispatchConfig {
    pub(crate) mode: DispatchMode,
    pub(crate) max_wait: Span,
    pub(crate) delay: Span,
    pub(crate) max_depth: usize,
    pub(crate) overflow: OverflowPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Immediate,
            max_wait: Span::default(),
            delay: Span::from_millis(500),
            max_depth: 10,
            overflow: OverflowPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PlayerConfig {
    pub(crate) command: Option<String>,
    pub(crate) args: Option<Vec<String>>,
    pub(crate) timeout: Span,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            timeout: Span::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Profile {
    pub(crate) volume: Option<Volume>,
    pub(crate) sound_dir: Option<PathBuf>,
    pub(crate) sounds: BTreeMap<EventKind, SoundSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum SoundSpec {
    One(String),
    Many(Vec<SoundCandidate>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum SoundCandidate {
    Path(String),
    Weighted { path: String, weight: f64 },
}

impl SoundSpec {
    fn expand_home(self, home: Option<&Path>) -> Self {
        let expand = |raw: String| expand_home(&raw, home).to_string_lossy().into_owned();
        match self {
            Self::One(path) => Self::One(expand(path)),
            Self::Many(candidates) => Self::Many(
                candidates
                    .into_iter()
                    .map(|candidate| match candidate {
                        SoundCandidate::Path(path) => SoundCandidate::Path(expand(path)),
                        SoundCandidate::Weighted { path, weight } => SoundCandidate::Weighted {
                            path: expand(path),
                            weight,
                        },
                    })
                    .collect(),
            ),
        }
    }
}

impl SoundCandidate {
    pub(crate) fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Weighted { path, .. } => path,
        }
    }

    pub(crate) fn weight(&self) -> f64 {
        match self {
            Self::Path(_) => 1.0,
            Self::Weighted { weight, .. } => *weight,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct EventConfig {
    pub(crate) enabled: bool,
    pub(crate) cooldown: Option<Span>,
    pub(crate) volume: Option<Volume>,
    pub(crate) filters: Vec<FilterRule>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: None,
            volume: None,
            filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FilterRule {
    pub(crate) field: String,
    #[serde(default)]
    pub(crate) matches: Option<Pattern>,
    #[serde(default)]
    pub(crate) min: Option<f64>,
    #[serde(default)]
    pub(crate) max: Option<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Pattern(Regex);

impl Pattern {
    pub(crate) fn new(raw: &str) -> Result<Self, String> {
        Regex::new(raw)
            .map(Self)
            .map_err(|err| format!("invalid pattern {:?}: {}", raw, err))
    }

    pub(crate) fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Pattern::new(&raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    #[serde(default)]
    volume: Option<Volume>,
    #[serde(default)]
    sound_dir: Option<String>,
    #[serde(default)]
    sounds: Mapping,
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn load_config(path: &Path, home: Option<&Path>) -> Result<LoadedConfig, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(LoadedConfig {
                config: Config::default(),
                warnings: Vec::new(),
            })
        }
        Err(err) => {
            return Err(format!(
                "Failed to read config {}: {}",
                path.display(),
                err
            ))
        }
    };
    let mut loaded = parse_config(&content, home)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    loaded.config.base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf);
    emit_warnings(&loaded.warnings);
    Ok(loaded)
}

pub(crate) fn parse_config(content: &str, home: Option<&Path>) -> Result<LoadedConfig, String> {
    let value: Value = serde_yaml::from_str(content).map_err(|err| err.to_string())?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => return Err("config must be a YAML mapping".to_string()),
    };

    let mut warnings = Vec::new();
    for key in unknown_top_level_keys(&mapping) {
        warnings.push(format!("unknown config key: {}", key));
    }

    let mut config = Config::default();
    if let Some(enabled) = take_field(&mapping, "enabled", &mut warnings) {
        config.enabled = enabled;
    }
    if let Some(profile) = take_field::<String>(&mapping, "active_profile", &mut warnings) {
        if profile.trim().is_empty() {
            warnings.push("active_profile must not be empty".to_string());
        } else {
            config.active_profile = profile.trim().to_string();
        }
    }
    if let Some(volume) = take_field(&mapping, "volume", &mut warnings) {
        config.volume = volume;
    }
    config.cooldown = take_field(&mapping, "cooldown", &mut warnings);
    config.throttle =
        take_field::<ThrottleConfig>(&mapping, "throttle", &mut warnings).and_then(|throttle| {
            if throttle.max_events == 0 || throttle.window.is_zero() {
                warnings.push(
                    "throttle.max_events and throttle.window must be positive; throttle disabled"
                        .to_string(),
                );
                None
            } else if throttle.max_events as usize > THROTTLE_TIMESTAMP_CAP {
                warnings.push(format!(
                    "throttle.max_events {} exceeds {}; using {}",
                    throttle.max_events, THROTTLE_TIMESTAMP_CAP, THROTTLE_TIMESTAMP_CAP
                ));
                Some(ThrottleConfig {
                    max_events: THROTTLE_TIMESTAMP_CAP as u32,
                    ..throttle
                })
            } else {
                Some(throttle)
            }
        });
    if let Some(quiet_hours) = take_field(&mapping, "quiet_hours", &mut warnings) {
        config.quiet_hours = quiet_hours;
    }
    if let Some(dispatch) = take_field(&mapping, "dispatch", &mut warnings) {
        config.dispatch = dispatch;
    }
    if let Some(player) = take_field(&mapping, "player", &mut warnings) {
        config.player = player;
    }
    if let Some(lock_timeout) = take_field(&mapping, "lock_timeout", &mut warnings) {
        config.lock_timeout = lock_timeout;
    }
    config.state_path = take_field::<String>(&mapping, "state_path", &mut warnings)
        .map(|raw| expand_home(&raw, home));
    config.log_path = take_field::<String>(&mapping, "log_path", &mut warnings)
        .map(|raw| expand_home(&raw, home));

    if let Some(profiles) = take_field::<Mapping>(&mapping, "profiles", &mut warnings) {
        for (name, value) in profiles {
            let Some(name) = name.as_str().map(str::to_string) else {
                warnings.push("profiles: profile names must be strings".to_string());
                continue;
            };
            let label = format!("profiles.{}", name);
            let Some(raw) = deserialize_value::<RawProfile>(value, &label, &mut warnings) else {
                continue;
            };
            let profile = convert_profile(raw, &label, home, &mut warnings);
            config.profiles.insert(name, profile);
        }
    }

    if let Some(events) = take_field::<Mapping>(&mapping, "events", &mut warnings) {
        for (name, value) in events {
            let Some(kind) = name.as_str().and_then(EventKind::parse) else {
                warnings.push(format!(
                    "events: unknown event {:?} ignored",
                    name.as_str().unwrap_or("<non-string>")
                ));
                continue;
            };
            let label = format!("events.{}", kind);
            if value.is_null() {
                config.events.insert(kind, EventConfig::default());
                continue;
            }
            if let Some(event) = deserialize_value::<EventConfig>(value, &label, &mut warnings) {
                config.events.insert(kind, event);
            }
        }
    }

    Ok(LoadedConfig { config, warnings })
}

fn convert_profile(
    raw: RawProfile,
    label: &str,
    home: Option<&Path>,
    warnings: &mut Vec<String>,
) -> Profile {
    let mut sounds = BTreeMap::new();
    for (event, value) in raw.sounds {
        let Some(kind) = event.as_str().and_then(EventKind::parse) else {
            warnings.push(format!(
                "{}.sounds: unknown event {:?} ignored",
                label,
                event.as_str().unwrap_or("<non-string>")
            ));
            continue;
        };
        let sound_label = format!("{}.sounds.{}", label, kind);
        if let Some(spec) = deserialize_value::<SoundSpec>(value, &sound_label, warnings) {
            sounds.insert(kind, spec.expand_home(home));
        }
    }
    Profile {
        volume: raw.volume,
        sound_dir: raw.sound_dir.map(|dir| expand_home(&dir, home)),
        sounds,
    }
}

fn take_field<T: DeserializeOwned>(
    mapping: &Mapping,
    key_name: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    let key = Value::String(key_name.to_string());
    match mapping.get(&key) {
        None | Some(Value::Null) => None,
        Some(value) => deserialize_value(value.clone(), key_name, warnings),
    }
}

fn deserialize_value<T: DeserializeOwned>(
    value: Value,
    label: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    match serde_path_to_error::deserialize::<_, T>(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            let inner = err.path().to_string();
            let location = if inner.is_empty() || inner == "." {
                label.to_string()
            } else {
                format!("{}.{}", label, inner)
            };
            warnings.push(format!(
                "invalid value at {}: {}; using default",
                location,
                err.inner()
            ));
            None
        }
    }
}

fn emit_warnings(warnings: &[String]) {
    let mut stderr = std::io::stderr().lock();
    for warning in warnings {
        let _ = writeln!(stderr, "Warning: {}", warning);
    }
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    let allowed = [
        "enabled",
        "active_profile",
        "volume",
        "cooldown",
        "throttle",
        "quiet_hours",
        "dispatch",
        "player",
        "lock_timeout",
        "state_path",
        "log_path",
        "profiles",
        "events",
    ];

    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !allowed.contains(&key.as_str()))
        .collect()
}

pub(crate) fn expand_home(raw: &str, home: Option<&Path>) -> PathBuf {
    match (raw.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if raw == "~" => home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(raw)),
        _ => PathBuf::from(raw),
    }
}
