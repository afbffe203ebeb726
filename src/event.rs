use chrono::{DateTime, Local, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::values::Volume;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum EventKind {
    Stop,
    SubagentStop,
    Permission,
    Idle,
    Error,
    SessionStart,
    SessionEnd,
    PreCompact,
}

impl EventKind {
    pub(crate) const ALL: [EventKind; 8] = [
        EventKind::Stop,
        EventKind::SubagentStop,
        EventKind::Permission,
        EventKind::Idle,
        EventKind::Error,
        EventKind::SessionStart,
        EventKind::SessionEnd,
        EventKind::PreCompact,
    ];

    pub(crate) fn parse(token: &str) -> Option<Self> {
        let normalized = token.trim().to_ascii_lowercase().replace('-', "_");
        Some(match normalized.as_str() {
            "stop" => Self::Stop,
            "subagent_stop" => Self::SubagentStop,
            "permission" => Self::Permission,
            "idle" => Self::Idle,
            "error" => Self::Error,
            "session_start" => Self::SessionStart,
            "session_end" => Self::SessionEnd,
            "pre_compact" => Self::PreCompact,
            _ => return None,
        })
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::SubagentStop => "subagent_stop",
            Self::Permission => "permission",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::PreCompact => "pre_compact",
        }
    }

    pub(crate) fn known_names() -> String {
        Self::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl TryFrom<&str> for EventKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        Self::parse(value).ok_or_else(|| {
            format!(
                "unknown event {:?} (expected one of: {})",
                value,
                Self::known_names()
            )
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        EventKind::try_from(value.as_str()).map_err(D::Error::custom)
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Event {
    pub(crate) kind: EventKind,
    pub(crate) at: DateTime<Local>,
    pub(crate) profile: Option<String>,
    pub(crate) volume: Option<Volume>,
    pub(crate) metadata: BTreeMap<String, String>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, at: DateTime<Local>) -> Self {
        Self {
            kind,
            at,
            profile: None,
            volume: None,
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn utc(&self) -> DateTime<Utc> {
        self.at.with_timezone(&Utc)
    }
}
