use chrono::NaiveTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Longest accepted span (100 years). Keeps every `DateTime` offset in range.
const MAX_SPAN_SECS: u64 = 100 * 365 * 86_400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct Span(Duration);

impl Span {
    const MAX: Span = Span(Duration::from_secs(MAX_SPAN_SECS));

    pub(crate) fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub(crate) fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("duration must not be empty".to_string());
        }
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {:?}", raw))?;
        let millis = match unit.trim() {
            "" | "s" => value.checked_mul(1_000),
            "ms" => Some(value),
            "m" => value.checked_mul(60_000),
            "h" => value.checked_mul(3_600_000),
            "d" => value.checked_mul(86_400_000),
            other => {
                return Err(format!(
                    "invalid duration unit {:?} in {:?} (expected ms, s, m, h or d)",
                    other, raw
                ))
            }
        };
        millis
            .map(Self::from_millis)
            .filter(|span| *span <= Self::MAX)
            .ok_or_else(|| {
                format!(
                    "duration {:?} is too large (at most {}d)",
                    raw,
                    MAX_SPAN_SECS / 86_400
                )
            })
    }

    fn from_secs_checked(secs: u64) -> Result<Self, String> {
        if secs > MAX_SPAN_SECS {
            return Err(format!(
                "duration {}s is too large (at most {}d)",
                secs,
                MAX_SPAN_SECS / 86_400
            ));
        }
        Ok(Self::from_secs(secs))
    }

    pub(crate) fn as_std(self) -> Duration {
        self.0
    }

    pub(crate) fn as_chrono(self) -> chrono::Duration {
        let millis = self.min(Self::MAX).0.as_millis();
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub(crate) fn is_zero(self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1_000 != 0 {
            write!(f, "{}ms", millis)
        } else {
            write!(f, "{}s", millis / 1_000)
        }
    }
}

impl<'de> Deserialize<'de> for Span {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Span::from_secs_checked(secs).map_err(D::Error::custom),
            Raw::Text(text) => Span::parse(&text).map_err(D::Error::custom),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct Volume(f32);

impl Volume {
    pub(crate) const FULL: Volume = Volume(1.0);

    pub(crate) fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self::FULL;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if let Some(percent) = trimmed.strip_suffix('%') {
            let value: f32 = percent
                .trim()
                .parse()
                .map_err(|_| format!("invalid volume {:?}", raw))?;
            return Ok(Self::new(value / 100.0));
        }
        let value: f32 = trimmed
            .parse()
            .map_err(|_| format!("invalid volume {:?}", raw))?;
        if value.is_nan() {
            return Err(format!("invalid volume {:?}", raw));
        }
        Ok(Self::new(value))
    }

    pub(crate) fn get(self) -> f32 {
        self.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self(0.7)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl<'de> Deserialize<'de> for Volume {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Volume::new(value)),
            Raw::Text(text) => Volume::parse(&text).map_err(D::Error::custom),
        }
    }
}

impl Serialize for Volume {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f32(self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ClockTime(NaiveTime);

impl ClockTime {
    pub(crate) fn parse(raw: &str) -> Result<Self, String> {
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| format!("invalid time of day {:?} (expected HH:MM)", raw))
    }

    pub(crate) fn time(self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        ClockTime::parse(&value).map_err(D::Error::custom)
    }
}
