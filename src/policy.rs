use chrono::{Datelike, NaiveTime, Weekday};
use std::fmt;

use crate::config::{Config, FilterRule, QuietHours, QuietWindow};
use crate::event::Event;
use crate::state::{StateSnapshot, CLOCK_SKEW_TOLERANCE_SECS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SuppressReason {
    Disabled,
    QuickDisable,
    QuietHours,
    Cooldown,
    Throttled,
    Filtered,
}

impl SuppressReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::QuickDisable => "quick_disable",
            Self::QuietHours => "quiet_hours",
            Self::Cooldown => "cooldown",
            Self::Throttled => "throttled",
            Self::Filtered => "filtered",
        }
    }
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Proceed,
    Suppress(SuppressReason),
}

impl Verdict {
    pub(crate) fn is_proceed(self) -> bool {
        matches!(self, Self::Proceed)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PolicyInput<'a> {
    pub(crate) config: &'a Config,
    pub(crate) snapshot: &'a StateSnapshot,
    pub(crate) event: &'a Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Gate {
    Enabled,
    QuickDisable,
    QuietHours,
    Cooldown,
    Throttle,
    Filter,
}

pub(crate) const CHAIN: [Gate; 6] = [
    Gate::Enabled,
    Gate::QuickDisable,
    Gate::QuietHours,
    Gate::Cooldown,
    Gate::Throttle,
    Gate::Filter,
];

impl Gate {
    pub(crate) fn evaluate(self, input: &PolicyInput<'_>) -> Verdict {
        let passed = match self {
            Gate::Enabled => enabled(input),
            Gate::QuickDisable => !quick_disabled(input),
            Gate::QuietHours => !in_quiet_hours(input),
            Gate::Cooldown => !cooling_down(input),
            Gate::Throttle => !throttled(input),
            Gate::Filter => filters_pass(input),
        };
        if passed {
            Verdict::Proceed
        } else {
            Verdict::Suppress(self.reason())
        }
    }

    fn reason(self) -> SuppressReason {
        match self {
            Gate::Enabled => SuppressReason::Disabled,
            Gate::QuickDisable => SuppressReason::QuickDisable,
            Gate::QuietHours => SuppressReason::QuietHours,
            Gate::Cooldown => SuppressReason::Cooldown,
            Gate::Throttle => SuppressReason::Throttled,
            Gate::Filter => SuppressReason::Filtered,
        }
    }
}

pub(crate) fn evaluate_chain(config: &Config, snapshot: &StateSnapshot, event: &Event) -> Verdict {
    let input = PolicyInput {
        config,
        snapshot,
        event,
    };
    CHAIN
        .iter()
        .map(|gate| gate.evaluate(&input))
        .find(|verdict| !verdict.is_proceed())
        .unwrap_or(Verdict::Proceed)
}

fn enabled(input: &PolicyInput<'_>) -> bool {
    input.config.enabled
        && input
            .config
            .event(input.event.kind)
            .map_or(true, |event| event.enabled)
}

fn quick_disabled(input: &PolicyInput<'_>) -> bool {
    input
        .snapshot
        .quick_disable
        .as_ref()
        .is_some_and(|record| record.is_active(input.event.utc()))
}

fn in_quiet_hours(input: &PolicyInput<'_>) -> bool {
    let local = input.event.at.naive_local();
    window_for(&input.config.quiet_hours, local.weekday())
        .is_some_and(|window| window_contains(window, local.time()))
}

pub(crate) fn window_for(hours: &QuietHours, weekday: Weekday) -> Option<&QuietWindow> {
    let specific = match weekday {
        Weekday::Sat | Weekday::Sun => hours.weekend.as_ref(),
        _ => hours.weekday.as_ref(),
    };
    specific.or(hours.default.as_ref())
}

/// `[start, end)`, wrapping past midnight when `start > end`. Equal bounds
/// mean the whole day is quiet.
pub(crate) fn window_contains(window: &QuietWindow, time: NaiveTime) -> bool {
    let start = window.start.time();
    let end = window.end.time();
    if start == end {
        return true;
    }
    if start < end {
        time >= start && time < end
    } else {
        time >= start || time < end
    }
}

fn cooling_down(input: &PolicyInput<'_>) -> bool {
    let Some(cooldown) = input.config.cooldown_for(input.event.kind) else {
        return false;
    };
    let Some(last) = input.snapshot.last_activity(input.event.kind) else {
        return false;
    };
    let elapsed = input.event.utc() - last;
    if elapsed < chrono::Duration::zero() {
        // Slightly ahead: a concurrent invocation stamped it. Far ahead: the clock moved.
        return -elapsed <= chrono::Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
    }
    elapsed < cooldown.as_chrono()
}

fn throttled(input: &PolicyInput<'_>) -> bool {
    let Some(throttle) = input.config.throttle.as_ref() else {
        return false;
    };
    let count = input
        .snapshot
        .throttle_count(input.event.utc(), throttle.window.as_chrono());
    count >= throttle.max_events as usize
}

fn filters_pass(input: &PolicyInput<'_>) -> bool {
    let Some(event) = input.config.event(input.event.kind) else {
        return true;
    };
    event
        .filters
        .iter()
        .all(|rule| rule_passes(rule, input.event.metadata.get(&rule.field)))
}

pub(crate) fn rule_passes(rule: &FilterRule, value: Option<&String>) -> bool {
    let Some(value) = value else {
        return true;
    };
    if let Some(pattern) = &rule.matches {
        if !pattern.is_match(value) {
            return false;
        }
    }
    if rule.min.is_none() && rule.max.is_none() {
        return true;
    }
    let Ok(number) = value.trim().parse::<f64>() else {
        return false;
    };
    rule.min.map_or(true, |min| number >= min) && rule.max.map_or(true, |max| number <= max)
}
