use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use crate::config::{OverflowPolicy, ThrottleConfig};
use crate::event::EventKind;

pub(crate) const STATE_VERSION: u32 = 1;
/// Reservations left behind by an invocation that died mid-dispatch stop
/// counting after this long.
pub(crate) const RESERVATION_TTL_SECS: i64 = 120;
pub(crate) const HISTORY_LIMIT: usize = 50;
pub(crate) const THROTTLE_TIMESTAMP_CAP: usize = 1_000;
/// Stamps at most this far ahead of `now` come from concurrent invocations.
/// Anything further ahead was written before the clock moved back.
pub(crate) const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct StateSnapshot {
    pub(crate) version: u32,
    pub(crate) cooldowns: BTreeMap<String, DateTime<Utc>>,
    pub(crate) throttle: ThrottleWindow,
    pub(crate) reservations: Vec<Reservation>,
    pub(crate) quick_disable: Option<QuickDisable>,
    pub(crate) active_profile: Option<String>,
    pub(crate) queue: PlaybackQueue,
    pub(crate) history: VecDeque<OutcomeRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cooldowns: BTreeMap::new(),
            throttle: ThrottleWindow::default(),
            reservations: Vec::new(),
            quick_disable: None,
            active_profile: None,
            queue: PlaybackQueue::default(),
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ThrottleWindow {
    pub(crate) recent: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Reservation {
    pub(crate) id: String,
    pub(crate) event: EventKind,
    pub(crate) at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuickDisable {
    pub(crate) expires_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) restore_profile: Option<String>,
}

impl QuickDisable {
    pub(crate) fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PlaybackQueue {
    pub(crate) entries: VecDeque<QueuedSound>,
    pub(crate) drainer: Option<DrainerLease>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QueuedSound {
    pub(crate) id: String,
    pub(crate) event: EventKind,
    pub(crate) path: PathBuf,
    pub(crate) volume: f32,
    pub(crate) enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DrainerLease {
    pub(crate) token: String,
    pub(crate) pid: u32,
    pub(crate) expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OutcomeRecord {
    pub(crate) at: DateTime<Utc>,
    pub(crate) event: EventKind,
    pub(crate) result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) detail: Option<String>,
}

pub(crate) fn new_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueResult {
    Accepted { depth: usize, dropped: usize },
    Rejected,
}

impl StateSnapshot {
    pub(crate) fn prune(&mut self, now: DateTime<Utc>, throttle: Option<&ThrottleConfig>) {
        let horizon = now + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
        match throttle {
            Some(throttle) => {
                let cutoff = now - throttle.window.as_chrono();
                self.throttle.recent.retain(|at| *at > cutoff && *at <= horizon);
                let cap = (throttle.max_events as usize).min(THROTTLE_TIMESTAMP_CAP);
                if self.throttle.recent.len() > cap {
                    let excess = self.throttle.recent.len() - cap;
                    self.throttle.recent.drain(..excess);
                }
            }
            None => self.throttle.recent.clear(),
        }
        let stale = now - Duration::seconds(RESERVATION_TTL_SECS);
        self.reservations.retain(|r| r.at > stale && r.at <= horizon);
    }

    pub(crate) fn last_activity(&self, kind: EventKind) -> Option<DateTime<Utc>> {
        let played = self.cooldowns.get(kind.as_str()).copied();
        let reserved = self
            .reservations
            .iter()
            .filter(|r| r.event == kind)
            .map(|r| r.at)
            .max();
        played.max(reserved)
    }

    pub(crate) fn throttle_count(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        let horizon = now + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
        let in_window = |at: &DateTime<Utc>| *at > cutoff && *at <= horizon;
        self.throttle.recent.iter().filter(|at| in_window(at)).count()
            + self
                .reservations
                .iter()
                .filter(|r| in_window(&r.at))
                .count()
    }

    pub(crate) fn reserve(&mut self, id: String, kind: EventKind, now: DateTime<Utc>) {
        self.reservations.push(Reservation {
            id,
            event: kind,
            at: now,
        });
    }

    pub(crate) fn commit(&mut self, id: &str, kind: EventKind, now: DateTime<Utc>) {
        self.reservations.retain(|r| r.id != id);
        self.cooldowns.insert(kind.as_str().to_string(), now);
        let insert_at = self.throttle.recent.partition_point(|at| *at <= now);
        self.throttle.recent.insert(insert_at, now);
    }

    pub(crate) fn rollback(&mut self, id: &str) {
        self.reservations.retain(|r| r.id != id);
    }

    pub(crate) fn take_expired_quick_disable(
        &mut self,
        now: DateTime<Utc>,
    ) -> Option<Option<String>> {
        let expired = self
            .quick_disable
            .as_ref()
            .is_some_and(|record| !record.is_active(now));
        if !expired {
            return None;
        }
        let restore = self.quick_disable.take().and_then(|q| q.restore_profile);
        if restore.is_some() {
            self.active_profile = restore.clone();
        }
        Some(restore)
    }

    pub(crate) fn enqueue(
        &mut self,
        sound: QueuedSound,
        max_depth: usize,
        overflow: OverflowPolicy,
    ) -> EnqueueResult {
        let max_depth = max_depth.max(1);
        let mut dropped = 0;
        while self.queue.entries.len() >= max_depth {
            match overflow {
                OverflowPolicy::Reject => return EnqueueResult::Rejected,
                OverflowPolicy::DropOldest => {
                    self.queue.entries.pop_front();
                    dropped += 1;
                }
            }
        }
        self.queue.entries.push_back(sound);
        EnqueueResult::Accepted {
            depth: self.queue.entries.len(),
            dropped,
        }
    }

    pub(crate) fn drainer_is_live(&self, now: DateTime<Utc>) -> bool {
        self.queue
            .drainer
            .as_ref()
            .is_some_and(|lease| lease.expires_at > now)
    }

    pub(crate) fn record(&mut self, record: OutcomeRecord) {
        self.history.push_back(record);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}
