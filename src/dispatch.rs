use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{DispatchConfig, DispatchMode};
use crate::event::EventKind;
use crate::logger::Logger;
use crate::player::{Player, Wait};
use crate::policy::SuppressReason;
use crate::resolve::Resolved;
use crate::state::{new_token, DrainerLease, EnqueueResult, QueuedSound};
use crate::store::StateStore;
use crate::values::Volume;

const LEASE_MARGIN_SECS: i64 = 5;
const MAX_LEASE_SECS: u64 = 366 * 86_400;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outcome {
    Played { sound: PathBuf, volume: Volume },
    Queued { depth: usize },
    Suppressed(SuppressReason),
    Failed(String),
    Skipped(String),
    DryRun,
}

impl Outcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Played { .. } => "played",
            Self::Queued { .. } => "queued",
            Self::Suppressed(_) => "suppressed",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
            Self::DryRun => "dry_run",
        }
    }

    pub(crate) fn commits(&self) -> bool {
        matches!(self, Self::Played { .. } | Self::Queued { .. })
    }

    pub(crate) fn detail(&self) -> Option<String> {
        match self {
            Self::Played { sound, volume } => {
                Some(format!("sound={} volume={}", sound.display(), volume))
            }
            Self::Queued { depth } => Some(format!("depth={}", depth)),
            Self::Failed(message) | Self::Skipped(message) => Some(message.clone()),
            Self::Suppressed(_) | Self::DryRun => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.detail()) {
            (Self::Suppressed(reason), _) => write!(f, "suppressed reason={}", reason),
            (_, Some(detail)) => write!(f, "{} {}", self.label(), detail),
            (_, None) => f.write_str(self.label()),
        }
    }
}

pub(crate) struct DispatchContext<'a> {
    pub(crate) store: &'a StateStore,
    pub(crate) config: &'a DispatchConfig,
    pub(crate) player_timeout: Duration,
    pub(crate) player: &'a dyn Player,
    pub(crate) logger: &'a Logger,
    pub(crate) interrupt: &'a AtomicBool,
}

#[derive(Debug)]
pub(crate) struct Dispatched {
    pub(crate) outcome: Outcome,
    pub(crate) coordination_lost: bool,
    pub(crate) reservation_settled: bool,
}

pub(crate) fn dispatch(
    ctx: &DispatchContext<'_>,
    kind: EventKind,
    reservation: &str,
    resolved: &Resolved,
    now: DateTime<Utc>,
) -> Dispatched {
    match ctx.config.mode {
        DispatchMode::Immediate => {
            let wait = if ctx.config.max_wait.is_zero() {
                Wait::Detached
            } else {
                Wait::Bounded(ctx.config.max_wait.as_std())
            };
            Dispatched {
                outcome: play(ctx, &resolved.sound, resolved.volume, wait),
                coordination_lost: false,
                reservation_settled: false,
            }
        }
        DispatchMode::Stacked => dispatch_stacked(ctx, kind, reservation, resolved, now),
    }
}

fn play(ctx: &DispatchContext<'_>, sound: &Path, volume: Volume, wait: Wait) -> Outcome {
    match ctx.player.play(sound, volume, wait) {
        Ok(()) => Outcome::Played {
            sound: sound.to_path_buf(),
            volume,
        },
        Err(message) => Outcome::Failed(message),
    }
}

fn dispatch_stacked(
    ctx: &DispatchContext<'_>,
    kind: EventKind,
    reservation: &str,
    resolved: &Resolved,
    now: DateTime<Utc>,
) -> Dispatched {
    let entry = QueuedSound {
        id: new_token(),
        event: kind,
        path: resolved.sound.clone(),
        volume: resolved.volume.get(),
        enqueued_at: now,
    };
    let token = new_token();
    let lease_ttl = lease_ttl(ctx);

    let enqueue = ctx.store.update(|snapshot| {
        let result = snapshot.enqueue(entry.clone(), ctx.config.max_depth, ctx.config.overflow);
        let accepted = matches!(result, EnqueueResult::Accepted { .. });
        // Committed now: a long drain can outlive the reservation TTL.
        if accepted {
            snapshot.commit(reservation, kind, now);
        }
        let elected = accepted && !snapshot.drainer_is_live(now);
        if elected {
            snapshot.queue.drainer = Some(DrainerLease {
                token: token.clone(),
                pid: std::process::id(),
                expires_at: now + lease_ttl,
            });
        }
        (result, elected)
    });

    if !enqueue.committed {
        ctx.logger.log_fields(
            "state fail_open",
            &[
                ("op", "enqueue"),
                ("error", enqueue.error.as_deref().unwrap_or("unknown")),
            ],
        );
        // Without the queue we cannot coordinate, but the user still hears it.
        let outcome = play(
            ctx,
            &resolved.sound,
            resolved.volume,
            Wait::Complete(ctx.player_timeout),
        );
        return Dispatched {
            outcome,
            coordination_lost: true,
            reservation_settled: false,
        };
    }

    let (result, elected) = enqueue.value;
    let depth = match result {
        EnqueueResult::Rejected => {
            ctx.logger.log_fields(
                "queue reject",
                &[("event", kind.as_str()), ("max_depth", &ctx.config.max_depth.to_string())],
            );
            return Dispatched {
                outcome: Outcome::Skipped("queue full".to_string()),
                coordination_lost: false,
                reservation_settled: false,
            };
        }
        EnqueueResult::Accepted { depth, dropped } => {
            if dropped > 0 {
                ctx.logger
                    .log_fields("queue drop_oldest", &[("dropped", &dropped.to_string())]);
            }
            depth
        }
    };

    if !elected {
        return Dispatched {
            outcome: Outcome::Queued { depth },
            coordination_lost: false,
            reservation_settled: true,
        };
    }

    let drained = drain(ctx, &token, &entry.id, lease_ttl);
    Dispatched {
        outcome: drained.own.unwrap_or(Outcome::Queued { depth }),
        coordination_lost: drained.coordination_lost,
        reservation_settled: true,
    }
}

fn lease_ttl(ctx: &DispatchContext<'_>) -> ChronoDuration {
    let busy = ctx
        .player_timeout
        .saturating_add(ctx.config.delay.as_std())
        .min(Duration::from_secs(MAX_LEASE_SECS));
    ChronoDuration::from_std(busy).unwrap_or(ChronoDuration::seconds(MAX_LEASE_SECS as i64))
        + ChronoDuration::seconds(LEASE_MARGIN_SECS)
}

enum Step {
    Play(QueuedSound),
    Done,
    LostLease,
}

struct Drained {
    own: Option<Outcome>,
    coordination_lost: bool,
}

fn drain(
    ctx: &DispatchContext<'_>,
    token: &str,
    own_id: &str,
    lease_ttl: ChronoDuration,
) -> Drained {
    let mut own = None;
    let mut played = 0usize;
    ctx.logger.log_fields("drain start", &[("token", token)]);

    loop {
        if ctx.interrupt.load(Ordering::SeqCst) {
            release_lease(ctx, token);
            ctx.logger.log_fields("drain interrupted", &[("played", &played.to_string())]);
            break;
        }

        let step = ctx.store.update(|snapshot| {
            let holds_lease = snapshot
                .queue
                .drainer
                .as_ref()
                .is_some_and(|lease| lease.token == token);
            if !holds_lease {
                return Step::LostLease;
            }
            match snapshot.queue.entries.pop_front() {
                Some(entry) => {
                    if let Some(lease) = snapshot.queue.drainer.as_mut() {
                        lease.expires_at = Utc::now() + lease_ttl;
                    }
                    Step::Play(entry)
                }
                None => {
                    snapshot.queue.drainer = None;
                    Step::Done
                }
            }
        });

        if !step.committed {
            // Playing an entry we could not remove would let the next drainer play it again.
            ctx.logger.log_fields(
                "state fail_open",
                &[
                    ("op", "drain"),
                    ("error", step.error.as_deref().unwrap_or("unknown")),
                ],
            );
            return Drained {
                own,
                coordination_lost: true,
            };
        }

        let entry = match step.value {
            Step::Play(entry) => entry,
            Step::Done => break,
            Step::LostLease => {
                ctx.logger.log_fields("drain lost_lease", &[("token", token)]);
                break;
            }
        };

        if played > 0 && !ctx.config.delay.is_zero() {
            thread::sleep(ctx.config.delay.as_std());
        }
        let outcome = play(
            ctx,
            &entry.path,
            Volume::new(entry.volume),
            Wait::Complete(ctx.player_timeout),
        );
        played += 1;
        ctx.logger.log_fields(
            "drain play",
            &[("event", entry.event.as_str()), ("result", &outcome.to_string())],
        );
        if entry.id == own_id {
            own = Some(outcome);
        }
    }

    ctx.logger.log_fields("drain done", &[("played", &played.to_string())]);
    Drained {
        own,
        coordination_lost: false,
    }
}

fn release_lease(ctx: &DispatchContext<'_>, token: &str) {
    ctx.store.update(|snapshot| {
        if snapshot
            .queue
            .drainer
            .as_ref()
            .is_some_and(|lease| lease.token == token)
        {
            snapshot.queue.drainer = None;
        }
    });
}
