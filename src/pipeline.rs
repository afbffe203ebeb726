use rand::Rng;
use std::sync::atomic::AtomicBool;

use crate::config::Config;
use crate::dispatch::{dispatch, DispatchContext, Dispatched, Outcome};
use crate::event::Event;
use crate::logger::Logger;
use crate::player::Player;
use crate::policy::{evaluate_chain, Verdict};
use crate::resolve::{resolve, ProfileHints, Resolved};
use crate::state::{new_token, OutcomeRecord};
use crate::store::StateStore;

pub(crate) struct Pipeline<'a> {
    pub(crate) config: &'a Config,
    pub(crate) store: &'a StateStore,
    pub(crate) player: &'a dyn Player,
    pub(crate) logger: &'a Logger,
    pub(crate) interrupt: &'a AtomicBool,
}

#[derive(Debug)]
pub(crate) struct Report {
    pub(crate) verdict: Verdict,
    pub(crate) resolved: Option<Resolved>,
    pub(crate) outcome: Outcome,
    pub(crate) coordination_lost: bool,
}

struct GateDecision {
    verdict: Verdict,
    hints: ProfileHints,
}

impl Pipeline<'_> {
    pub(crate) fn notify<R: Rng>(&self, event: &Event, rng: &mut R) -> Report {
        let now = event.utc();
        let kind = event.kind;
        let reservation = new_token();

        let gate = self.store.update(|snapshot| {
            snapshot.prune(now, self.config.throttle.as_ref());
            let restoring = snapshot.take_expired_quick_disable(now).flatten();
            let verdict = evaluate_chain(self.config, snapshot, event);
            match verdict {
                Verdict::Proceed => snapshot.reserve(reservation.clone(), kind, now),
                Verdict::Suppress(reason) => snapshot.record(OutcomeRecord {
                    at: now,
                    event: kind,
                    result: "suppressed".to_string(),
                    reason: Some(reason.as_str().to_string()),
                    detail: None,
                }),
            }
            GateDecision {
                verdict,
                hints: ProfileHints {
                    restoring,
                    persisted: snapshot.active_profile.clone(),
                },
            }
        });
        if !gate.committed {
            self.log_fail_open("gate", gate.error.as_deref());
        }
        let GateDecision { verdict, hints } = gate.value;
        self.log_verdict(event, verdict);

        if let Verdict::Suppress(reason) = verdict {
            let outcome = Outcome::Suppressed(reason);
            self.log_outcome(event, &outcome);
            return Report {
                verdict,
                resolved: None,
                outcome,
                coordination_lost: false,
            };
        }

        let (resolved, dispatched) = match resolve(self.config, event, &hints, rng) {
            Ok(resolved) => {
                let ctx = DispatchContext {
                    store: self.store,
                    config: &self.config.dispatch,
                    player_timeout: self.config.player.timeout.as_std(),
                    player: self.player,
                    logger: self.logger,
                    interrupt: self.interrupt,
                };
                let dispatched = dispatch(&ctx, kind, &reservation, &resolved, now);
                (Some(resolved), dispatched)
            }
            Err(message) => {
                self.logger
                    .log_fields("resolve", &[("event", kind.as_str()), ("error", &message)]);
                let skipped = Dispatched {
                    outcome: Outcome::Skipped(message),
                    coordination_lost: false,
                    reservation_settled: false,
                };
                (None, skipped)
            }
        };
        let Dispatched {
            outcome,
            coordination_lost,
            reservation_settled,
        } = dispatched;

        let settle = self.store.update(|snapshot| {
            if !reservation_settled {
                if outcome.commits() {
                    snapshot.commit(&reservation, kind, now);
                } else {
                    snapshot.rollback(&reservation);
                }
            }
            snapshot.record(OutcomeRecord {
                at: now,
                event: kind,
                result: outcome.label().to_string(),
                reason: None,
                detail: outcome.detail(),
            });
        });
        if !settle.committed {
            self.log_fail_open("settle", settle.error.as_deref());
        }
        self.log_outcome(event, &outcome);

        Report {
            verdict,
            resolved,
            outcome,
            coordination_lost,
        }
    }

    pub(crate) fn preview<R: Rng>(&self, event: &Event, rng: &mut R) -> Report {
        let now = event.utc();
        let mut snapshot = self.store.load();
        snapshot.prune(now, self.config.throttle.as_ref());
        let restoring = snapshot.take_expired_quick_disable(now).flatten();
        let verdict = evaluate_chain(self.config, &snapshot, event);
        let hints = ProfileHints {
            restoring,
            persisted: snapshot.active_profile.clone(),
        };
        let resolved = match verdict {
            Verdict::Proceed => match resolve(self.config, event, &hints, rng) {
                Ok(resolved) => Some(resolved),
                Err(message) => {
                    self.logger
                        .log_fields("resolve", &[("event", event.kind.as_str()), ("error", &message)]);
                    None
                }
            },
            Verdict::Suppress(_) => None,
        };
        self.log_verdict(event, verdict);
        self.log_outcome(event, &Outcome::DryRun);
        Report {
            verdict,
            resolved,
            outcome: Outcome::DryRun,
            coordination_lost: false,
        }
    }

    fn log_verdict(&self, event: &Event, verdict: Verdict) {
        let (label, reason) = match verdict {
            Verdict::Proceed => ("proceed", "none"),
            Verdict::Suppress(reason) => ("suppressed", reason.as_str()),
        };
        self.logger.log_fields(
            "gate",
            &[
                ("event", event.kind.as_str()),
                ("verdict", label),
                ("reason", reason),
            ],
        );
    }

    fn log_outcome(&self, event: &Event, outcome: &Outcome) {
        let detail = outcome.detail().unwrap_or_default();
        let mut fields = vec![("event", event.kind.as_str()), ("result", outcome.label())];
        if let Outcome::Suppressed(reason) = outcome {
            fields.push(("reason", reason.as_str()));
        }
        if !detail.is_empty() {
            fields.push(("detail", detail.as_str()));
        }
        self.logger.log_fields("outcome", &fields);
    }

    fn log_fail_open(&self, op: &str, error: Option<&str>) {
        self.logger.log_fields(
            "state fail_open",
            &[("op", op), ("error", error.unwrap_or("unknown"))],
        );
    }
}
