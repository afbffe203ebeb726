use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use crate::app::{main_with_args, quit, run_with_args};
use crate::config::{Config, DispatchMode, Profile, SoundSpec, ThrottleConfig};
use crate::dispatch::Outcome;
use crate::event::{Event, EventKind};
use crate::logger::Logger;
use crate::pipeline::Pipeline;
use crate::player::{Player, Wait};
use crate::policy::{SuppressReason, Verdict};
use crate::state::{DrainerLease, QuickDisable};
use crate::store::StateStore;
use crate::values::{Span, Volume};

static STDERR_MUTEX: Mutex<()> = Mutex::new(());

#[cfg(unix)]
fn capture_stderr<F: FnOnce()>(f: F) -> String {
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::os::raw::c_int;

    extern "C" {
        fn pipe(fds: *mut c_int) -> c_int;
        fn dup(fd: c_int) -> c_int;
        fn dup2(oldfd: c_int, newfd: c_int) -> c_int;
        fn close(fd: c_int) -> c_int;
    }

    unsafe {
        let mut fds = [0 as c_int; 2];
        if pipe(fds.as_mut_ptr()) != 0 {
            panic!("pipe failed");
        }
        let read_fd = fds[0];
        let write_fd = fds[1];

        let stderr_fd = std::io::stderr().as_raw_fd();
        let saved_stderr_fd = dup(stderr_fd);
        if saved_stderr_fd < 0 {
            let _ = close(read_fd);
            let _ = close(write_fd);
            panic!("dup stderr failed");
        }

        if dup2(write_fd, stderr_fd) < 0 {
            let _ = close(saved_stderr_fd);
            let _ = close(read_fd);
            let _ = close(write_fd);
            panic!("dup2 stderr failed");
        }
        let _ = close(write_fd);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

        if dup2(saved_stderr_fd, stderr_fd) < 0 {
            let _ = close(saved_stderr_fd);
            let _ = close(read_fd);
            panic!("dup2 restore stderr failed");
        }
        let _ = close(saved_stderr_fd);

        let mut output = Vec::new();
        let mut reader = std::fs::File::from_raw_fd(read_fd);
        reader.read_to_end(&mut output).expect("read stderr");
        let output = String::from_utf8_lossy(&output).into_owned();

        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }

        output
    }
}

#[derive(Default)]
struct FakePlayer {
    played: Mutex<Vec<PathBuf>>,
    fail: bool,
}

impl FakePlayer {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn played(&self) -> Vec<PathBuf> {
        self.played.lock().unwrap().clone()
    }
}

impl Player for FakePlayer {
    fn play(&self, path: &Path, _volume: Volume, _wait: Wait) -> Result<(), String> {
        self.played.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            Err("no audio device".to_string())
        } else {
            Ok(())
        }
    }
}

fn profile_in(dir: &str) -> Profile {
    let sounds = EventKind::ALL
        .into_iter()
        .map(|kind| (kind, SoundSpec::One(format!("{}.wav", kind))))
        .collect::<BTreeMap<_, _>>();
    Profile {
        volume: None,
        sound_dir: Some(PathBuf::from(dir)),
        sounds,
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    config
        .profiles
        .insert("default".to_string(), profile_in("/sounds/default"));
    config
}

fn store_in(temp: &TempDir) -> StateStore {
    StateStore::new(temp.path().join("state.json"), Duration::from_secs(5))
}

fn at(secs: i64) -> DateTime<Local> {
    Local.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn utc(secs: i64) -> DateTime<Utc> {
    at(secs).with_timezone(&Utc)
}

fn notify(config: &Config, store: &StateStore, player: &dyn Player, event: &Event) -> Outcome {
    let logger = Logger::disabled();
    let interrupt = AtomicBool::new(false);
    let pipeline = Pipeline {
        config,
        store,
        player,
        logger: &logger,
        interrupt: &interrupt,
    };
    pipeline.notify(event, &mut StdRng::seed_from_u64(9)).outcome
}

fn args(values: &[&str]) -> Vec<OsString> {
    std::iter::once("chimer")
        .chain(values.iter().copied())
        .map(OsString::from)
        .collect()
}

#[test]
fn cooldown_scenario_plays_suppresses_then_plays_again() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.cooldown = Some(Span::from_secs(60));

    let first = notify(&config, &store, &player, &Event::new(EventKind::Idle, at(0)));
    let second = notify(&config, &store, &player, &Event::new(EventKind::Idle, at(30)));
    let third = notify(&config, &store, &player, &Event::new(EventKind::Idle, at(65)));

    assert!(matches!(first, Outcome::Played { .. }), "{first:?}");
    assert_eq!(second, Outcome::Suppressed(SuppressReason::Cooldown));
    assert!(matches!(third, Outcome::Played { .. }), "{third:?}");
    assert_eq!(player.played().len(), 2);

    let snapshot = store.load();
    assert_eq!(snapshot.cooldowns["idle"], utc(65));
    assert!(snapshot.reservations.is_empty());
    let results: Vec<&str> = snapshot.history.iter().map(|r| r.result.as_str()).collect();
    assert_eq!(results, vec!["played", "suppressed", "played"]);
    assert_eq!(snapshot.history[1].reason.as_deref(), Some("cooldown"));
}

#[test]
fn first_event_of_each_type_is_never_cooled_down() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.cooldown = Some(Span::from_secs(3600));

    for kind in EventKind::ALL {
        let outcome = notify(&config, &store, &player, &Event::new(kind, at(0)));
        assert!(matches!(outcome, Outcome::Played { .. }), "{kind}: {outcome:?}");
    }
}

#[test]
fn quick_disable_suppresses_until_expiry_then_restores_profile() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config
        .profiles
        .insert("night".to_string(), profile_in("/sounds/night"));
    store.update(|snapshot| {
        snapshot.quick_disable = Some(QuickDisable {
            expires_at: utc(60),
            restore_profile: Some("night".to_string()),
        });
    });

    let muted = notify(&config, &store, &player, &Event::new(EventKind::Stop, at(30)));
    assert_eq!(muted, Outcome::Suppressed(SuppressReason::QuickDisable));

    let resumed = notify(&config, &store, &player, &Event::new(EventKind::Stop, at(60)));
    assert_eq!(
        resumed,
        Outcome::Played {
            sound: PathBuf::from("/sounds/night/stop.wav"),
            volume: Volume::default(),
        }
    );
    let snapshot = store.load();
    assert!(snapshot.quick_disable.is_none());
    assert_eq!(snapshot.active_profile.as_deref(), Some("night"));

    // The restored profile sticks for later invocations too.
    let later = notify(&config, &store, &player, &Event::new(EventKind::Idle, at(90)));
    assert!(matches!(
        later,
        Outcome::Played { ref sound, .. } if sound == Path::new("/sounds/night/idle.wav")
    ));
}

#[test]
fn throttle_allows_n_then_suppresses_until_the_window_rolls() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.throttle = Some(ThrottleConfig {
        max_events: 2,
        window: Span::from_secs(60),
    });

    let outcomes: Vec<Outcome> = [0, 10, 20, 61]
        .into_iter()
        .map(|secs| notify(&config, &store, &player, &Event::new(EventKind::Stop, at(secs))))
        .collect();

    assert!(matches!(outcomes[0], Outcome::Played { .. }));
    assert!(matches!(outcomes[1], Outcome::Played { .. }));
    assert_eq!(outcomes[2], Outcome::Suppressed(SuppressReason::Throttled));
    assert!(matches!(outcomes[3], Outcome::Played { .. }));
}

#[test]
fn concurrent_invocations_never_exceed_the_throttle() {
    let temp = TempDir::new().expect("temp dir");
    let state_path = temp.path().join("state.json");
    let mut config = base_config();
    config.throttle = Some(ThrottleConfig {
        max_events: 3,
        window: Span::from_secs(600),
    });
    let config = Arc::new(config);

    let threads = 10;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let config = Arc::clone(&config);
            let barrier = Arc::clone(&barrier);
            let state_path = state_path.clone();
            thread::spawn(move || {
                let store = StateStore::new(state_path, Duration::from_secs(10));
                let player = FakePlayer::default();
                barrier.wait();
                notify(
                    &config,
                    &store,
                    &player,
                    &Event::new(EventKind::Idle, Local::now()),
                )
            })
        })
        .collect();
    let outcomes: Vec<Outcome> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();

    let played = outcomes.iter().filter(|o| o.commits()).count();
    let throttled = outcomes
        .iter()
        .filter(|o| **o == Outcome::Suppressed(SuppressReason::Throttled))
        .count();
    assert_eq!(played, 3, "{outcomes:?}");
    assert_eq!(throttled, threads - 3, "{outcomes:?}");

    let snapshot = StateStore::new(state_path, Duration::from_secs(1)).load();
    assert_eq!(snapshot.throttle.recent.len(), 3);
    assert!(snapshot.reservations.is_empty());
}

#[test]
fn playback_failure_rolls_back_so_the_next_event_is_not_cooled_down() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let mut config = base_config();
    config.cooldown = Some(Span::from_secs(60));

    let failed = notify(
        &config,
        &store,
        &FakePlayer::failing(),
        &Event::new(EventKind::Error, at(0)),
    );
    assert_eq!(failed, Outcome::Failed("no audio device".to_string()));
    let snapshot = store.load();
    assert!(snapshot.cooldowns.is_empty());
    assert!(snapshot.reservations.is_empty());
    assert_eq!(snapshot.history.back().unwrap().result, "failed");

    let retried = notify(
        &config,
        &store,
        &FakePlayer::default(),
        &Event::new(EventKind::Error, at(5)),
    );
    assert!(matches!(retried, Outcome::Played { .. }), "{retried:?}");
}

#[test]
fn missing_sound_is_skipped_and_releases_the_reservation() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.cooldown = Some(Span::from_secs(60));
    if let Some(profile) = config.profiles.get_mut("default") {
        profile.sounds.remove(&EventKind::PreCompact);
    }

    let outcome = notify(
        &config,
        &store,
        &player,
        &Event::new(EventKind::PreCompact, at(0)),
    );

    assert!(matches!(outcome, Outcome::Skipped(ref m) if m.contains("pre_compact")));
    assert!(player.played().is_empty());
    let snapshot = store.load();
    assert!(snapshot.reservations.is_empty());
    assert!(!snapshot.cooldowns.contains_key("pre_compact"));
}

#[test]
fn cli_profile_and_volume_override_state_and_config() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config
        .profiles
        .insert("focus".to_string(), profile_in("/sounds/focus"));
    store.update(|snapshot| snapshot.active_profile = Some("default".to_string()));

    let mut event = Event::new(EventKind::Permission, at(0));
    event.profile = Some("focus".to_string());
    event.volume = Some(Volume::new(0.2));

    assert_eq!(
        notify(&config, &store, &player, &event),
        Outcome::Played {
            sound: PathBuf::from("/sounds/focus/permission.wav"),
            volume: Volume::new(0.2),
        }
    );
}

#[test]
fn dry_run_is_deterministic_and_leaves_state_untouched() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let logger = Logger::disabled();
    let interrupt = AtomicBool::new(false);
    let mut config = base_config();
    config.cooldown = Some(Span::from_secs(60));
    store.update(|snapshot| {
        snapshot.cooldowns.insert("stop".to_string(), utc(0));
    });
    let before = fs::read(store.path()).expect("state");

    let pipeline = Pipeline {
        config: &config,
        store: &store,
        player: &player,
        logger: &logger,
        interrupt: &interrupt,
    };
    let event = Event::new(EventKind::Stop, at(20));
    let verdicts: Vec<Verdict> = (0..5)
        .map(|seed| {
            pipeline
                .preview(&event, &mut StdRng::seed_from_u64(seed))
                .verdict
        })
        .collect();

    assert!(verdicts
        .iter()
        .all(|v| *v == Verdict::Suppress(SuppressReason::Cooldown)));
    assert!(player.played().is_empty());
    assert_eq!(fs::read(store.path()).expect("state"), before);

    let later = pipeline.preview(&Event::new(EventKind::Stop, at(90)), &mut StdRng::seed_from_u64(1));
    assert_eq!(later.verdict, Verdict::Proceed);
    assert_eq!(later.outcome, Outcome::DryRun);
    assert_eq!(
        later.resolved.map(|r| r.sound),
        Some(PathBuf::from("/sounds/default/stop.wav"))
    );
}

#[test]
fn stacked_mode_behind_a_live_drainer_queues_and_commits() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.dispatch.mode = DispatchMode::Stacked;
    config.cooldown = Some(Span::from_secs(60));
    store.update(|snapshot| {
        snapshot.queue.drainer = Some(DrainerLease {
            token: "other".to_string(),
            pid: 1,
            expires_at: utc(0) + ChronoDuration::seconds(30),
        });
    });

    let outcome = notify(&config, &store, &player, &Event::new(EventKind::Stop, at(0)));

    assert_eq!(outcome, Outcome::Queued { depth: 1 });
    assert!(player.played().is_empty());
    let snapshot = store.load();
    assert_eq!(snapshot.queue.entries.len(), 1);
    assert_eq!(snapshot.cooldowns["stop"], utc(0));
}

#[test]
fn stacked_mode_drains_everything_when_it_becomes_the_drainer() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.dispatch.mode = DispatchMode::Stacked;
    config.dispatch.delay = Span::from_millis(1);

    for (secs, kind) in [(0, EventKind::Stop), (1, EventKind::Idle)] {
        let outcome = notify(&config, &store, &player, &Event::new(kind, at(secs)));
        assert!(matches!(outcome, Outcome::Played { .. }), "{outcome:?}");
    }

    assert_eq!(
        player.played(),
        vec![
            PathBuf::from("/sounds/default/stop.wav"),
            PathBuf::from("/sounds/default/idle.wav"),
        ]
    );
    let snapshot = store.load();
    assert!(snapshot.queue.entries.is_empty());
    assert!(snapshot.queue.drainer.is_none());
}

// Fires a second `stop` from inside the drainer's first playback.
struct ReentrantPlayer<'a> {
    config: &'a Config,
    store: &'a StateStore,
    nested_at: DateTime<Local>,
    nested: Mutex<Option<Outcome>>,
}

impl Player for ReentrantPlayer<'_> {
    fn play(&self, _path: &Path, _volume: Volume, _wait: Wait) -> Result<(), String> {
        let mut nested = self.nested.lock().unwrap();
        if nested.is_none() {
            let inner = FakePlayer::default();
            let event = Event::new(EventKind::Stop, self.nested_at);
            *nested = Some(notify(self.config, self.store, &inner, &event));
        }
        Ok(())
    }
}

#[test]
fn long_drain_keeps_the_drainers_cooldown_after_reservations_expire() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let mut config = base_config();
    config.dispatch.mode = DispatchMode::Stacked;
    config.cooldown = Some(Span::from_secs(600));
    let player = ReentrantPlayer {
        config: &config,
        store: &store,
        nested_at: at(121),
        nested: Mutex::new(None),
    };

    let outcome = notify(&config, &store, &player, &Event::new(EventKind::Stop, at(0)));

    assert!(matches!(outcome, Outcome::Played { .. }), "{outcome:?}");
    assert_eq!(
        *player.nested.lock().unwrap(),
        Some(Outcome::Suppressed(SuppressReason::Cooldown))
    );
    let snapshot = store.load();
    assert_eq!(snapshot.cooldowns["stop"], utc(0));
    let results: Vec<&str> = snapshot.history.iter().map(|r| r.result.as_str()).collect();
    assert_eq!(results, vec!["suppressed", "played"]);
}

#[test]
fn oversized_throttle_window_does_not_overflow_the_clock() {
    let temp = TempDir::new().expect("temp dir");
    let store = store_in(&temp);
    let player = FakePlayer::default();
    let mut config = base_config();
    config.throttle = Some(ThrottleConfig {
        max_events: 1,
        window: Span::from_secs(u64::MAX / 4),
    });

    let first = notify(&config, &store, &player, &Event::new(EventKind::Stop, at(0)));
    let second = notify(&config, &store, &player, &Event::new(EventKind::Idle, at(10)));

    assert!(matches!(first, Outcome::Played { .. }), "{first:?}");
    assert_eq!(second, Outcome::Suppressed(SuppressReason::Throttled));
}

#[test]
fn run_with_args_returns_quit_on_cli_parse_failure() {
    let quit = run_with_args(args(&["--definitely-not-a-flag"])).expect_err("parse error");
    assert_eq!(quit.reason, "cli_parse");
    assert!(quit.code > 0);
}

#[test]
fn malformed_meta_and_unknown_events_are_usage_errors() {
    let temp = TempDir::new().expect("temp dir");
    let state = temp.path().join("state.json");
    let config = temp.path().join("missing.yml");
    let common = [
        "-c",
        config.to_str().unwrap(),
        "--state",
        state.to_str().unwrap(),
    ];

    let mut bad_meta = common.to_vec();
    bad_meta.extend(["notify", "stop", "--meta", "novalue", "--dry-run"]);
    let quit = run_with_args(args(&bad_meta)).expect_err("bad meta");
    assert_eq!(quit.code, 1);
    assert!(quit.reason.contains("KEY=VALUE"), "{}", quit.reason);

    let mut bad_event = common.to_vec();
    bad_event.extend(["notify", "lunch", "--dry-run"]);
    let quit = run_with_args(args(&bad_event)).expect_err("bad event");
    assert_eq!(quit.code, 1);
    assert!(quit.reason.contains("unknown event"), "{}", quit.reason);
    assert!(!state.exists());
}

#[test]
fn quiet_resume_and_use_round_trip_through_state() {
    let temp = TempDir::new().expect("temp dir");
    let state = temp.path().join("nested").join("state.json");
    let config = temp.path().join("chimer.yml");
    fs::write(
        &config,
        "profiles:\n  default:\n    sounds:\n      stop: stop.wav\n  loud:\n    sounds:\n      stop: loud.wav\n",
    )
    .expect("write config");
    let common = [
        "-c",
        config.to_str().unwrap(),
        "--state",
        state.to_str().unwrap(),
    ];
    let with = |extra: &[&str]| {
        let mut all = common.to_vec();
        all.extend_from_slice(extra);
        args(&all)
    };

    run_with_args(with(&["use", "loud"])).expect("use");
    let store = StateStore::new(state.clone(), Duration::from_secs(1));
    assert_eq!(store.load().active_profile.as_deref(), Some("loud"));

    let quit = run_with_args(with(&["use", "nope"])).expect_err("unknown profile");
    assert_eq!(quit.code, 1);

    run_with_args(with(&["quiet", "30m", "--then", "default"])).expect("quiet");
    let record = store.load().quick_disable.expect("quick disable");
    assert!(record.is_active(Utc::now()));
    assert!(record.expires_at > Utc::now() + ChronoDuration::minutes(29));
    assert_eq!(record.restore_profile.as_deref(), Some("default"));

    run_with_args(with(&["resume"])).expect("resume");
    let snapshot = store.load();
    assert!(snapshot.quick_disable.is_none());
    assert_eq!(snapshot.active_profile.as_deref(), Some("default"));

    let quit = run_with_args(with(&["quiet", "soon"])).expect_err("bad duration");
    assert_eq!(quit.code, 1);

    let quit = run_with_args(with(&["quiet", "100000000d"])).expect_err("huge duration");
    assert_eq!(quit.code, 1);
    assert!(quit.reason.contains("too large"), "{}", quit.reason);
    assert!(store.load().quick_disable.is_none());
}

#[cfg(unix)]
#[test]
fn unknown_config_keys_warn_but_do_not_block_notify() {
    let _guard = STDERR_MUTEX.lock().unwrap();
    let temp = TempDir::new().expect("temp dir");
    let state = temp.path().join("state.json");
    let config = temp.path().join("chimer.yml");
    fs::write(&config, "enabled: true\nvolumes: 3\ncooldown: forever\n").expect("write config");

    let mut result = None;
    let stderr = capture_stderr(|| {
        result = Some(run_with_args(args(&[
            "-c",
            config.to_str().unwrap(),
            "--state",
            state.to_str().unwrap(),
            "notify",
            "stop",
            "--dry-run",
        ])));
    });

    assert!(result.expect("ran").is_ok());
    assert!(stderr.contains("Warning: unknown config key: volumes"), "{stderr}");
    assert!(stderr.contains("cooldown"), "{stderr}");
}

#[test]
fn main_with_args_reports_success_for_status() {
    let temp = TempDir::new().expect("temp dir");
    let state = temp.path().join("state.json");
    let config = temp.path().join("missing.yml");
    let code = main_with_args(args(&[
        "-c",
        config.to_str().unwrap(),
        "--state",
        state.to_str().unwrap(),
        "status",
    ]));
    assert_eq!(code, std::process::ExitCode::SUCCESS);
}

#[test]
fn quit_logs_reason_and_sanitizes_empty_values() {
    let temp = TempDir::new().expect("temp dir");
    let log_path = temp.path().join("chimer.log");
    let logger = Logger::new(Some(log_path.clone()));

    let empty = quit(&logger, "", 7);
    assert_eq!(empty.code, 7);
    quit(&logger, "line\nbreak", 1);

    let contents = fs::read_to_string(&log_path).expect("log");
    let lines: Vec<&str> = contents.lines().collect();
    assert!(lines[0].ends_with("quit reason=unknown"), "{contents}");
    assert!(lines[1].ends_with("quit reason=line\\nbreak"), "{contents}");
}
