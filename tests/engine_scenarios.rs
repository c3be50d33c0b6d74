//! End-to-end scenarios over the execution engine, wired the way the
//! multiplexer wires them but without a network: lines are fed straight
//! into the instance, dispatch actions are pushed onto a live command
//! channel, and outbound traffic is observed at the queue.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder::access::{self, AccessOutcome};
use cinder::exec::{CommandChannel, Job};
use cinder::instance::{Action, InstanceCore};
use cinder::plugin::api::ModuleCtx;
use cinder::plugin::Module;
use cinder::store::{SqlParam, Store};

fn test_core() -> Arc<InstanceCore> {
    let store = Store::open_in_memory().unwrap();
    let core = Arc::new(InstanceCore::new(
        "testnet",
        "bot",
        "!",
        None,
        store,
        PathBuf::from("modules"),
    ));
    core.add_channel("#c", &[]);
    core
}

fn family_enter(ctx: &ModuleCtx, channel: &str, user: &str, _message: &str) {
    ctx.write(channel, &format!("{user}: the family is well"));
}

fn spin_enter(ctx: &ModuleCtx, _: &str, _: &str, _: &str) {
    loop {
        let _ = ctx.urand();
    }
}

fn install(core: &Arc<InstanceCore>, module: &Arc<Module>) {
    core.modules.insert_builtin(Arc::clone(module)).unwrap();
    core.enable_module("#c", module.name(), None);
}

fn dispatch(core: &Arc<InstanceCore>, channel: &CommandChannel, line: &str) -> bool {
    let mut pushed = false;
    for action in core.feed(line) {
        if let Action::Dispatch {
            module,
            channel: chan,
            user,
            message,
        } = action
        {
            channel.push(Job {
                module,
                link: Arc::clone(core),
                channel: chan,
                user,
                message,
            });
            pushed = true;
        }
    }
    pushed
}

fn wait_for_lines(core: &InstanceCore, want: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut now = Instant::now();
    for _ in 0..600 {
        lines.extend(core.queue.lock().drain(now));
        now += Duration::from_secs(2);
        if lines.len() >= want {
            return lines;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("expected {want} outbound lines, got {lines:?}");
}

#[test]
fn scenario_ping_pong_inline() {
    let core = test_core();
    let actions = core.feed("PING :abc");
    match &actions[..] {
        [Action::SendNow(line)] => assert_eq!(line, "PONG :abc\r\n"),
        other => panic!("expected inline pong, got {other:?}"),
    }
    // Not queued, not flood-limited.
    assert!(core.queue.lock().is_empty());
}

#[test]
fn scenario_nick_collision() {
    let core = test_core();
    let actions = core.feed(":srv 433 * bot :in use");
    match &actions[..] {
        [Action::SendNow(line)] => assert_eq!(line, "NICK bot_\r\n"),
        other => panic!("expected renick, got {other:?}"),
    }
}

#[test]
fn scenario_command_dispatch_produces_reply() {
    let core = test_core();
    let family = Module::builtin("family", "family", None, family_enter, None);
    install(&core, &family);

    let channel = CommandChannel::with_timeout(Duration::from_secs(5));
    channel.begin();

    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG #c :!family"));
    let lines = wait_for_lines(&core, 1);
    assert_eq!(lines, vec!["PRIVMSG #c :alice: the family is well\r\n"]);
    channel.close();
}

#[test]
fn scenario_timeout_then_recovery() {
    let core = test_core();
    let spin = Module::builtin("spin", "spin", None, spin_enter, None);
    let family = Module::builtin("family", "family", None, family_enter, None);
    install(&core, &spin);
    install(&core, &family);

    let channel = CommandChannel::with_timeout(Duration::from_millis(200));
    channel.begin();

    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG #c :!spin"));
    let lines = wait_for_lines(&core, 1);
    assert_eq!(lines[0], "PRIVMSG #c :alice: command timeout\r\n");

    // The engine keeps serving.
    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG #c :!family"));
    let lines = wait_for_lines(&core, 1);
    assert_eq!(lines[0], "PRIVMSG #c :alice: the family is well\r\n");
    channel.close();
}

#[test]
fn scenario_flood_pacing() {
    let core = test_core();
    for _ in 0..6 {
        core.action("#c", "jumps around");
    }

    let start = Instant::now();
    let first = core.queue.lock().drain(start);
    assert_eq!(first.len(), 4);

    let mid = core.queue.lock().drain(start + Duration::from_millis(900));
    assert!(mid.is_empty());

    let second = core.queue.lock().drain(start + Duration::from_millis(1100));
    assert_eq!(second.len(), 2);
}

#[test]
fn scenario_access_seniority() {
    let core = test_core();
    {
        let store = core.store.lock();
        for (name, level) in [("alice", 4i64), ("bob", 3)] {
            store
                .execute(
                    "INSERT INTO ACCESS(CHANNEL, NAME, ACCESS) VALUES (?1, ?2, ?3)",
                    &[
                        SqlParam::text("#c"),
                        SqlParam::text(name),
                        SqlParam::int(level),
                    ],
                )
                .unwrap();
        }

        assert_eq!(
            access::change(&store, "#c", "bob", "alice", 5),
            AccessOutcome::Denied
        );
        assert_eq!(
            access::change(&store, "#c", "bob", "alice", 4),
            AccessOutcome::Success
        );
        assert_eq!(access::level(&store, "#c", "bob").unwrap(), Some(4));
    }
}

#[test]
fn scenario_request_counters_accumulate() {
    let core = test_core();
    let store = core.store.lock();
    let before = store.request_count("FNORD").unwrap();
    for _ in 0..7 {
        store.request("FNORD").unwrap();
    }
    assert_eq!(store.request_count("FNORD").unwrap(), before + 7);
}

#[test]
fn scenario_unloaded_module_job_dropped() {
    let core = test_core();
    let family = Module::builtin("family", "family", None, family_enter, None);
    install(&core, &family);

    let channel = CommandChannel::with_timeout(Duration::from_millis(500));
    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG #c :!family"));

    // Unloaded between enqueue and dispatch.
    core.modules.unload("family", &core).unwrap();
    channel.begin();
    channel.close();

    assert!(core.queue.lock().is_empty());
}

#[test]
fn scenario_query_command_replies_to_sender() {
    let core = test_core();
    let family = Module::builtin("family", "family", None, family_enter, None);
    core.modules.insert_builtin(Arc::clone(&family)).unwrap();

    let channel = CommandChannel::with_timeout(Duration::from_secs(5));
    channel.begin();

    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG bot :!family"));
    let lines = wait_for_lines(&core, 1);
    assert_eq!(lines, vec!["PRIVMSG alice :alice: the family is well\r\n"]);
    channel.close();
}

#[test]
fn scenario_module_config_reaches_plugin() {
    fn greeting_enter(ctx: &ModuleCtx, channel: &str, _: &str, _: &str) {
        let greeting = ctx
            .config(channel)
            .and_then(|config| config.get("greeting").cloned())
            .unwrap_or_else(|| "hello".to_string());
        ctx.write(channel, &greeting);
    }

    let core = test_core();
    let greeter = Module::builtin("greet", "greet", None, greeting_enter, None);
    core.modules.insert_builtin(Arc::clone(&greeter)).unwrap();

    let mut config = BTreeMap::new();
    config.insert("greeting".to_string(), "ahoy".to_string());
    core.enable_module("#c", "greet", Some(&config));

    let channel = CommandChannel::with_timeout(Duration::from_secs(5));
    channel.begin();

    assert!(dispatch(&core, &channel, ":alice!a@h PRIVMSG #c :!greet"));
    let lines = wait_for_lines(&core, 1);
    assert_eq!(lines, vec!["PRIVMSG #c :ahoy\r\n"]);
    channel.close();
}
