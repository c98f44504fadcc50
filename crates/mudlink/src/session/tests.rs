use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

use super::testing::DuplexConnector;
use super::*;
use crate::buffer::DecodedLine;
use crate::rule::{CallbackError, CommandCall, RuleId, RuleMatch, RuleSpec};
use crate::value::Value;

struct Harness {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    servers: mpsc::UnboundedReceiver<DuplexStream>,
    connector: Arc<DuplexConnector>,
}

fn quiet_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.offer_naws = false;
    settings.client.var_autosave = false;
    settings.client.var_autoload = false;
    settings.client.reconnect_wait_secs = 0;
    settings.client.interval_ms = 0;
    settings.client.repeat_interval_ms = 0;
    settings.client.disconnect_timeout_ms = 200;
    settings
}

fn launch(settings: Settings, config: SessionConfig) -> Harness {
    let (connector, servers) = DuplexConnector::new();
    let connector = Arc::new(connector);
    let env = SessionEnv::new(settings, connector.clone());
    let spawned = spawn(config, env);
    Harness {
        handle: spawned.handle,
        events: spawned.events,
        servers,
        connector,
    }
}

async fn connected(settings: Settings) -> (Harness, DuplexStream) {
    let mut harness = launch(settings, SessionConfig::new("test", "mud.example", 4000));
    let server = harness.servers.recv().await.unwrap();
    harness
        .handle
        .wait_state(ConnectionState::Connected)
        .await
        .unwrap();
    (harness, server)
}

async fn next_line(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> DecodedLine {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(SessionEvent::Line(line))) => return line,
            Ok(Some(_)) => continue,
            other => panic!("no line arrived: {:?}", other),
        }
    }
}

async fn read_text(server: &mut DuplexStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), server.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&buf), expected);
}

/// 反覆檢查工作階段狀態直到條件成立
async fn until<F>(handle: &SessionHandle, check: F)
where
    F: Fn(&mut SessionContext) -> bool + Clone + Send + 'static,
{
    for _ in 0..200 {
        let check = check.clone();
        if handle.call(move |ctx| check(ctx)).await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_connect_state_transitions() {
    let mut config = SessionConfig::new("test", "mud.example", 4000);
    config.auto_connect = false;
    let mut harness = launch(quiet_settings(), config);
    assert_eq!(harness.handle.state(), ConnectionState::Disconnected);

    assert_ok!(harness.handle.connect().await);
    let mut states = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        if let SessionEvent::State(state) = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    assert!(matches!(
        harness.handle.connect().await,
        Err(SessionError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    let mut config = SessionConfig::new("test", "mud.example", 4000);
    config.auto_connect = false;
    let harness = launch(quiet_settings(), config);
    harness.connector.refuse(true);
    assert!(matches!(
        harness.handle.connect().await,
        Err(SessionError::Transport(_))
    ));
    assert_eq!(harness.handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_lines_reach_events_and_scrollback() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    server.write_all(b"hello\r\n\x1b[31mworld\x1b[0m\r\n").await.unwrap();
    assert_eq!(next_line(&mut harness.events).await.text(), "hello");
    assert_eq!(next_line(&mut harness.events).await.text(), "world");
    let stored = harness.handle.call(|ctx| ctx.scrollback().len()).await.unwrap();
    assert_eq!(stored, 2);
    assert_eq!(
        harness.handle.get_var("%line").await.unwrap(),
        Some(Value::from("world"))
    );
}

#[tokio::test]
async fn test_line_split_across_reads() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    server.write_all(b"hel").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.write_all(b"lo\r\n").await.unwrap();
    let line = next_line(&mut harness.events).await;
    assert_eq!(line.text(), "hello");
    assert!(!line.prompt);
}

#[tokio::test]
async fn test_go_ahead_flushes_prompt() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    server.write_all(b"HP 100> \xff\xf9").await.unwrap();
    let line = next_line(&mut harness.events).await;
    assert_eq!(line.text(), "HP 100> ");
    assert!(line.prompt);
}

#[tokio::test]
async fn test_terminal_type_reply() {
    let (_harness, mut server) = connected(quiet_settings()).await;
    // IAC DO TTYPE
    server.write_all(&[255, 253, 24]).await.unwrap();
    let mut reply = [0u8; 3];
    server.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [255, 251, 24]);
}

#[tokio::test]
async fn test_triggers_fire_in_priority_order() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    for (name, priority) in [("low", 300), ("high", 10), ("mid", 100)] {
        let order = Arc::clone(&order);
        let spec = RuleSpec::trigger("^orc").priority(priority).callback(
            move |_: &crate::rule::RuleMatch, _: &mut SessionContext| -> Result<(), crate::rule::CallbackError> {
                order.lock().unwrap().push(name);
                Ok(())
            },
        );
        harness.handle.register_rule(spec).await.unwrap();
    }
    server.write_all(b"orc arrives\r\n").await.unwrap();
    next_line(&mut harness.events).await;
    harness.handle.call(|_| ()).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn test_one_shot_can_register_itself_again() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    let fired = Arc::new(Mutex::new(0));

    fn rearm(fired: Arc<Mutex<usize>>) -> RuleSpec {
        RuleSpec::trigger("^tick").id("once").one_shot().callback(
            move |_: &crate::rule::RuleMatch, ctx: &mut SessionContext| -> Result<(), crate::rule::CallbackError> {
                *fired.lock().unwrap() += 1;
                ctx.register_rule(rearm(Arc::clone(&fired)))
                    .map(|_| ())
                    .map_err(|e| crate::rule::CallbackError::new(e.to_string()))
            },
        )
    }

    harness.handle.register_rule(rearm(Arc::clone(&fired))).await.unwrap();
    server.write_all(b"tick\r\ntick\r\n").await.unwrap();
    next_line(&mut harness.events).await;
    next_line(&mut harness.events).await;
    let present = harness
        .handle
        .call(|ctx| ctx.rules().contains(&RuleId::from("once")))
        .await
        .unwrap();
    assert!(present);
    assert_eq!(*fired.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_wait_for_match_and_timeout() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger(r"^HP: (\d+)").id("hp"))
        .await
        .unwrap();

    let handle = harness.handle.clone();
    let waiting = tokio::spawn(async move { handle.wait_for("hp", Duration::from_secs(5)).await });
    until(&harness.handle, |ctx| ctx.waiters.contains_key(&RuleId::from("hp"))).await;
    server.write_all(b"HP: 42\r\n").await.unwrap();

    match waiting.await.unwrap().unwrap() {
        WaitOutcome::Matched(matched) => assert_eq!(matched.group(1), Some("42")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let outcome = harness.handle.wait_for("hp", Duration::from_millis(50)).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[tokio::test]
async fn test_wait_for_unknown_rule() {
    let (harness, _server) = connected(quiet_settings()).await;
    let result = harness.handle.wait_for("missing", Duration::from_secs(1)).await;
    assert!(matches!(result, Err(SessionError::Rule(_))));
}

#[tokio::test]
async fn test_close_cancels_waiters() {
    let (harness, _server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger("^never").id("never"))
        .await
        .unwrap();
    let handle = harness.handle.clone();
    let waiting = tokio::spawn(async move { handle.wait_for("never", Duration::from_secs(5)).await });
    until(&harness.handle, |ctx| ctx.waiters.contains_key(&RuleId::from("never"))).await;

    // 伺服器不回應，等到斷線逾時
    let outcome = harness.handle.close().await.unwrap();
    assert_eq!(outcome, CloseOutcome::TimedOut);
    assert_eq!(waiting.await.unwrap().unwrap(), WaitOutcome::Cancelled);
    let mut events = harness.events;
    let mut closed = false;
    while let Some(event) = events.recv().await {
        closed = event == SessionEvent::Closed;
    }
    assert!(closed);
}

#[tokio::test]
async fn test_send_splits_and_expands() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness.handle.set_var("target", Value::from("orc")).await.unwrap();
    harness
        .handle
        .register_rule(RuleSpec::alias(r"^k (\w+)$").send("kill %1;get all"))
        .await
        .unwrap();
    harness.handle.send("n;k @target").unwrap();
    read_text(&mut server, "n\r\nkill orc\r\nget all\r\n").await;
}

#[tokio::test]
async fn test_builtin_commands_are_not_sent() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness.handle.send("#var hp 30;#3 look;say @hp").unwrap();
    read_text(&mut server, "look\r\nlook\r\nlook\r\nsay 30\r\n").await;
    assert_eq!(harness.handle.get_var("hp").await.unwrap(), Some(Value::Int(30)));
}

#[tokio::test]
async fn test_alias_loop_is_bounded() {
    let mut settings = quiet_settings();
    settings.client.max_recursion = 5;
    let (mut harness, mut server) = connected(settings).await;
    harness
        .handle
        .register_rule(RuleSpec::alias("^spin$").send("spin"))
        .await
        .unwrap();
    harness.handle.send("spin;look").unwrap();
    read_text(&mut server, "look\r\n").await;

    let mut errors = 0;
    while let Ok(event) = harness.events.try_recv() {
        if let SessionEvent::Status(msg) = event {
            if msg.level == StatusLevel::Error {
                errors += 1;
            }
        }
    }
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_send_async_passes_typed_variable() {
    let (harness, _server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::alias(r"^buy (\S+)$").handler(|call: CommandCall, _session: SessionHandle| async move {
            Ok::<_, crate::rule::CallbackError>(call.args[0].clone())
        }))
        .await
        .unwrap();

    let result = harness.handle.send_async("#var gold 500;buy @gold").await.unwrap();
    assert_eq!(result, Some(Value::Int(500)));
}

#[tokio::test]
async fn test_send_async_handler_error() {
    let (harness, _server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::alias("^fail$").handler(|_: CommandCall, _: SessionHandle| async move {
            Err::<Value, _>(crate::rule::CallbackError::new("失敗"))
        }))
        .await
        .unwrap();
    let result = harness.handle.send_async("fail").await;
    assert!(matches!(result, Err(SessionError::Callback(_))));
}

#[tokio::test]
async fn test_disconnect_acknowledged() {
    let (harness, mut server) = connected(quiet_settings()).await;
    let peer = tokio::spawn(async move {
        let mut buf = Vec::new();
        // 讀到客戶端關閉寫入端後離開
        server.read_to_end(&mut buf).await.unwrap();
        server.write_all(b"Goodbye!\r\n").await.unwrap();
    });
    let outcome = harness.handle.disconnect().await.unwrap();
    assert_eq!(outcome, CloseOutcome::Acknowledged);
    assert_eq!(harness.handle.state(), ConnectionState::Disconnected);
    peer.await.unwrap();
    let last = harness
        .handle
        .call(|ctx| ctx.scrollback().iter().last().map(|l| l.text()))
        .await
        .unwrap();
    assert_eq!(last.as_deref(), Some("Goodbye!"));
}

#[tokio::test]
async fn test_disconnect_times_out() {
    let (harness, _server) = connected(quiet_settings()).await;
    let outcome = harness.handle.disconnect().await.unwrap();
    assert_eq!(outcome, CloseOutcome::TimedOut);
    assert_eq!(
        harness.handle.disconnect().await.unwrap(),
        CloseOutcome::NotConnected
    );
}

#[tokio::test]
async fn test_manual_reconnect_is_throttled() {
    let mut settings = quiet_settings();
    settings.client.reconnect_wait_secs = 15;
    let (harness, server) = connected(settings).await;
    drop(server);
    harness
        .handle
        .wait_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(matches!(
        harness.handle.connect().await,
        Err(SessionError::Throttled(_))
    ));
}

#[tokio::test]
async fn test_auto_reconnect_after_remote_close() {
    let mut settings = quiet_settings();
    settings.client.auto_reconnect = true;
    let (mut harness, server) = connected(settings).await;
    drop(server);
    let second = timeout(Duration::from_secs(5), harness.servers.recv()).await.unwrap();
    assert!(second.is_some());
    harness
        .handle
        .wait_state(ConnectionState::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_after_connect_command() {
    let mut harness = launch(
        quiet_settings(),
        SessionConfig::new("test", "mud.example", 4000).with_after_connect("guest;look"),
    );
    let mut server = harness.servers.recv().await.unwrap();
    read_text(&mut server, "guest\r\nlook\r\n").await;
}

#[tokio::test]
async fn test_timer_command_sends() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness.handle.send("#ti 0.05 {hp}").unwrap();
    read_text(&mut server, "hp\r\n").await;
    let timers = harness.handle.call(|ctx| ctx.timers().len()).await.unwrap();
    assert_eq!(timers, 1);
}

#[tokio::test]
async fn test_big5_session() {
    let mut settings = quiet_settings();
    settings.server.encoding = "big5".to_string();
    let (mut harness, mut server) = connected(settings).await;
    // 「你好」的 Big5 位元組
    server.write_all(&[0xA7, 0x41, 0xA6, 0x6E, b'\r', b'\n']).await.unwrap();
    assert_eq!(next_line(&mut harness.events).await.text(), "你好");
    harness.handle.send("說 你好").unwrap();
    let mut buf = [0u8; 9];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[3..], &[0xA7, 0x41, 0xA6, 0x6E, b'\r', b'\n']);
}

async fn scrollback_texts(handle: &SessionHandle) -> Vec<String> {
    handle
        .call(|ctx| ctx.scrollback().iter().map(|l| l.text()).collect())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_repeat_is_paced() {
    let mut settings = quiet_settings();
    settings.client.repeat_interval_ms = 60;
    let (harness, mut server) = connected(settings).await;
    let started = tokio::time::Instant::now();
    harness.handle.send("#3 n").unwrap();
    read_text(&mut server, "n\r\nn\r\nn\r\n").await;
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn test_oversized_repeat_sends_nothing() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    harness.handle.send("#1001 n;look").unwrap();
    read_text(&mut server, "look\r\n").await;
    let mut errors = 0;
    while let Ok(event) = harness.events.try_recv() {
        if let SessionEvent::Status(msg) = event {
            if msg.level == StatusLevel::Error {
                errors += 1;
            }
        }
    }
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_gag_hides_line() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger("^spam").send("#gag;say seen"))
        .await
        .unwrap();
    server.write_all(b"spam spam\r\nhello\r\n").await.unwrap();
    assert_eq!(next_line(&mut harness.events).await.text(), "hello");
    read_text(&mut server, "say seen\r\n").await;
    assert_eq!(scrollback_texts(&harness.handle).await, vec!["hello"]);
}

#[tokio::test]
async fn test_raw_trigger_replaces_line() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    let seen = Arc::new(Mutex::new(None));
    let raw = Arc::clone(&seen);
    harness
        .handle
        .register_rule(RuleSpec::trigger(r"\x1b\[0;31m").raw().callback(
            move |_: &RuleMatch, ctx: &mut SessionContext| -> Result<(), CallbackError> {
                *raw.lock().unwrap() = ctx.var("%raw");
                let replacement = format!("[紅] {}", ctx.var("%line").map(|v| v.to_string()).unwrap_or_default());
                ctx.replace_line(replacement);
                Ok(())
            },
        ))
        .await
        .unwrap();
    server.write_all(b"\x1b[31mdanger\x1b[0m\r\nplain\r\n").await.unwrap();
    assert_eq!(next_line(&mut harness.events).await.text(), "[紅] danger");
    assert_eq!(next_line(&mut harness.events).await.text(), "plain");
    assert_eq!(
        *seen.lock().unwrap(),
        Some(Value::from("\x1b[0;31mdanger\x1b[0m"))
    );
    assert_eq!(scrollback_texts(&harness.handle).await, vec!["[紅] danger", "plain"]);
}

#[tokio::test]
async fn test_replace_from_send_template() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger(r"^(\S+) 走了過來").send("#replace {>> %1 <<}"))
        .await
        .unwrap();
    server.write_all("bob 走了過來\r\n".as_bytes()).await.unwrap();
    assert_eq!(next_line(&mut harness.events).await.text(), ">> bob <<");
}

#[tokio::test]
async fn test_multiline_trigger_in_session() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::multiline(["^Status", r"^HP: (\d+)"]).send("say hp %1"))
        .await
        .unwrap();
    server.write_all(b"Status\r\nHP: 80\r\n").await.unwrap();
    read_text(&mut server, "say hp 80\r\n").await;
}

#[tokio::test]
async fn test_group_disabled_mid_pass_keeps_snapshot() {
    let (mut harness, mut server) = connected(quiet_settings()).await;
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&fired);
    harness
        .handle
        .register_rule(RuleSpec::trigger("^orc").priority(1).callback(
            move |_: &RuleMatch, ctx: &mut SessionContext| -> Result<(), CallbackError> {
                log.lock().unwrap().push("first");
                ctx.rules_mut().set_group_enabled("fight", false);
                Ok(())
            },
        ))
        .await
        .unwrap();
    let log = Arc::clone(&fired);
    harness
        .handle
        .register_rule(RuleSpec::trigger("^orc").group("fight").callback(
            move |_: &RuleMatch, _: &mut SessionContext| -> Result<(), CallbackError> {
                log.lock().unwrap().push("second");
                Ok(())
            },
        ))
        .await
        .unwrap();
    server.write_all(b"orc arrives\r\norc again\r\n").await.unwrap();
    next_line(&mut harness.events).await;
    next_line(&mut harness.events).await;
    harness.handle.call(|_| ()).await.unwrap();
    // 這一輪的快照已包含第二條規則，下一行才看得到停用
    assert_eq!(*fired.lock().unwrap(), vec!["first", "second", "first"]);
}

#[tokio::test]
async fn test_reload_source_cancels_pending_wait() {
    let (harness, _server) = connected(quiet_settings()).await;
    harness
        .handle
        .reload_source("combat", vec![RuleSpec::trigger("^hp").id("hp")])
        .await
        .unwrap();
    let handle = harness.handle.clone();
    let waiting = tokio::spawn(async move { handle.wait_for("hp", Duration::from_secs(5)).await });
    until(&harness.handle, |ctx| ctx.waiters.contains_key(&RuleId::from("hp"))).await;

    harness
        .handle
        .reload_source("combat", vec![RuleSpec::trigger("^mp").id("mp")])
        .await
        .unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), WaitOutcome::Cancelled);
}

#[tokio::test]
async fn test_replacing_rule_cancels_pending_wait() {
    let (harness, mut server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger("^hp").id("hp"))
        .await
        .unwrap();
    let handle = harness.handle.clone();
    let waiting = tokio::spawn(async move { handle.wait_for("hp", Duration::from_secs(5)).await });
    until(&harness.handle, |ctx| ctx.waiters.contains_key(&RuleId::from("hp"))).await;

    harness
        .handle
        .register_rule(RuleSpec::trigger(r"^HP (\d+)").id("hp"))
        .await
        .unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), WaitOutcome::Cancelled);

    // 新的規則可以正常等待
    let handle = harness.handle.clone();
    let waiting = tokio::spawn(async move { handle.wait_for("hp", Duration::from_secs(5)).await });
    until(&harness.handle, |ctx| ctx.waiters.contains_key(&RuleId::from("hp"))).await;
    server.write_all(b"HP 7\r\n").await.unwrap();
    match waiting.await.unwrap().unwrap() {
        WaitOutcome::Matched(matched) => assert_eq!(matched.group(1), Some("7")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_timed_out_waiter_is_dropped() {
    let (harness, _server) = connected(quiet_settings()).await;
    harness
        .handle
        .register_rule(RuleSpec::trigger("^never").id("never"))
        .await
        .unwrap();
    let outcome = harness.handle.wait_for("never", Duration::from_millis(30)).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    until(&harness.handle, |ctx| ctx.waiters.is_empty()).await;
}

