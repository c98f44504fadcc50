//! 工作階段狀態
//!
//! `SessionContext` 是回呼可以直接操作的部分：規則、變數、定時器、
//! 歷史緩衝區與送出佇列。它只存在於工作階段任務中。
//!
//! 觸發器比對伺服器的行時，這一行還沒有送往渲染端，回呼可以用
//! `gag_line` 隱藏它或用 `replace_line` 換掉它。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::{ExecReply, SessionHandle};
use super::{ConnectionState, EventSink, SessionEnv, SessionError, SessionEvent, StatusLevel, StatusMessage};
use crate::alias::{expand, split_commands, strip_braces};
use crate::buffer::Scrollback;
use crate::encoding::TextEncoding;
use crate::engine::RuleEngine;
use crate::rule::{CommandCall, CommandHandler, RuleAction, RuleError, RuleId, RuleKind, RuleMatch, RuleSpec};
use crate::settings::Settings;
use crate::snapshot::{CallbackRegistry, SessionSnapshot, SnapshotError};
use crate::timer::{TimerCallback, TimerInfo, TimerQueue};
use crate::value::Value;
use crate::variables::{GlobalVariables, Scope, VariableStore};

pub(crate) type MatchWaiter = oneshot::Sender<Result<RuleMatch, SessionError>>;

/// 等待中的 `wait_for`，記錄開始等待時規則的註冊序號
pub(crate) struct PendingWait {
    seq: u64,
    reply: MatchWaiter,
}

/// 觸發器對目前這一行的處理
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineEdit {
    Gag,
    Replace(String),
}

/// 需要由工作階段任務本身執行的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Connect,
    Disconnect,
}

/// 執行中的背景任務
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: u64,
    pub name: String,
    pub elapsed: Duration,
}

struct TrackedTask {
    id: u64,
    name: String,
    started: Instant,
    handle: JoinHandle<()>,
}

/// 工作階段的背景任務集合，取消權杖取消時全部結束
pub(crate) struct TaskSet {
    token: CancellationToken,
    next_id: u64,
    tasks: Vec<TrackedTask>,
}

impl TaskSet {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            next_id: 0,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.prune();
        self.next_id += 1;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
        self.tasks.push(TrackedTask {
            id: self.next_id,
            name: name.into(),
            started: Instant::now(),
            handle,
        });
        self.next_id
    }

    pub(crate) fn list(&mut self) -> Vec<TaskInfo> {
        self.prune();
        self.tasks
            .iter()
            .map(|t| TaskInfo {
                id: t.id,
                name: t.name.clone(),
                elapsed: t.started.elapsed(),
            })
            .collect()
    }

    pub(crate) fn cancel_all(&mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            task.handle.abort();
        }
    }

    fn prune(&mut self) {
        self.tasks.retain(|t| !t.handle.is_finished());
    }
}

/// 回呼可操作的工作階段狀態
pub struct SessionContext {
    pub(crate) name: String,
    pub(crate) settings: Arc<Settings>,
    pub(crate) rules: RuleEngine,
    pub(crate) vars: VariableStore,
    pub(crate) globals: GlobalVariables,
    pub(crate) outbox: VecDeque<String>,
    pub(crate) timers: TimerQueue<SessionContext>,
    pub(crate) tasks: TaskSet,
    pub(crate) events: EventSink,
    pub(crate) handle: SessionHandle,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) ignore_triggers: bool,
    pub(crate) scrollback: Scrollback,
    pub(crate) server_status: Vec<(String, String)>,
    pub(crate) last_active: Instant,
    pub(crate) state: ConnectionState,
    pub(crate) encoding: TextEncoding,
    pub(crate) waiters: HashMap<RuleId, Vec<PendingWait>>,
    pub(crate) controls: Vec<Control>,
    /// 正在比對伺服器送來的行
    pub(crate) editing: bool,
    pub(crate) line_edit: Option<LineEdit>,
}

impl SessionContext {
    pub(crate) fn new(
        name: &str,
        env: &SessionEnv,
        events: EventSink,
        handle: SessionHandle,
        token: CancellationToken,
        encoding: TextEncoding,
    ) -> Self {
        Self {
            name: name.to_string(),
            settings: Arc::clone(&env.settings),
            rules: RuleEngine::new(),
            vars: VariableStore::new(),
            globals: env.globals.clone(),
            outbox: VecDeque::new(),
            timers: TimerQueue::new(),
            tasks: TaskSet::new(token),
            events,
            handle,
            callbacks: Arc::clone(&env.callbacks),
            ignore_triggers: false,
            scrollback: Scrollback::new(env.settings.client.buffer_lines),
            server_status: Vec::new(),
            last_active: Instant::now(),
            state: ConnectionState::Disconnected,
            encoding,
            waiters: HashMap::new(),
            controls: Vec::new(),
            editing: false,
            line_edit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 可以交給背景任務的控制代碼
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// 排入送出佇列，會經過別名處理
    pub fn send(&mut self, text: impl Into<String>) {
        self.outbox.push_back(text.into());
    }

    /// 查詢變數，工作階段變數優先於全域變數
    pub fn var(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned().or_else(|| self.globals.get(name))
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.set(name, value);
    }

    pub fn remove_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn variables(&self) -> &VariableStore {
        &self.vars
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleEngine {
        &mut self.rules
    }

    /// 註冊規則，取代同 id 的規則或 id 與種類不符時另外送出警告
    pub fn register_rule(&mut self, spec: RuleSpec) -> Result<RuleId, RuleError> {
        let warning = self.rules.id_warning(&spec);
        let id = self.rules.register(spec)?;
        if let Some(message) = warning {
            self.warning(message);
        }
        Ok(id)
    }

    /// 移除規則，等待它的 `wait_for` 會得到 `Cancelled`
    pub fn remove_rule(&mut self, id: &RuleId) -> bool {
        self.waiters.remove(id);
        self.rules.remove(id).is_some()
    }

    /// 新增定時器，返回定時器 id
    pub fn add_timer(
        &mut self,
        period: Duration,
        repeat: bool,
        callback: impl TimerCallback<SessionContext> + 'static,
    ) -> String {
        self.timers.add(period, repeat, Arc::new(callback))
    }

    pub fn cancel_timer(&mut self, id: &str) -> bool {
        self.timers.cancel(id)
    }

    pub fn timers(&self) -> Vec<TimerInfo> {
        self.timers.list()
    }

    pub fn timers_mut(&mut self) -> &mut TimerQueue<SessionContext> {
        &mut self.timers
    }

    /// 啟動受工作階段管理的背景任務，工作階段關閉時一併取消
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(name, future)
    }

    pub fn tasks(&mut self) -> Vec<TaskInfo> {
        self.tasks.list()
    }

    /// 距離上一次使用者命令的時間
    pub fn idle(&self) -> Duration {
        self.last_active.elapsed()
    }

    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    /// 分割檢視並通知渲染端
    pub fn split(&mut self, at: Option<usize>) -> Option<usize> {
        let pin = self.scrollback.split(at);
        self.events.emit(SessionEvent::Pin(pin));
        pin
    }

    pub fn unsplit(&mut self) {
        self.scrollback.unsplit();
        self.events.emit(SessionEvent::Pin(None));
    }

    /// 最近一次收到的 MSSP 狀態表
    pub fn server_status(&self) -> &[(String, String)] {
        &self.server_status
    }

    pub fn ignores_triggers(&self) -> bool {
        self.ignore_triggers
    }

    /// 暫停或恢復觸發器比對
    pub fn set_ignore_triggers(&mut self, ignore: bool) {
        self.ignore_triggers = ignore;
    }

    /// 不顯示目前比對中的行，只在觸發器處理伺服器的行時有效
    pub fn gag_line(&mut self) -> bool {
        self.edit_line(LineEdit::Gag)
    }

    /// 以新文字（可含 ANSI 序列）取代目前比對中的行
    pub fn replace_line(&mut self, text: impl Into<String>) -> bool {
        self.edit_line(LineEdit::Replace(text.into()))
    }

    fn edit_line(&mut self, edit: LineEdit) -> bool {
        if !self.editing {
            return false;
        }
        self.line_edit = Some(edit);
        true
    }

    pub fn status(&mut self, level: StatusLevel, text: impl Into<String>) {
        self.events.emit(SessionEvent::Status(StatusMessage {
            level,
            text: text.into(),
        }));
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.status(StatusLevel::Info, text);
    }

    pub fn warning(&mut self, text: impl Into<String>) {
        self.status(StatusLevel::Warning, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.status(StatusLevel::Error, text);
    }

    /// 要求連線，本次處理結束後執行
    pub fn request_connect(&mut self) {
        self.controls.push(Control::Connect);
    }

    /// 要求斷線，本次處理結束後執行
    pub fn request_disconnect(&mut self) {
        self.controls.push(Control::Disconnect);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::capture(&self.vars, &self.rules)
    }

    /// 寫入存檔，返回檔案路徑
    pub fn save_snapshot(&self) -> Result<PathBuf, SnapshotError> {
        let path = SessionSnapshot::path_for(&self.settings.client.state_dir, &self.name);
        self.snapshot().save(&path)?;
        Ok(path)
    }

    /// 讀取存檔，檔案不存在時不做任何事
    pub(crate) fn load_snapshot(&mut self) -> Result<bool, SnapshotError> {
        let path = SessionSnapshot::path_for(&self.settings.client.state_dir, &self.name);
        if !path.exists() {
            return Ok(false);
        }
        let snapshot = SessionSnapshot::load(&path)?;
        let callbacks = Arc::clone(&self.callbacks);
        for message in snapshot.apply(&mut self.vars, &mut self.rules, &callbacks)? {
            self.warning(message);
        }
        debug!("[{}] 已載入存檔 {}", self.name, path.display());
        Ok(true)
    }

    pub(crate) fn add_waiter(&mut self, rule: RuleId, reply: MatchWaiter) {
        self.prune_waiters();
        let Some(seq) = self.rules.get(&rule).map(|r| r.seq) else {
            let _ = reply.send(Err(RuleError::NotFound(rule).into()));
            return;
        };
        self.waiters.entry(rule).or_default().push(PendingWait { seq, reply });
    }

    /// 清掉已逾時的等待者，以及規則已被移除或被同 id 新規則取代的等待者
    ///
    /// 被清掉的 `wait_for` 得到 `Cancelled`。
    pub(crate) fn prune_waiters(&mut self) {
        let rules = &self.rules;
        self.waiters.retain(|id, pending| {
            let current = rules.get(id).map(|r| r.seq);
            pending.retain(|w| Some(w.seq) == current && !w.reply.is_closed());
            !pending.is_empty()
        });
    }

    /// 執行一次比對成功的動作
    ///
    /// 回呼錯誤只回報為警告，不影響同一輪其他規則。
    pub(crate) fn dispatch(&mut self, matched: RuleMatch) {
        if matched.kind == RuleKind::Trigger {
            for (i, capture) in matched.captures.iter().enumerate().take(10) {
                self.vars.set(&format!("%{}", i), Value::Str(capture.clone()));
            }
        }
        match &matched.action {
            RuleAction::None => {}
            RuleAction::Send(template) => {
                let command = expand(
                    template,
                    &Scope {
                        session: &self.vars,
                        global: &self.globals,
                    },
                    &matched.captures,
                );
                let rest = self.take_line_commands(command.wire());
                if !rest.is_empty() {
                    self.outbox.push_back(rest);
                }
            }
            RuleAction::Callback(callback) => {
                if let Err(e) = callback.invoke(&matched, self) {
                    warn!("[{}] 規則 {} 的回呼執行失敗: {}", self.name, matched.rule_id, e);
                    self.warning(format!("規則 {} 的回呼執行失敗: {}", matched.rule_id, e));
                }
            }
            RuleAction::Handler(handler) => {
                let call = CommandCall {
                    rule_id: matched.rule_id.clone(),
                    command: matched.line.clone(),
                    args: matched.captures.iter().skip(1).map(|c| Value::infer(c)).collect(),
                };
                self.spawn_handler(Arc::clone(handler), call, None);
            }
        }
        self.notify_waiters(&matched);
    }

    /// 觸發器命令中的 `#gag` 與 `#replace` 要在這一行顯示前生效，返回其餘的命令
    fn take_line_commands(&mut self, commands: &str) -> String {
        if !self.editing {
            return commands.to_string();
        }
        let separator = self.settings.client.separator.clone();
        let prefix = self.settings.client.command_prefix;
        let mut rest = Vec::new();
        for command in split_commands(commands, &separator) {
            let edit = match command
                .trim()
                .strip_prefix(prefix)
                .map(|b| b.split_once(char::is_whitespace).unwrap_or((b, "")))
            {
                Some((name, _)) if name.eq_ignore_ascii_case("gag") => Some(LineEdit::Gag),
                Some((name, text)) if name.eq_ignore_ascii_case("replace") => {
                    Some(LineEdit::Replace(strip_braces(text).to_string()))
                }
                _ => None,
            };
            match edit {
                Some(edit) => {
                    self.edit_line(edit);
                }
                None => rest.push(command),
            }
        }
        rest.join(&separator)
    }

    /// 喚醒等待這條規則的 `wait_for`
    pub(crate) fn notify_waiters(&mut self, matched: &RuleMatch) {
        if let Some(pending) = self.waiters.remove(&matched.rule_id) {
            for waiter in pending {
                let _ = waiter.reply.send(Ok(matched.clone()));
            }
        }
    }

    /// 在背景執行非同步處理器，`reply` 存在時回報結果
    pub(crate) fn spawn_handler(&mut self, handler: Arc<dyn CommandHandler>, call: CommandCall, reply: Option<ExecReply>) {
        let handle = self.handle.clone();
        let name = format!("handler {}", call.rule_id);
        self.tasks.spawn(name, async move {
            let rule = call.rule_id.clone();
            let result = handler.execute(call, handle.clone()).await;
            if let Err(e) = &result {
                warn!("[{}] 處理器 {} 執行失敗: {}", handle.name(), rule, e);
                handle.report(StatusLevel::Warning, format!("處理器 {} 執行失敗: {}", rule, e));
            }
            if let Some(reply) = reply {
                let _ = reply.send(result.map(Some).map_err(SessionError::from));
            }
        });
    }

    /// 結束時讓所有等待者得到 `Cancelled`
    pub(crate) fn cancel_all(&mut self) {
        self.waiters.clear();
        self.tasks.cancel_all();
        self.timers.clear();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::session::handle::Request;
    use crate::session::testing::DuplexConnector;

    /// 不含工作階段任務的狀態，請求與事件交給測試檢查
    pub(crate) fn context() -> (
        SessionContext,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<Request>,
    ) {
        let (connector, _servers) = DuplexConnector::new();
        let env = SessionEnv::new(Settings::default(), Arc::new(connector));
        let (event_tx, events) = mpsc::unbounded_channel();
        let sink = EventSink {
            tx: event_tx,
            wake: Arc::clone(&env.wake),
        };
        let (tx, requests) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = SessionHandle::new("test", tx, state_rx, ";", Duration::ZERO);
        let ctx = SessionContext::new("test", &env, sink, handle, env.cancel.child_token(), TextEncoding::Utf8);
        (ctx, events, requests)
    }
}
