//! 工作階段任務
//!
//! 單一迴圈同時等待請求、網路資料、連線結果、斷線期限、重連時間與定時器，
//! 每處理完一件事就把回呼排入的命令送出。

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::commands::{self, Builtin};
use super::context::{Control, LineEdit, SessionContext};
use super::handle::{ExecReply, Request, SessionHandle};
use super::transport::{BoxedStream, TransportError};
use super::{CloseOutcome, ConnectionState, EventSink, SessionEnv, SessionError, SessionEvent};
use crate::alias::{split_commands, Outbound};
use crate::buffer::{DecodedLine, LineAssembler};
use crate::encoding::{encode, StreamDecoder, TextEncoding};
use crate::logger::Transcript;
use crate::rule::{CommandCall, RuleAction};
use crate::settings::{resolve_encoding, SessionConfig};
use crate::telnet::{NegotiationEvent, OptionNegotiator};
use crate::trigger::EvalMode;
use crate::variables::Scope;

type ConnectResult = Result<BoxedStream, TransportError>;

pub(crate) struct SessionActor {
    ctx: SessionContext,
    config: SessionConfig,
    env: SessionEnv,
    requests: mpsc::UnboundedReceiver<Request>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,

    stream: Option<BoxedStream>,
    read_buf: BytesMut,
    negotiator: OptionNegotiator,
    decoder: StreamDecoder,
    assembler: LineAssembler,
    transcript: Option<Transcript>,

    pending_connect: Option<JoinHandle<ConnectResult>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), SessionError>>>,
    disconnect_waiters: Vec<oneshot::Sender<CloseOutcome>>,
    close_reply: Option<oneshot::Sender<CloseOutcome>>,
    closing_deadline: Option<Instant>,
    user_disconnect: bool,
    auto_reconnect: bool,
    reconnect_at: Option<Instant>,
    last_attempt: Option<Instant>,
    finished: bool,
}

impl SessionActor {
    pub(crate) fn spawn(config: SessionConfig, env: SessionEnv, sink: EventSink) -> (SessionHandle, JoinHandle<()>) {
        let settings = Arc::clone(&env.settings);
        let (tx, requests) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = SessionHandle::new(
            &config.name,
            tx,
            state_rx,
            &settings.client.separator,
            settings.client.interval(),
        );

        let label = config
            .encoding
            .clone()
            .unwrap_or_else(|| settings.server.encoding.clone());
        let (encoding, bad_label) = match resolve_encoding(&label) {
            Ok(encoding) => (encoding, None),
            Err(e) => (TextEncoding::Utf8, Some(e)),
        };

        let cancel = env.cancel.child_token();
        let mut ctx = SessionContext::new(&config.name, &env, sink, handle.clone(), cancel.child_token(), encoding);
        if let Some(e) = bad_label {
            warn!("[{}] {}，改用 UTF-8", config.name, e);
            ctx.warning(format!("{}，改用 UTF-8", e));
        }

        let auto_reconnect = config.auto_reconnect.unwrap_or(settings.client.auto_reconnect);
        let actor = Self {
            ctx,
            auto_reconnect,
            requests,
            state_tx,
            cancel,
            stream: None,
            read_buf: BytesMut::with_capacity(settings.client.read_buffer_size),
            negotiator: OptionNegotiator::new(settings.negotiator_config(encoding)),
            decoder: StreamDecoder::new(encoding),
            assembler: LineAssembler::new(settings.client.tabstop),
            transcript: None,
            pending_connect: None,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            close_reply: None,
            closing_deadline: None,
            user_disconnect: false,
            reconnect_at: None,
            last_attempt: None,
            finished: false,
            config,
            env,
        };
        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!("[{}] 工作階段啟動", self.config.name);
        if self.ctx.settings.client.var_autoload {
            if let Err(e) = self.ctx.load_snapshot() {
                warn!("[{}] 讀取存檔失敗: {}", self.config.name, e);
                self.ctx.warning(format!("讀取存檔失敗: {}", e));
            }
        }
        if self.config.auto_connect {
            self.start_connect(false, None);
        }

        while !self.finished {
            let timer_deadline = self.ctx.timers.next_deadline();
            let read_size = self.ctx.settings.client.read_buffer_size;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("[{}] 收到取消，立即結束", self.config.name);
                    self.stream = None;
                    self.finish(CloseOutcome::TimedOut);
                }
                Some(request) = self.requests.recv() => self.on_request(request).await,
                result = read_stream(&mut self.stream, &mut self.read_buf, read_size) => self.on_read(result).await,
                joined = join_connect(&mut self.pending_connect) => self.on_connected(joined).await,
                _ = sleep_until_opt(self.closing_deadline) => {
                    warn!("[{}] 等待伺服器斷線逾時，強制關閉", self.config.name);
                    self.teardown(CloseOutcome::TimedOut);
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect(false, None);
                }
                _ = sleep_until_opt(timer_deadline) => self.fire_timers(),
            }
            self.after_step().await;
        }
        info!("[{}] 工作階段結束", self.config.name);
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Connect(reply) => self.start_connect(true, Some(reply)),
            Request::Disconnect(reply) => self.start_disconnect(Some(reply)).await,
            Request::Send(text) => {
                self.ctx.last_active = Instant::now();
                self.run_commands(&text, None).await;
            }
            Request::Execute { command, reply } => {
                self.ctx.last_active = Instant::now();
                self.run_commands(&command, Some(reply)).await;
            }
            Request::WaitFor { rule, reply } => self.ctx.add_waiter(rule, reply),
            Request::Resize { width, height } => {
                if let Some(report) = self.negotiator.resize(width, height) {
                    self.write(&report).await;
                }
            }
            Request::With(f) => f(&mut self.ctx),
            Request::Close(reply) => {
                self.close_reply = Some(reply);
                match self.ctx.state {
                    ConnectionState::Connected => self.start_disconnect(None).await,
                    ConnectionState::Closing => {}
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        self.finish(CloseOutcome::NotConnected)
                    }
                }
            }
        }
    }

    /// 每一步之後執行回呼要求的控制操作並送出排隊的命令
    ///
    /// 最後清掉規則已不存在或已逾時的 `wait_for`。
    async fn after_step(&mut self) {
        while !self.finished {
            let controls = std::mem::take(&mut self.ctx.controls);
            if let Some(command) = self.ctx.outbox.pop_front() {
                self.apply_controls(controls).await;
                self.run_commands(&command, None).await;
            } else if !controls.is_empty() {
                self.apply_controls(controls).await;
            } else {
                break;
            }
        }
        self.ctx.prune_waiters();
    }

    async fn apply_controls(&mut self, controls: Vec<Control>) {
        for control in controls {
            match control {
                Control::Connect => {
                    let (reply, mut rx) = oneshot::channel();
                    self.start_connect(true, Some(reply));
                    if let Ok(Err(e)) = rx.try_recv() {
                        self.ctx.warning(e.to_string());
                    }
                }
                Control::Disconnect => self.start_disconnect(None).await,
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.ctx.state == state {
            return;
        }
        debug!("[{}] 狀態 {} -> {}", self.config.name, self.ctx.state, state);
        self.ctx.state = state;
        self.state_tx.send_replace(state);
        self.ctx.events.emit(SessionEvent::State(state));
    }

    /// 開始連線，手動連線在重連間隔內會被拒絕
    ///
    /// 失敗時透過 `reply` 回報；連線中則加入等待名單，等連線結果一起回覆。
    fn start_connect(&mut self, manual: bool, reply: Option<oneshot::Sender<Result<(), SessionError>>>) {
        match self.ctx.state {
            ConnectionState::Connected | ConnectionState::Closing => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SessionError::AlreadyConnected));
                }
                return;
            }
            ConnectionState::Connecting => {
                self.connect_waiters.extend(reply);
                return;
            }
            ConnectionState::Disconnected => {}
        }

        let wait = self.ctx.settings.client.reconnect_wait();
        if manual {
            if let Some(last) = self.last_attempt {
                let elapsed = last.elapsed();
                if elapsed < wait {
                    let remaining = wait - elapsed;
                    debug!("[{}] 重連過於頻繁，尚需等待 {:?}", self.config.name, remaining);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(SessionError::Throttled(remaining)));
                    }
                    return;
                }
            }
        }

        self.reconnect_at = None;
        self.user_disconnect = false;
        self.last_attempt = Some(Instant::now());
        self.connect_waiters.extend(reply);
        self.set_state(ConnectionState::Connecting);
        self.ctx.info(format!("正在連線到 {}:{}", self.config.host, self.config.port));

        let connector = Arc::clone(&self.env.connector);
        let host = self.config.host.clone();
        let port = self.config.port;
        let limit = self.ctx.settings.client.connect_timeout();
        self.pending_connect = Some(tokio::spawn(async move {
            timeout(limit, connector.connect(&host, port))
                .await
                .map_err(|_| TransportError::Timeout)?
        }));
    }

    async fn on_connected(&mut self, joined: Result<ConnectResult, JoinError>) {
        self.pending_connect = None;
        let result = joined.unwrap_or_else(|e| Err(TransportError::ConnectionFailed(io::Error::other(e))));
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("[{}] 連線失敗: {}", self.config.name, e);
                self.ctx.error(format!("連線失敗: {}", e));
                self.set_state(ConnectionState::Disconnected);
                let e = SessionError::from(e);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                self.schedule_reconnect();
                return;
            }
        };

        let encoding = self.ctx.encoding;
        let mut config = self.ctx.settings.negotiator_config(encoding);
        config.window_size = self.negotiator.window_size();
        self.negotiator = OptionNegotiator::new(config);
        self.decoder = StreamDecoder::new(encoding);
        self.assembler = LineAssembler::new(self.ctx.settings.client.tabstop);
        self.read_buf.clear();
        self.stream = Some(stream);
        self.set_state(ConnectionState::Connected);
        self.ctx.info(format!("已連線到 {}:{}", self.config.host, self.config.port));
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if let Some(dir) = self.ctx.settings.client.log_dir.clone() {
            let format = self.ctx.settings.client.log_format;
            let path = Transcript::path_for(&dir, &self.config.name, format);
            match Transcript::open(&path, format) {
                Ok(transcript) => self.transcript = Some(transcript),
                Err(e) => {
                    warn!("[{}] 無法開啟記錄檔 {}: {}", self.config.name, path.display(), e);
                    self.ctx.warning(format!("無法開啟記錄檔: {}", e));
                }
            }
        }

        let offer = self.negotiator.start();
        if !offer.is_empty() {
            self.write(&offer).await;
        }
        if let Some(command) = self.config.after_connect.clone() {
            self.ctx.send(command);
        }
    }

    /// 主動斷線：關閉寫入端並等待伺服器關閉連線
    async fn start_disconnect(&mut self, reply: Option<oneshot::Sender<CloseOutcome>>) {
        self.reconnect_at = None;
        match self.ctx.state {
            ConnectionState::Disconnected => {
                if let Some(reply) = reply {
                    let _ = reply.send(CloseOutcome::NotConnected);
                }
            }
            ConnectionState::Connecting => {
                if let Some(task) = self.pending_connect.take() {
                    task.abort();
                }
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(SessionError::Cancelled));
                }
                self.set_state(ConnectionState::Disconnected);
                if let Some(reply) = reply {
                    let _ = reply.send(CloseOutcome::NotConnected);
                }
            }
            ConnectionState::Closing => self.disconnect_waiters.extend(reply),
            ConnectionState::Connected => {
                self.disconnect_waiters.extend(reply);
                self.user_disconnect = true;
                self.set_state(ConnectionState::Closing);
                if let Some(stream) = self.stream.as_mut() {
                    if let Err(e) = stream.shutdown().await {
                        debug!("[{}] 關閉寫入端失敗: {}", self.config.name, e);
                    }
                }
                self.closing_deadline = Some(Instant::now() + self.ctx.settings.client.disconnect_timeout());
            }
        }
    }

    async fn on_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                if self.ctx.state == ConnectionState::Closing {
                    debug!("[{}] 伺服器已確認斷線", self.config.name);
                } else {
                    info!("[{}] 伺服器關閉了連線", self.config.name);
                    self.ctx.info("伺服器關閉了連線");
                    self.set_state(ConnectionState::Closing);
                }
                self.teardown(CloseOutcome::Acknowledged);
            }
            Ok(n) => {
                trace!("[{}] 收到 {} 位元組: {:?}", self.config.name, n, &self.read_buf[..]);
                let chunk = self.read_buf.split();
                self.on_data(&chunk).await;
            }
            Err(e) => {
                error!("[{}] 讀取失敗: {}", self.config.name, e);
                self.ctx.error(format!("連線中斷: {}", e));
                self.set_state(ConnectionState::Closing);
                self.teardown(CloseOutcome::Acknowledged);
            }
        }
    }

    async fn on_data(&mut self, chunk: &[u8]) {
        let negotiated = self.negotiator.feed(chunk);
        if !negotiated.replies.is_empty() {
            self.write(&negotiated.replies).await;
        }

        let data = negotiated.data;
        let mut start = 0;
        let mut gmcp = Vec::new();
        let mut charset = None;
        for event in negotiated.events {
            match event {
                NegotiationEvent::GoAhead { offset } => {
                    self.feed_text(&data[start..offset]);
                    start = offset;
                    if let Some(prompt) = self.assembler.flush_prompt() {
                        self.on_line(prompt);
                    }
                }
                NegotiationEvent::Gmcp { package, payload } => gmcp.push((package, payload)),
                NegotiationEvent::ServerStatus(table) => {
                    debug!("[{}] 收到 MSSP，共 {} 項", self.config.name, table.len());
                    self.ctx.server_status = table;
                }
                NegotiationEvent::Charset(label) => charset = Some(label),
                NegotiationEvent::StateChanged { side, option, state } => {
                    debug!("[{}] 選項 {:?} ({:?}) 狀態改為 {:?}", self.config.name, option, side, state);
                }
                NegotiationEvent::Violation(reason) => {
                    warn!("[{}] 協商錯誤: {}", self.config.name, reason);
                }
            }
        }
        self.feed_text(&data[start..]);

        if let Some(label) = charset {
            match TextEncoding::from_label(&label) {
                Some(encoding) if encoding != self.ctx.encoding => {
                    info!("[{}] 伺服器要求切換編碼為 {}", self.config.name, encoding.label());
                    self.decoder.set_encoding(encoding);
                    self.ctx.encoding = encoding;
                    self.ctx.info(format!("編碼已切換為 {}", encoding.label()));
                }
                Some(_) => {}
                None => warn!("[{}] 不支援的字元集 {}", self.config.name, label),
            }
        }

        for (package, payload) in gmcp {
            if self.ctx.ignore_triggers {
                continue;
            }
            for matched in self.ctx.rules.on_gmcp(&package, &payload, EvalMode::Live) {
                self.ctx.dispatch(matched);
            }
        }
    }

    fn feed_text(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let text = self.decoder.feed(bytes);
        for line in self.assembler.feed(&text) {
            self.on_line(line);
        }
    }

    /// 一行完成：記錄、比對觸發器、送往渲染端
    ///
    /// 觸發器在顯示前執行，可以隱藏或取代這一行；記錄檔保留伺服器送來的原文。
    fn on_line(&mut self, line: DecodedLine) {
        let text = line.text();
        let raw = line.to_ansi();
        self.ctx.vars.set("%line", text.clone().into());
        self.ctx.vars.set("%raw", raw.clone().into());
        if let Some(transcript) = self.transcript.as_mut() {
            if let Err(e) = transcript.write_line(&line) {
                warn!("[{}] 寫入記錄檔失敗: {}", self.config.name, e);
                self.transcript = None;
            }
        }

        if !self.ctx.ignore_triggers {
            self.ctx.editing = true;
            for matched in self.ctx.rules.on_raw_line(&text, &raw, EvalMode::Live) {
                self.ctx.dispatch(matched);
            }
            self.ctx.editing = false;
        }
        let line = match self.ctx.line_edit.take() {
            None => line,
            Some(LineEdit::Gag) => {
                trace!("[{}] 隱藏: {}", self.config.name, text);
                return;
            }
            Some(LineEdit::Replace(replacement)) => DecodedLine {
                prompt: line.prompt,
                ..DecodedLine::from_ansi(&replacement)
            },
        };
        self.ctx.scrollback.push(line.clone());
        self.ctx.events.emit(SessionEvent::Line(line));
    }

    fn fire_timers(&mut self) {
        for due in self.ctx.timers.take_due(Instant::now()) {
            trace!("[{}] 定時器 {} 觸發", self.config.name, due.id);
            due.fire(&mut self.ctx);
        }
    }

    /// 處理一段使用者輸入
    ///
    /// 依分隔字串切開後逐一處理：內建命令、別名、或直接送出。
    /// 別名展開出的命令排在剩餘命令之前，深度超過 `max_recursion` 時丟棄。
    async fn run_commands(&mut self, text: &str, mut reply: Option<ExecReply>) {
        let separator = self.ctx.settings.client.separator.clone();
        let prefix = self.ctx.settings.client.command_prefix;
        let max_depth = self.ctx.settings.client.max_recursion;
        let mut queue: VecDeque<(String, usize)> =
            split_commands(text, &separator).into_iter().map(|c| (c, 0)).collect();

        while let Some((command, depth)) = queue.pop_front() {
            if self.finished {
                break;
            }
            if depth > max_depth {
                warn!("[{}] 命令展開超過 {} 層，已丟棄: {}", self.config.name, max_depth, command);
                self.ctx.error(format!("命令展開超過 {} 層，可能是別名循環: {}", max_depth, command));
                continue;
            }

            if let Some(builtin) = command.strip_prefix(prefix) {
                match commands::run(&mut self.ctx, builtin) {
                    Builtin::Done => {}
                    Builtin::Wait(delay) => {
                        let rest: Vec<String> = queue.drain(..).map(|(c, _)| c).collect();
                        if !rest.is_empty() {
                            let handle = self.ctx.handle();
                            let rest = rest.join(&separator);
                            self.ctx.spawn(format!("wait {:?}", delay), async move {
                                tokio::time::sleep(delay).await;
                                let _ = handle.send(rest);
                            });
                        }
                    }
                    Builtin::Repeat(count, repeated) => {
                        let interval = self.ctx.settings.client.repeat_interval();
                        if interval.is_zero() {
                            for _ in 0..count {
                                queue.push_front((repeated.clone(), depth + 1));
                            }
                        } else {
                            // 第一次立即執行，其餘每隔 interval 送出一次
                            queue.push_front((repeated.clone(), depth + 1));
                            if count > 1 {
                                let handle = self.ctx.handle();
                                self.ctx.spawn(format!("#{} {}", count, repeated), async move {
                                    for _ in 1..count {
                                        tokio::time::sleep(interval).await;
                                        if handle.send(repeated.clone()).is_err() {
                                            break;
                                        }
                                    }
                                });
                            }
                        }
                    }
                }
            } else {
                let scope = Scope {
                    session: &self.ctx.vars,
                    global: &self.ctx.globals,
                };
                match self.ctx.rules.on_outbound(&command, &scope) {
                    Outbound::Transmit(expanded) => self.transmit(expanded.wire()).await,
                    Outbound::Aliased(matched, expanded) => {
                        match matched.action.clone() {
                            RuleAction::None => {}
                            RuleAction::Send(_) => {
                                for sub in split_commands(expanded.wire(), &separator).into_iter().rev() {
                                    queue.push_front((sub, depth + 1));
                                }
                            }
                            RuleAction::Callback(callback) => {
                                if let Err(e) = callback.invoke(&matched, &mut self.ctx) {
                                    warn!("[{}] 別名 {} 的回呼執行失敗: {}", self.config.name, matched.rule_id, e);
                                    self.ctx
                                        .warning(format!("別名 {} 的回呼執行失敗: {}", matched.rule_id, e));
                                }
                            }
                            RuleAction::Handler(handler) => {
                                let (wire, args) = expanded.into_parts();
                                let call = CommandCall {
                                    rule_id: matched.rule_id.clone(),
                                    command: wire,
                                    args,
                                };
                                self.ctx.spawn_handler(handler, call, reply.take());
                            }
                        }
                        self.ctx.notify_waiters(&matched);
                    }
                }
            }

            // 回呼送出的命令緊接在目前命令之後
            let produced: Vec<String> = self.ctx.outbox.drain(..).collect();
            for produced in produced.into_iter().rev() {
                for sub in split_commands(&produced, &separator).into_iter().rev() {
                    queue.push_front((sub, depth + 1));
                }
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(Ok(None));
        }
    }

    async fn transmit(&mut self, command: &str) {
        if self.ctx.state != ConnectionState::Connected {
            debug!("[{}] 未連線，捨棄命令: {}", self.config.name, command);
            self.ctx.warning(format!("未連線，無法送出: {}", command));
            return;
        }
        let mut line = String::with_capacity(command.len() + 2);
        line.push_str(command);
        line.push_str(&self.ctx.settings.server.newline);
        let bytes = encode(&line, self.ctx.encoding);
        debug!("[{}] 送出: {}", self.config.name, command);
        self.write(&bytes).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let result = match stream.write_all(bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("[{}] 寫入失敗: {}", self.config.name, e);
            self.ctx.error(format!("連線中斷: {}", e));
            self.set_state(ConnectionState::Closing);
            self.teardown(CloseOutcome::Acknowledged);
        }
    }

    /// 連線已結束：送出殘留內容、存檔並視情況排定重連
    fn teardown(&mut self, outcome: CloseOutcome) {
        let rest = self.decoder.finish();
        for line in self.assembler.feed(&rest) {
            self.on_line(line);
        }
        if let Some(line) = self.assembler.finish() {
            self.on_line(line);
        }

        self.stream = None;
        self.read_buf.clear();
        self.closing_deadline = None;
        if let Some(mut transcript) = self.transcript.take() {
            if let Err(e) = transcript.close() {
                warn!("[{}] 關閉記錄檔失敗: {}", self.config.name, e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.ctx.info("連線已關閉");
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(outcome);
        }

        if self.ctx.settings.client.var_autosave {
            if let Err(e) = self.ctx.save_snapshot() {
                warn!("[{}] 自動存檔失敗: {}", self.config.name, e);
                self.ctx.warning(format!("自動存檔失敗: {}", e));
            }
        }

        if self.close_reply.is_some() {
            self.finish(outcome);
            return;
        }
        if !self.user_disconnect {
            self.schedule_reconnect();
        }
        self.user_disconnect = false;
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.close_reply.is_some() {
            return;
        }
        let wait = self.ctx.settings.client.reconnect_wait();
        info!("[{}] {:?} 後自動重連", self.config.name, wait);
        self.ctx.info(format!("{} 秒後自動重連", wait.as_secs()));
        self.reconnect_at = Some(Instant::now() + wait);
    }

    /// 結束工作階段，所有等待中的操作得到取消
    fn finish(&mut self, outcome: CloseOutcome) {
        if let Some(task) = self.pending_connect.take() {
            task.abort();
        }
        self.stream = None;
        self.transcript = None;
        self.reconnect_at = None;
        self.closing_deadline = None;
        self.ctx.cancel_all();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(outcome);
        }
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(outcome);
        }
        self.set_state(ConnectionState::Disconnected);
        self.ctx.events.emit(SessionEvent::Closed);
        self.finished = true;
    }
}

async fn read_stream(stream: &mut Option<BoxedStream>, buf: &mut BytesMut, size: usize) -> io::Result<usize> {
    match stream {
        Some(stream) => {
            buf.reserve(size);
            stream.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

async fn join_connect(task: &mut Option<JoinHandle<ConnectResult>>) -> Result<ConnectResult, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
