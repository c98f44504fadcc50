//! 工作階段排程器
//!
//! 持有所有工作階段，輪流把它們的事件交給渲染端，並執行全域定時器與
//! 固定週期的 tick。外部透過 `SchedulerHandle` 操作。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::DecodedLine;
use crate::session::{
    self, CloseOutcome, ConnectionState, Connector, SessionEnv, SessionError, SessionEvent, SessionHandle,
    StatusMessage,
};
use crate::settings::{SessionConfig, Settings};
use crate::snapshot::CallbackRegistry;
use crate::timer::{TimerCallback, TimerInfo, TimerQueue};
use crate::variables::GlobalVariables;

/// 每個工作階段每一輪最多交出的事件數
const EVENT_BATCH: usize = 64;

/// 排程器錯誤
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("工作階段 {0} 已存在")]
    DuplicateSession(String),

    #[error("找不到工作階段 {0}")]
    UnknownSession(String),

    #[error("排程器已停止")]
    Stopped,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// 顯示端
///
/// 只有 `line` 必須實作，其他事件預設忽略。
pub trait Renderer: Send {
    fn line(&mut self, session: &str, line: &DecodedLine);

    fn pin(&mut self, _session: &str, _pin: Option<usize>) {}

    fn state(&mut self, _session: &str, _state: ConnectionState) {}

    fn status(&mut self, _session: &str, _message: &StatusMessage) {}

    /// 工作階段已結束並從排程器移除
    fn closed(&mut self, _session: &str) {}
}

/// 固定週期執行的回呼
pub trait TickCallback: Send + Sync {
    fn tick(&self, scheduler: &mut SchedulerContext);
}

impl<F> TickCallback for F
where
    F: Fn(&mut SchedulerContext) + Send + Sync,
{
    fn tick(&self, scheduler: &mut SchedulerContext) {
        self(scheduler)
    }
}

/// 全域定時器與 tick 回呼可操作的狀態
pub struct SchedulerContext {
    sessions: BTreeMap<String, SessionHandle>,
    globals: GlobalVariables,
    timers: TimerQueue<SchedulerContext>,
    handle: SchedulerHandle,
}

impl SchedulerContext {
    pub fn session(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.get(name).cloned()
    }

    /// 依名稱排序的工作階段清單
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    pub fn add_timer(
        &mut self,
        period: Duration,
        repeat: bool,
        callback: impl TimerCallback<SchedulerContext> + 'static,
    ) -> String {
        self.timers.add(period, repeat, Arc::new(callback))
    }

    pub fn cancel_timer(&mut self, id: &str) -> bool {
        self.timers.cancel(id)
    }

    pub fn timers(&self) -> Vec<TimerInfo> {
        self.timers.list()
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }
}

type SchedulerTimer = Arc<dyn TimerCallback<SchedulerContext>>;

pub(crate) enum SchedulerRequest {
    CreateSession(SessionConfig, oneshot::Sender<Result<SessionHandle, SchedulerError>>),
    Session(String, oneshot::Sender<Option<SessionHandle>>),
    Sessions(oneshot::Sender<Vec<String>>),
    CloseSession(String, oneshot::Sender<Result<CloseOutcome, SchedulerError>>),
    AddTimer {
        period: Duration,
        repeat: bool,
        callback: SchedulerTimer,
        reply: oneshot::Sender<String>,
    },
    CancelTimer(String, oneshot::Sender<bool>),
    AddTick(Arc<dyn TickCallback>),
    Shutdown(oneshot::Sender<()>),
}

/// 排程器的控制代碼
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerRequest>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("stopped", &self.tx.is_closed())
            .finish()
    }
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerRequest,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// 建立工作階段，名稱不可重複
    pub async fn create_session(&self, config: SessionConfig) -> Result<SessionHandle, SchedulerError> {
        self.request(|reply| SchedulerRequest::CreateSession(config, reply))
            .await?
    }

    pub async fn session(&self, name: &str) -> Result<Option<SessionHandle>, SchedulerError> {
        let name = name.to_string();
        self.request(|reply| SchedulerRequest::Session(name, reply)).await
    }

    pub async fn sessions(&self) -> Result<Vec<String>, SchedulerError> {
        self.request(SchedulerRequest::Sessions).await
    }

    /// 關閉工作階段，已連線時等待斷線完成
    pub async fn close_session(&self, name: &str) -> Result<CloseOutcome, SchedulerError> {
        let name = name.to_string();
        self.request(|reply| SchedulerRequest::CloseSession(name, reply))
            .await?
    }

    pub async fn add_timer(
        &self,
        period: Duration,
        repeat: bool,
        callback: impl TimerCallback<SchedulerContext> + 'static,
    ) -> Result<String, SchedulerError> {
        let callback: SchedulerTimer = Arc::new(callback);
        self.request(|reply| SchedulerRequest::AddTimer {
            period,
            repeat,
            callback,
            reply,
        })
        .await
    }

    pub async fn cancel_timer(&self, id: &str) -> Result<bool, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| SchedulerRequest::CancelTimer(id, reply)).await
    }

    pub fn add_tick(&self, callback: impl TickCallback + 'static) -> Result<(), SchedulerError> {
        self.tx
            .send(SchedulerRequest::AddTick(Arc::new(callback)))
            .map_err(|_| SchedulerError::Stopped)
    }

    /// 關閉所有工作階段後停止排程器
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(SchedulerRequest::Shutdown).await
    }
}

struct SessionEntry {
    name: String,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

/// 工作階段排程器
pub struct Scheduler<R: Renderer> {
    renderer: R,
    env: SessionEnv,
    entries: Vec<SessionEntry>,
    ctx: SchedulerContext,
    ticks: Vec<Arc<dyn TickCallback>>,
    tick_interval: Duration,
    requests: mpsc::UnboundedReceiver<SchedulerRequest>,
    wake: Arc<Notify>,
    shutdown: Option<Vec<oneshot::Sender<()>>>,
}

impl<R: Renderer> Scheduler<R> {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>, renderer: R) -> Self {
        let tick_interval = settings.client.tick_interval();
        let env = SessionEnv::new(settings, connector);
        let (tx, requests) = mpsc::unbounded_channel();
        let handle = SchedulerHandle { tx };
        let wake = Arc::clone(&env.wake);
        Self {
            renderer,
            ctx: SchedulerContext {
                sessions: BTreeMap::new(),
                globals: env.globals.clone(),
                timers: TimerQueue::new(),
                handle,
            },
            env,
            entries: Vec::new(),
            ticks: Vec::new(),
            tick_interval,
            requests,
            wake,
            shutdown: None,
        }
    }

    /// 以名稱解析快照中的回呼
    pub fn with_callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.env = self.env.with_callbacks(callbacks);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.ctx.handle.clone()
    }

    pub fn globals(&self) -> GlobalVariables {
        self.ctx.globals.clone()
    }

    /// 執行到 `shutdown` 完成，返回渲染端
    pub async fn run(mut self) -> R {
        info!("排程器啟動");
        let period = self.tick_interval.max(Duration::from_millis(1));
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.drain_events();
            if self.entries.is_empty() {
                if let Some(waiters) = self.shutdown.take() {
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                    break;
                }
            }

            let deadline = self.ctx.timers.next_deadline();
            tokio::select! {
                _ = self.wake.notified() => {}
                Some(request) = self.requests.recv() => self.on_request(request),
                _ = tick.tick() => self.on_tick(),
                _ = sleep_until_opt(deadline) => self.fire_timers(),
            }
        }
        self.env.cancel.cancel();
        info!("排程器已停止");
        self.renderer
    }

    /// 輪流交出每個工作階段的事件，每輪每個最多 `EVENT_BATCH` 個
    fn drain_events(&mut self) {
        let mut more = false;
        let mut finished = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let mut count = 0;
            while count < EVENT_BATCH {
                match entry.events.try_recv() {
                    Ok(event) => {
                        count += 1;
                        if render(&mut self.renderer, &entry.name, event) {
                            finished.push(index);
                            break;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        finished.push(index);
                        break;
                    }
                }
            }
            if count == EVENT_BATCH {
                more = true;
            }
        }

        for index in finished.into_iter().rev() {
            let entry = self.entries.remove(index);
            debug!("移除工作階段 {}", entry.name);
            self.ctx.sessions.remove(&entry.name);
            entry.task.abort();
            self.renderer.closed(&entry.name);
        }
        if more {
            self.wake.notify_one();
        }
    }

    fn on_request(&mut self, request: SchedulerRequest) {
        match request {
            SchedulerRequest::CreateSession(config, reply) => {
                let _ = reply.send(self.create_session(config));
            }
            SchedulerRequest::Session(name, reply) => {
                let _ = reply.send(self.ctx.session(&name));
            }
            SchedulerRequest::Sessions(reply) => {
                let _ = reply.send(self.ctx.sessions());
            }
            SchedulerRequest::CloseSession(name, reply) => match self.ctx.session(&name) {
                Some(handle) => {
                    tokio::spawn(async move {
                        let _ = reply.send(handle.close().await.map_err(SchedulerError::from));
                    });
                }
                None => {
                    let _ = reply.send(Err(SchedulerError::UnknownSession(name)));
                }
            },
            SchedulerRequest::AddTimer {
                period,
                repeat,
                callback,
                reply,
            } => {
                let _ = reply.send(self.ctx.timers.add(period, repeat, callback));
            }
            SchedulerRequest::CancelTimer(id, reply) => {
                let _ = reply.send(self.ctx.timers.cancel(&id));
            }
            SchedulerRequest::AddTick(callback) => self.ticks.push(callback),
            SchedulerRequest::Shutdown(reply) => {
                if self.shutdown.is_none() {
                    info!("關閉所有工作階段 ({} 個)", self.entries.len());
                    for entry in &self.entries {
                        let handle = entry.handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle.close().await {
                                debug!("工作階段 {} 關閉: {}", handle.name(), e);
                            }
                        });
                    }
                    self.ctx.timers.clear();
                    self.ticks.clear();
                }
                self.shutdown.get_or_insert_with(Vec::new).push(reply);
            }
        }
    }

    fn create_session(&mut self, config: SessionConfig) -> Result<SessionHandle, SchedulerError> {
        if self.shutdown.is_some() {
            return Err(SchedulerError::Stopped);
        }
        if self.ctx.sessions.contains_key(&config.name) {
            warn!("工作階段 {} 已存在", config.name);
            return Err(SchedulerError::DuplicateSession(config.name));
        }
        let name = config.name.clone();
        let spawned = session::spawn(config, self.env.clone());
        info!("建立工作階段 {}", name);
        self.ctx.sessions.insert(name.clone(), spawned.handle.clone());
        self.entries.push(SessionEntry {
            name,
            handle: spawned.handle.clone(),
            events: spawned.events,
            task: spawned.task,
        });
        Ok(spawned.handle)
    }

    fn on_tick(&mut self) {
        for callback in self.ticks.clone() {
            callback.tick(&mut self.ctx);
        }
    }

    fn fire_timers(&mut self) {
        for due in self.ctx.timers.take_due(Instant::now()) {
            due.fire(&mut self.ctx);
        }
    }
}

/// 把事件交給渲染端，返回工作階段是否已結束
fn render<R: Renderer>(renderer: &mut R, session: &str, event: SessionEvent) -> bool {
    match event {
        SessionEvent::Line(line) => renderer.line(session, &line),
        SessionEvent::Pin(pin) => renderer.pin(session, pin),
        SessionEvent::State(state) => renderer.state(session, state),
        SessionEvent::Status(message) => renderer.status(session, &message),
        SessionEvent::Closed => return true,
    }
    false
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
