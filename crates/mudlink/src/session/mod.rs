//! 工作階段
//!
//! 每個工作階段是一個獨立的 tokio 任務，擁有自己的協商器、解碼器、行緩衝、
//! 規則表與變數表。外部只能透過 `SessionHandle` 送出請求，所有狀態都只在
//! 工作階段自己的任務中修改。
//!
//! 狀態機：`Disconnected -> Connecting -> Connected -> Closing -> Disconnected`

mod actor;
mod commands;
mod context;
mod handle;
mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::DecodedLine;
use crate::rule::{CallbackError, RuleError, RuleMatch};
use crate::settings::{SessionConfig, Settings};
use crate::snapshot::CallbackRegistry;
use crate::variables::GlobalVariables;

pub use context::{SessionContext, TaskInfo};
pub use handle::SessionHandle;
pub use transport::{BoxedStream, ConnectFuture, Connector, MudStream, TcpConnector, TransportError};

#[cfg(test)]
pub(crate) use transport::testing;

/// 連線狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 等待伺服器確認斷線
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "未連線",
            ConnectionState::Connecting => "連線中",
            ConnectionState::Connected => "已連線",
            ConnectionState::Closing => "斷線中",
        };
        f.write_str(name)
    }
}

/// 狀態訊息等級
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// 給使用者看的狀態訊息，不進入歷史緩衝區也不比對觸發器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub text: String,
}

/// 工作階段送往渲染端的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Line(DecodedLine),
    /// 分割檢視的釘選位置改變
    Pin(Option<usize>),
    State(ConnectionState),
    Status(StatusMessage),
    /// 工作階段已結束，之後不會再有事件
    Closed,
}

/// `wait_for` 的結果
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Matched(RuleMatch),
    TimedOut,
    /// 工作階段關閉或規則被移除
    Cancelled,
}

/// 主動斷線的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// 伺服器在等待時間內關閉了連線
    Acknowledged,
    /// 等待逾時，強制關閉
    TimedOut,
    /// 原本就沒有連線
    NotConnected,
}

/// 工作階段錯誤
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("工作階段已關閉")]
    Closed,

    #[error("未連線")]
    NotConnected,

    #[error("已連線或正在連線")]
    AlreadyConnected,

    #[error("重連過於頻繁，請於 {0:?} 後再試")]
    Throttled(Duration),

    #[error(transparent)]
    Transport(Arc<TransportError>),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("回呼執行失敗: {0}")]
    Callback(#[from] CallbackError),

    #[error("操作已取消")]
    Cancelled,

    #[error("操作逾時")]
    Timeout,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(Arc::new(e))
    }
}

/// 事件出口，送出後喚醒排程器
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    wake: Arc<Notify>,
}

impl EventSink {
    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_ok() {
            self.wake.notify_one();
        }
    }
}

/// 建立工作階段需要的共用資源
#[derive(Clone)]
pub struct SessionEnv {
    pub settings: Arc<Settings>,
    pub globals: GlobalVariables,
    pub connector: Arc<dyn Connector>,
    pub callbacks: Arc<CallbackRegistry>,
    /// 有新事件時通知
    pub wake: Arc<Notify>,
    /// 父層取消權杖，取消時所有工作階段立即結束
    pub cancel: CancellationToken,
}

impl SessionEnv {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings: Arc::new(settings),
            globals: GlobalVariables::new(),
            connector,
            callbacks: Arc::new(CallbackRegistry::new()),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_globals(mut self, globals: GlobalVariables) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }
}

/// 啟動後的工作階段
pub struct SpawnedSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

/// 建立工作階段任務
///
/// `config.auto_connect` 為真時立即開始連線。
pub fn spawn(config: SessionConfig, env: SessionEnv) -> SpawnedSession {
    let (event_tx, events) = mpsc::unbounded_channel();
    let sink = EventSink {
        tx: event_tx,
        wake: Arc::clone(&env.wake),
    };
    let (handle, task) = actor::SessionActor::spawn(config, env, sink);
    SpawnedSession {
        handle,
        events,
        task,
    }
}

#[cfg(test)]
mod tests;
