//! 工作階段的對外介面

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use super::context::{SessionContext, TaskInfo};
use super::{CloseOutcome, ConnectionState, SessionError, StatusLevel, WaitOutcome};
use crate::alias::split_commands;
use crate::rule::{RuleError, RuleId, RuleInfo, RuleKind, RuleSpec};
use crate::snapshot::SessionSnapshot;
use crate::value::Value;

pub(crate) type ExecReply = oneshot::Sender<Result<Option<Value>, SessionError>>;

type ContextFn = Box<dyn FnOnce(&mut SessionContext) + Send>;

/// 送往工作階段任務的請求
pub(crate) enum Request {
    Connect(oneshot::Sender<Result<(), SessionError>>),
    Disconnect(oneshot::Sender<CloseOutcome>),
    /// 依序處理的使用者輸入
    Send(String),
    /// 處理單一命令並回報別名處理器的結果
    Execute { command: String, reply: ExecReply },
    WaitFor {
        rule: RuleId,
        reply: oneshot::Sender<Result<crate::rule::RuleMatch, SessionError>>,
    },
    Resize { width: u16, height: u16 },
    /// 在工作階段任務中執行
    With(ContextFn),
    Close(oneshot::Sender<CloseOutcome>),
}

/// 可複製的工作階段控制代碼
///
/// 同一個呼叫者送出的請求依序處理。
#[derive(Clone)]
pub struct SessionHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    separator: Arc<str>,
    interval: Duration,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        name: &str,
        tx: mpsc::UnboundedSender<Request>,
        state: watch::Receiver<ConnectionState>,
        separator: &str,
        interval: Duration,
    ) -> Self {
        Self {
            name: Arc::from(name),
            tx,
            state,
            separator: Arc::from(separator),
            interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 工作階段任務是否已結束
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 等到連線狀態符合條件
    pub async fn wait_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub(crate) fn request(&self, request: Request) -> Result<(), SessionError> {
        self.tx.send(request).map_err(|_| SessionError::Closed)
    }

    /// 在工作階段任務中執行閉包並取回結果
    ///
    /// # Example
    /// ```no_run
    /// # async fn demo(handle: mudlink::SessionHandle) -> Result<(), mudlink::SessionError> {
    /// let lines = handle.call(|ctx| ctx.scrollback().len()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut SessionContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.request(Request::With(Box::new(move |ctx| {
            let _ = reply.send(f(ctx));
        })))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// 開始連線並等待結果
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect(reply))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// 主動斷線，等待伺服器關閉連線或逾時
    pub async fn disconnect(&self) -> Result<CloseOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect(reply))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// 送出使用者輸入，不等待結果
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.request(Request::Send(text.into()))
    }

    /// 逐一送出命令並等待每個命令的處理結果
    ///
    /// 命令由別名處理器接手時會等處理器完成，返回最後一個處理器的結果。
    /// 命令之間間隔 `interval_ms`。
    pub async fn send_async(&self, text: &str) -> Result<Option<Value>, SessionError> {
        let mut result = None;
        for (i, command) in split_commands(text, &self.separator).into_iter().enumerate() {
            if i > 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            let (reply, rx) = oneshot::channel();
            self.request(Request::Execute { command, reply })?;
            if let Some(value) = rx.await.map_err(|_| SessionError::Cancelled)?? {
                result = Some(value);
            }
        }
        Ok(result)
    }

    /// 等待規則下一次觸發
    ///
    /// 規則不存在時返回錯誤；工作階段關閉、規則被移除或被同 id 的新規則取代時返回 `Cancelled`。
    pub async fn wait_for(&self, rule: impl Into<RuleId>, limit: Duration) -> Result<WaitOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::WaitFor {
            rule: rule.into(),
            reply,
        })?;
        match timeout(limit, rx).await {
            Ok(Ok(Ok(matched))) => Ok(WaitOutcome::Matched(matched)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Ok(WaitOutcome::Cancelled),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// 通知伺服器新的視窗大小
    pub fn resize(&self, width: u16, height: u16) -> Result<(), SessionError> {
        self.request(Request::Resize { width, height })
    }

    /// 結束工作階段，已連線時先走完斷線等待
    pub async fn close(&self) -> Result<CloseOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Close(reply))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn register_rule(&self, spec: RuleSpec) -> Result<RuleId, SessionError> {
        Ok(self.call(move |ctx| ctx.register_rule(spec)).await??)
    }

    pub async fn remove_rule(&self, id: impl Into<RuleId>) -> Result<bool, SessionError> {
        let id = id.into();
        self.call(move |ctx| ctx.remove_rule(&id)).await
    }

    pub async fn set_rule_enabled(&self, id: impl Into<RuleId>, enabled: bool) -> Result<(), SessionError> {
        let id = id.into();
        Ok(self.call(move |ctx| ctx.rules_mut().set_enabled(&id, enabled)).await??)
    }

    pub async fn set_group_enabled(&self, group: &str, enabled: bool) -> Result<usize, SessionError> {
        let group = group.to_string();
        self.call(move |ctx| ctx.rules_mut().set_group_enabled(&group, enabled))
            .await
    }

    /// 以新的規則取代某個來源的所有規則
    pub async fn reload_source(&self, source: &str, specs: Vec<RuleSpec>) -> Result<Vec<RuleId>, SessionError> {
        let source = source.to_string();
        let result: Result<Vec<RuleId>, RuleError> = self
            .call(move |ctx| ctx.rules_mut().reload_source(&source, specs))
            .await?;
        Ok(result?)
    }

    pub async fn list_rules(&self, kind: Option<RuleKind>) -> Result<Vec<RuleInfo>, SessionError> {
        self.call(move |ctx| ctx.rules().list(kind)).await
    }

    pub async fn set_var(&self, name: &str, value: Value) -> Result<(), SessionError> {
        let name = name.to_string();
        self.call(move |ctx| ctx.set_var(&name, value)).await
    }

    pub async fn get_var(&self, name: &str) -> Result<Option<Value>, SessionError> {
        let name = name.to_string();
        self.call(move |ctx| ctx.var(&name)).await
    }

    pub async fn tasks(&self) -> Result<Vec<TaskInfo>, SessionError> {
        self.call(|ctx| ctx.tasks()).await
    }

    /// 距離上一次使用者命令的時間
    pub async fn idle(&self) -> Result<Duration, SessionError> {
        self.call(|ctx| ctx.idle()).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.call(|ctx| ctx.snapshot()).await
    }

    /// 在工作階段顯示狀態訊息，工作階段已結束時忽略
    pub fn report(&self, level: StatusLevel, text: impl Into<String>) {
        let text = text.into();
        let _ = self.request(Request::With(Box::new(move |ctx| ctx.status(level, text))));
    }
}
