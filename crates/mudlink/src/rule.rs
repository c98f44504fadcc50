//! 規則定義
//!
//! 觸發器、別名與 GMCP 觸發器共用同一種規則結構。規則只持有回呼的不透明
//! handle，由工作階段在比對成功後呼叫。
//!
//! 樣式一律從行首比對（等同在樣式前加上 `^`），`plain` 規則則以字面字串
//! 比對行內任何位置。樣式含有換行時每一段各比對一行，全部依序成立才算觸發。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{SessionContext, SessionHandle};
use crate::value::Value;

/// 未指定時的優先權，數字越小越先比對
pub const DEFAULT_PRIORITY: i32 = 100;

/// 規則識別碼
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 規則種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// 比對伺服器送來的行
    Trigger,
    /// 比對使用者送出的命令
    Alias,
    /// 比對 GMCP 套件名稱
    Gmcp,
}

impl RuleKind {
    /// 自動產生識別碼時使用的縮寫
    pub fn abbr(&self) -> &'static str {
        match self {
            RuleKind::Trigger => "tri",
            RuleKind::Alias => "ali",
            RuleKind::Gmcp => "gmcp",
        }
    }

    /// `id` 是自動編號形式（縮寫加數字）時返回對應的種類
    pub fn of_derived_id(id: &str) -> Option<RuleKind> {
        [RuleKind::Trigger, RuleKind::Alias, RuleKind::Gmcp]
            .into_iter()
            .find(|kind| {
                id.strip_prefix(kind.abbr())
                    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            })
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::Trigger => "Trigger",
            RuleKind::Alias => "Alias",
            RuleKind::Gmcp => "GMCPTrigger",
        };
        f.write_str(name)
    }
}

/// 規則操作錯誤
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    #[error("無效的樣式 `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("找不到規則: {0}")]
    NotFound(RuleId),

    #[error("找不到名為 {0} 的回呼")]
    UnknownCallback(String),
}

/// 使用者回呼執行失敗
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for CallbackError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallbackError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 同步回呼，在工作階段的任務中執行
pub trait RuleCallback: Send + Sync {
    fn invoke(&self, matched: &RuleMatch, session: &mut SessionContext) -> Result<(), CallbackError>;
}

impl<F> RuleCallback for F
where
    F: Fn(&RuleMatch, &mut SessionContext) -> Result<(), CallbackError> + Send + Sync,
{
    fn invoke(&self, matched: &RuleMatch, session: &mut SessionContext) -> Result<(), CallbackError> {
        self(matched, session)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, CallbackError>> + Send>>;

/// 非同步命令處理器，`send_async` 會等它完成
pub trait CommandHandler: Send + Sync {
    fn execute(&self, call: CommandCall, session: SessionHandle) -> HandlerFuture;
}

impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandCall, SessionHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CallbackError>> + Send + 'static,
{
    fn execute(&self, call: CommandCall, session: SessionHandle) -> HandlerFuture {
        Box::pin(self(call, session))
    }
}

/// 傳給命令處理器的參數，`args` 保留變數原本的型別
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCall {
    pub rule_id: RuleId,
    /// 展開變數後準備送出的命令文字
    pub command: String,
    /// 各擷取群組展開後的值
    pub args: Vec<Value>,
}

/// 規則比對成功後的動作
#[derive(Clone, Default)]
pub enum RuleAction {
    #[default]
    None,
    /// 送出命令樣板，`%0`-`%9` 代入擷取群組，`@name` 代入變數
    Send(String),
    Callback(Arc<dyn RuleCallback>),
    Handler(Arc<dyn CommandHandler>),
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::None => f.write_str("None"),
            RuleAction::Send(template) => f.debug_tuple("Send").field(template).finish(),
            RuleAction::Callback(_) => f.write_str("Callback(..)"),
            RuleAction::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// 註冊規則用的描述
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub id: Option<RuleId>,
    pub kind: RuleKind,
    pub pattern: String,
    pub group: String,
    pub priority: i32,
    pub one_shot: bool,
    pub exclusive: bool,
    pub enabled: bool,
    pub source: String,
    pub action: RuleAction,
    /// 以含 ANSI 序列的原始文字比對
    pub raw: bool,
    /// 樣式是字面字串而不是正規表示式
    pub plain: bool,
    /// 回呼在 `CallbackRegistry` 中的名稱，存檔時使用
    pub callback_name: Option<String>,
}

impl RuleSpec {
    pub fn new(kind: RuleKind, pattern: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            pattern: pattern.into(),
            group: String::new(),
            priority: DEFAULT_PRIORITY,
            one_shot: false,
            exclusive: false,
            enabled: true,
            source: String::new(),
            action: RuleAction::None,
            raw: false,
            plain: false,
            callback_name: None,
        }
    }

    pub fn trigger(pattern: impl Into<String>) -> Self {
        Self::new(RuleKind::Trigger, pattern)
    }

    pub fn alias(pattern: impl Into<String>) -> Self {
        Self::new(RuleKind::Alias, pattern)
    }

    pub fn gmcp(package: impl Into<String>) -> Self {
        Self::new(RuleKind::Gmcp, package)
    }

    /// 多行觸發器，每個樣式依序比對連續的一行
    ///
    /// # Example
    /// ```
    /// use mudlink::{EvalMode, RuleEngine, RuleSpec};
    ///
    /// let mut rules = RuleEngine::new();
    /// rules.register(RuleSpec::multiline([r"^你的狀態", r"^HP: (\d+)"])).unwrap();
    /// assert!(rules.on_line("你的狀態如下", EvalMode::Live).is_empty());
    /// let matched = rules.on_line("HP: 80", EvalMode::Live);
    /// assert_eq!(matched[0].group(1), Some("80"));
    /// assert_eq!(matched[0].line, "你的狀態如下\nHP: 80");
    /// ```
    pub fn multiline<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<String> = patterns.into_iter().map(|p| p.as_ref().to_string()).collect();
        Self::trigger(lines.join("\n"))
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(RuleId::new(id));
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// 比對成功後不再評估順位較後的規則
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 比對帶 ANSI 序列的原始行
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// 以字面字串比對行內任何位置
    pub fn plain(mut self) -> Self {
        self.plain = true;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn send(mut self, template: impl Into<String>) -> Self {
        self.action = RuleAction::Send(template.into());
        self
    }

    pub fn callback(mut self, callback: impl RuleCallback + 'static) -> Self {
        self.action = RuleAction::Callback(Arc::new(callback));
        self
    }

    pub fn handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.action = RuleAction::Handler(Arc::new(handler));
        self
    }

    /// 指定動作並記錄回呼名稱
    pub fn named_action(mut self, name: impl Into<String>, action: RuleAction) -> Self {
        self.callback_name = Some(name.into());
        self.action = action;
        self
    }
}

/// 已註冊的規則
#[derive(Debug, Clone)]
pub struct Rule {
    pub(crate) id: RuleId,
    pub(crate) kind: RuleKind,
    pub(crate) pattern: String,
    /// 每一行一個，單行規則只有一個
    pub(crate) regexes: Vec<Regex>,
    pub(crate) group: String,
    pub(crate) priority: i32,
    pub(crate) one_shot: bool,
    pub(crate) exclusive: bool,
    pub(crate) enabled: bool,
    pub(crate) source: String,
    pub(crate) seq: u64,
    pub(crate) action: RuleAction,
    pub(crate) raw: bool,
    pub(crate) plain: bool,
    pub(crate) callback_name: Option<String>,
}

impl Rule {
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn action(&self) -> &RuleAction {
        &self.action
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn is_plain(&self) -> bool {
        self.plain
    }

    /// 需要連續比對的行數
    pub fn line_count(&self) -> usize {
        self.regexes.len()
    }

    pub fn callback_name(&self) -> Option<&str> {
        self.callback_name.as_deref()
    }

    /// 以第一行的樣式比對文字，返回所有擷取群組（第 0 組為整段比對結果，未參與的群組為空字串）
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        self.captures_at(0, text)
    }

    pub(crate) fn captures_at(&self, step: usize, text: &str) -> Option<Vec<String>> {
        self.regexes.get(step).and_then(|regex| captures_of(regex, text))
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id.clone(),
            kind: self.kind,
            pattern: self.pattern.clone(),
            group: self.group.clone(),
            priority: self.priority,
            enabled: self.enabled,
            one_shot: self.one_shot,
            exclusive: self.exclusive,
            raw: self.raw,
            plain: self.plain,
            source: self.source.clone(),
        }
    }
}

/// 編譯樣式，每一行各得到一個正規表示式；任何一行失敗時整個樣式無效
pub(crate) fn compile(pattern: &str, plain: bool) -> Result<Vec<Regex>, RuleError> {
    pattern
        .split('\n')
        .map(|line| compile_line(line, plain))
        .collect::<Result<_, _>>()
        .map_err(|source| RuleError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// 正規表示式固定在行首，字面字串則可出現在任何位置
pub(crate) fn compile_line(line: &str, plain: bool) -> Result<Regex, regex::Error> {
    if plain {
        Regex::new(&regex::escape(line))
    } else {
        Regex::new(&format!("^(?:{})", line))
    }
}

pub(crate) fn captures_of(regex: &Regex, text: &str) -> Option<Vec<String>> {
    regex.captures(text).map(|caps| {
        caps.iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect()
    })
}

/// 一次比對成功的結果
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub kind: RuleKind,
    /// 擷取群組，第 0 組為整段比對結果
    pub captures: Vec<String>,
    /// 完整的行文字；GMCP 規則為 JSON 內容
    pub line: String,
    pub(crate) action: RuleAction,
}

impl RuleMatch {
    /// 第 n 個擷取群組
    pub fn group(&self, n: usize) -> Option<&str> {
        self.captures.get(n).map(String::as_str)
    }

    /// 以 JSON 解析 `line`，供 GMCP 規則使用
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.line).ok()
    }
}

impl PartialEq for RuleMatch {
    fn eq(&self, other: &Self) -> bool {
        self.rule_id == other.rule_id
            && self.kind == other.kind
            && self.captures == other.captures
            && self.line == other.line
    }
}

/// 檢視用的規則摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub id: RuleId,
    pub kind: RuleKind,
    pub pattern: String,
    pub group: String,
    pub priority: i32,
    pub enabled: bool,
    pub one_shot: bool,
    pub exclusive: bool,
    pub raw: bool,
    pub plain: bool,
    pub source: String,
}

impl fmt::Display for RuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}> id = '{}' pattern = '{}' priority = {} enabled = {}",
            self.kind, self.id, self.pattern, self.priority, self.enabled
        )?;
        if !self.group.is_empty() {
            write!(f, " group = '{}'", self.group)?;
        }
        if self.one_shot {
            f.write_str(" oneshot")?;
        }
        if self.exclusive {
            f.write_str(" exclusive")?;
        }
        if self.raw {
            f.write_str(" raw")?;
        }
        if self.plain {
            f.write_str(" plain")?;
        }
        Ok(())
    }
}
