//! 工作階段存檔
//!
//! 存檔包含非暫存變數與規則定義，以 JSON 格式寫入 `<session>.mud.json`。
//! 規則的回呼無法序列化，只記錄在 `CallbackRegistry` 中登記的名稱，
//! 載入時再以名稱找回。

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::RuleEngine;
use crate::rule::{CommandHandler, Rule, RuleAction, RuleCallback, RuleError, RuleKind, RuleSpec, DEFAULT_PRIORITY};
use crate::value::Value;
use crate::variables::VariableStore;

/// 從存檔載入的規則使用的來源名稱
pub const SNAPSHOT_SOURCE: &str = "snapshot";

/// 存檔錯誤
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("讀寫存檔失敗: {0}")]
    Io(#[from] io::Error),

    #[error("存檔格式錯誤: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// 以名稱登記的回呼
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn RuleCallback>>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callback(&mut self, name: impl Into<String>, callback: impl RuleCallback + 'static) {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// 以名稱找出動作，同步回呼優先
    pub fn resolve(&self, name: &str) -> Option<RuleAction> {
        if let Some(callback) = self.callbacks.get(name) {
            return Some(RuleAction::Callback(Arc::clone(callback)));
        }
        self.handlers
            .get(name)
            .map(|h| RuleAction::Handler(Arc::clone(h)))
    }

    /// 依名稱建立規則描述
    pub fn spec(&self, kind: RuleKind, pattern: impl Into<String>, name: &str) -> Result<RuleSpec, RuleError> {
        let action = self
            .resolve(name)
            .ok_or_else(|| RuleError::UnknownCallback(name.to_string()))?;
        Ok(RuleSpec::new(kind, pattern).named_action(name, action))
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 可序列化的規則定義
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub kind: RuleKind,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub plain: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 命令樣板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,
    /// 回呼名稱
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_true() -> bool {
    true
}

impl RuleDefinition {
    /// 無法以名稱找回回呼的規則返回 `None`
    pub fn from_rule(rule: &Rule) -> Option<Self> {
        let send = match rule.action() {
            RuleAction::Send(template) => Some(template.clone()),
            RuleAction::None => None,
            RuleAction::Callback(_) | RuleAction::Handler(_) => {
                rule.callback_name()?;
                None
            }
        };
        Some(Self {
            id: rule.id().to_string(),
            kind: rule.kind(),
            pattern: rule.pattern().to_string(),
            group: rule.group().to_string(),
            priority: rule.priority(),
            one_shot: rule.is_one_shot(),
            exclusive: rule.is_exclusive(),
            raw: rule.is_raw(),
            plain: rule.is_plain(),
            enabled: rule.is_enabled(),
            send,
            callback: rule.callback_name().map(str::to_string),
        })
    }

    pub fn to_spec(&self, registry: &CallbackRegistry) -> Result<RuleSpec, RuleError> {
        let mut spec = match &self.callback {
            Some(name) => registry.spec(self.kind, self.pattern.as_str(), name)?,
            None => RuleSpec::new(self.kind, self.pattern.as_str()),
        };
        if let Some(template) = &self.send {
            spec = spec.send(template.as_str());
        }
        spec.id = Some(self.id.as_str().into());
        spec.group = self.group.clone();
        spec.priority = self.priority;
        spec.one_shot = self.one_shot;
        spec.exclusive = self.exclusive;
        spec.raw = self.raw;
        spec.plain = self.plain;
        spec.enabled = self.enabled;
        Ok(spec)
    }
}

/// 工作階段存檔內容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// 以規則 id 為鍵
    #[serde(default)]
    pub rules: BTreeMap<String, RuleDefinition>,
}

impl SessionSnapshot {
    /// 擷取目前狀態（暫存變數不存）
    pub fn capture(vars: &VariableStore, rules: &RuleEngine) -> Self {
        Self {
            variables: vars.persistent(),
            rules: rules
                .iter()
                .filter_map(RuleDefinition::from_rule)
                .map(|def| (def.id.clone(), def))
                .collect(),
        }
    }

    /// 存檔路徑
    pub fn path_for(dir: &Path, session: &str) -> PathBuf {
        dir.join(format!("{}.mud.json", session))
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("已寫入存檔 {}", path.display());
        Ok(())
    }

    /// 套用到工作階段
    ///
    /// 規則以 `snapshot` 來源整批重新載入，任何一條無法建立時規則與變數都不變。
    /// 鍵值與 id 不一致時以 id 為準並返回警告訊息。
    pub fn apply(
        self,
        vars: &mut VariableStore,
        rules: &mut RuleEngine,
        registry: &CallbackRegistry,
    ) -> Result<Vec<String>, SnapshotError> {
        let mut warnings = Vec::new();
        let mut specs = Vec::with_capacity(self.rules.len());
        for (key, def) in &self.rules {
            if key != &def.id {
                let message = format!("規則鍵值 {} 與其 id {} 不一致，將以 id 載入", key, def.id);
                warn!("{}", message);
                warnings.push(message);
            }
            specs.push(def.to_spec(registry)?);
        }
        rules.reload_source(SNAPSHOT_SOURCE, specs)?;
        vars.load(self.variables);
        Ok(warnings)
    }
}
