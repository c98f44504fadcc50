//! 設定
//!
//! - `ServerSettings`: 伺服器相關的協定設定（編碼、換行、支援的 Telnet 選項）
//! - `ClientSettings`: 客戶端行為（緩衝區、視窗大小、命令分隔、逾時與重連）
//! - `SessionConfig`: 單一工作階段的連線資訊
//!
//! 所有欄位都有預設值，設定檔只需寫出要覆寫的部分。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::TextEncoding;
use crate::telnet::NegotiatorConfig;

/// 設定檔錯誤
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("讀寫設定檔失敗: {0}")]
    Io(#[from] io::Error),

    #[error("設定檔格式錯誤: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("不支援的編碼: {0}")]
    UnknownEncoding(String),
}

/// 伺服器協定設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// 送出命令時附加的換行
    #[serde(default = "default_newline")]
    pub newline: String,
    #[serde(default = "default_true")]
    pub sga: bool,
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_true")]
    pub gmcp: bool,
    #[serde(default = "default_true")]
    pub mssp: bool,
    #[serde(default = "default_true")]
    pub charset: bool,
    /// 連線後主動提出 NAWS
    #[serde(default = "default_true")]
    pub offer_naws: bool,
    #[serde(default = "default_ttype_names")]
    pub ttype_names: Vec<String>,
    /// MTTS 位元旗標，預設 ANSI + 256 色 + 真彩色 + UTF-8
    #[serde(default = "default_mtts_flags")]
    pub mtts_flags: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            newline: default_newline(),
            sga: true,
            echo: false,
            gmcp: true,
            mssp: true,
            charset: true,
            offer_naws: true,
            ttype_names: default_ttype_names(),
            mtts_flags: default_mtts_flags(),
        }
    }
}

/// 記錄檔格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Html,
}

/// 客戶端行為設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// 歷史緩衝區行數，0 表示不限
    #[serde(default = "default_buffer_lines")]
    pub buffer_lines: usize,
    #[serde(default = "default_naws_width")]
    pub naws_width: u16,
    #[serde(default = "default_naws_height")]
    pub naws_height: u16,
    #[serde(default = "default_tabstop")]
    pub tabstop: usize,
    /// 多命令分隔字串
    #[serde(default = "default_separator")]
    pub separator: String,
    /// 內建命令前綴
    #[serde(default = "default_command_prefix")]
    pub command_prefix: char,
    /// `send_async` 連續送出命令之間的間隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// `#N 命令` 每次重複之間的間隔（毫秒），0 表示一次全部送出
    #[serde(default = "default_repeat_interval_ms")]
    pub repeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 主動斷線後等待伺服器關閉連線的時間（毫秒）
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// 重連間隔（秒），這段時間內的手動連線也會被拒絕
    #[serde(default = "default_reconnect_wait_secs")]
    pub reconnect_wait_secs: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// 別名展開的最大遞迴深度
    #[serde(default = "default_max_recursion")]
    pub max_recursion: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_true")]
    pub var_autosave: bool,
    #[serde(default = "default_true")]
    pub var_autoload: bool,
    /// 存檔目錄
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 設定時為每個工作階段寫記錄檔
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            buffer_lines: default_buffer_lines(),
            naws_width: default_naws_width(),
            naws_height: default_naws_height(),
            tabstop: default_tabstop(),
            separator: default_separator(),
            command_prefix: default_command_prefix(),
            interval_ms: default_interval_ms(),
            repeat_interval_ms: default_repeat_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            auto_reconnect: false,
            reconnect_wait_secs: default_reconnect_wait_secs(),
            tick_ms: default_tick_ms(),
            max_recursion: default_max_recursion(),
            read_buffer_size: default_read_buffer_size(),
            var_autosave: true,
            var_autoload: true,
            state_dir: default_state_dir(),
            log_dir: None,
            log_format: LogFormat::Text,
        }
    }
}

impl ClientSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// 完整設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Settings {
    /// 從 JSON 檔載入，檔案不存在時使用預設值
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        resolve_encoding(&self.server.encoding)?;
        Ok(())
    }

    /// 以工作階段的編碼建立協商設定
    pub fn negotiator_config(&self, encoding: TextEncoding) -> NegotiatorConfig {
        NegotiatorConfig {
            ttype_names: self.server.ttype_names.clone(),
            mtts_flags: self.server.mtts_flags,
            window_size: (self.client.naws_width, self.client.naws_height),
            offer_naws: self.server.offer_naws,
            gmcp: self.server.gmcp,
            mssp: self.server.mssp,
            charset: self.server.charset,
            sga: self.server.sga,
            echo: self.server.echo,
            encoding: encoding.label().to_string(),
        }
    }
}

/// 以標籤找出編碼
pub fn resolve_encoding(label: &str) -> Result<TextEncoding, SettingsError> {
    TextEncoding::from_label(label).ok_or_else(|| SettingsError::UnknownEncoding(label.to_string()))
}

/// 單一工作階段的連線設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// 未設定時使用 `ServerSettings::encoding`
    #[serde(default)]
    pub encoding: Option<String>,
    /// 連線成功後自動送出的命令（例如登入）
    #[serde(default)]
    pub after_connect: Option<String>,
    /// 未設定時使用 `ClientSettings::auto_reconnect`
    #[serde(default)]
    pub auto_reconnect: Option<bool>,
    /// 建立後立即連線
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            encoding: None,
            after_connect: None,
            auto_reconnect: None,
            auto_connect: true,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn with_after_connect(mut self, command: impl Into<String>) -> Self {
        self.after_connect = Some(command.into());
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_newline() -> String {
    "\r\n".to_string()
}

fn default_ttype_names() -> Vec<String> {
    vec!["ANSI".to_string(), "XTERM".to_string()]
}

fn default_mtts_flags() -> u32 {
    137
}

fn default_buffer_lines() -> usize {
    5000
}

fn default_naws_width() -> u16 {
    150
}

fn default_naws_height() -> u16 {
    40
}

fn default_tabstop() -> usize {
    4
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_command_prefix() -> char {
    '#'
}

fn default_interval_ms() -> u64 {
    10
}

fn default_repeat_interval_ms() -> u64 {
    100
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_wait_secs() -> u64 {
    15
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_max_recursion() -> usize {
    50
}

fn default_read_buffer_size() -> usize {
    8192
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}
