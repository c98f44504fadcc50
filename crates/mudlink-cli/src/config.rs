//! 設定檔
//!
//! 一個 Profile 檔案包含引擎設定、啟動時建立的工作階段，
//! 以及套用到每個工作階段的別名與觸發器。

use std::fs;
use std::path::{Path, PathBuf};

use mudlink::{RuleKind, RuleSpec, SessionConfig, Settings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Profile 規則的來源名稱，重新載入時整批取代
pub const PROFILE_SOURCE: &str = "profile";

/// 別名或觸發器設定（可序列化版本）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub pattern: String,
    /// 比對成功後送出的命令，可使用 `%1` 與 `@變數`
    #[serde(default)]
    pub send: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 比對含 ANSI 序列的原始行
    #[serde(default)]
    pub raw: bool,
    /// `pattern` 是字面字串，可出現在行內任何位置
    #[serde(default)]
    pub plain: bool,
}

impl RuleConfig {
    pub fn to_spec(&self, kind: RuleKind) -> RuleSpec {
        let mut spec = RuleSpec::new(kind, self.pattern.clone()).source(PROFILE_SOURCE);
        if let Some(id) = &self.id {
            spec = spec.id(id.clone());
        }
        if !self.send.is_empty() {
            spec = spec.send(self.send.clone());
        }
        if let Some(group) = &self.group {
            spec = spec.group(group.clone());
        }
        if let Some(priority) = self.priority {
            spec = spec.priority(priority);
        }
        if !self.enabled {
            spec = spec.disabled();
        }
        spec.raw = self.raw;
        spec.plain = self.plain;
        spec
    }
}

fn default_true() -> bool {
    true
}

/// 設定檔錯誤
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("無法讀取設定檔: {0}")]
    Io(#[from] std::io::Error),

    #[error("設定檔格式錯誤: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 完整的 Profile
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    #[serde(default)]
    pub settings: Settings,
    /// 啟動時建立的工作階段
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    #[serde(default)]
    pub aliases: Vec<RuleConfig>,
    #[serde(default)]
    pub triggers: Vec<RuleConfig>,
}

impl Profile {
    /// 預設設定檔路徑
    pub fn default_path() -> PathBuf {
        PathBuf::from("mudlink.json")
    }

    /// 從檔案載入，檔案不存在時使用預設值
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 套用到每個工作階段的規則
    pub fn rule_specs(&self) -> Vec<RuleSpec> {
        self.aliases
            .iter()
            .map(|a| a.to_spec(RuleKind::Alias))
            .chain(self.triggers.iter().map(|t| t.to_spec(RuleKind::Trigger)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults() {
        let profile: Profile = serde_json::from_str("{}").unwrap();
        assert!(profile.sessions.is_empty());
        assert_eq!(profile.settings.client.separator, ";");
    }

    #[test]
    fn test_profile_parsing() {
        let json = r#"{
            "sessions": [{ "name": "main", "host": "mud.example", "port": 4000, "encoding": "big5" }],
            "aliases": [{ "pattern": "^k (\\S+)$", "send": "kill %1" }],
            "triggers": [
                { "id": "hungry", "pattern": "^你餓了", "send": "eat", "group": "auto", "enabled": false },
                { "pattern": "^HP\n^MP", "raw": true }
            ]
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.sessions[0].encoding.as_deref(), Some("big5"));
        assert!(profile.sessions[0].auto_connect);

        let specs = profile.rule_specs();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].kind, RuleKind::Alias);
        assert_eq!(specs[1].id.as_ref().map(|id| id.as_str()), Some("hungry"));
        assert!(!specs[1].enabled);
        assert_eq!(specs[1].source, PROFILE_SOURCE);
        assert!(specs[2].raw);
        assert!(!specs[2].plain);
        assert_eq!(specs[2].pattern, "^HP\n^MP");
    }

    #[test]
    fn test_profile_roundtrip_file() {
        let dir = std::env::temp_dir().join(format!("mudlink-cli-test-{}", std::process::id()));
        let path = dir.join("profile.json");
        let mut profile = Profile::default();
        profile.sessions.push(SessionConfig::new("main", "mud.example", 4000));
        profile.save(&path).unwrap();
        let loaded = Profile::load(&path).unwrap();
        assert_eq!(loaded.sessions, profile.sessions);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_profile_is_default() {
        let profile = Profile::load(Path::new("/nonexistent/mudlink.json")).unwrap();
        assert!(profile.aliases.is_empty());
    }
}
