//! 規則登錄表
//!
//! 每個工作階段擁有一個 `RuleEngine`。規則依 `(priority, 註冊序號)` 建立索引，
//! 比對時先取得啟用規則的快照，因此比對途中的修改不會影響這一輪的結果。
//! 多行觸發器的比對進度也存在這裡，規則被移除或修改時一併清除。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::rule::{compile, Rule, RuleError, RuleId, RuleInfo, RuleKind, RuleSpec};
use crate::trigger::LineProgress;

/// 規則登錄表
#[derive(Debug, Default, Clone)]
pub struct RuleEngine {
    rules: HashMap<RuleId, Arc<Rule>>,
    order: BTreeMap<(i32, u64), RuleId>,
    pub(crate) progress: HashMap<RuleId, LineProgress>,
    next_uid: u64,
    next_seq: u64,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 註冊規則
    ///
    /// 樣式無法編譯時返回錯誤且不會註冊任何東西。
    /// 指定的 id 已存在時取代舊規則；取代或 id 與種類不符時記錄警告。
    ///
    /// # Example
    /// ```
    /// use mudlink::{RuleEngine, RuleSpec};
    ///
    /// let mut engine = RuleEngine::new();
    /// let id = engine.register(RuleSpec::trigger("^你餓了").send("eat")).unwrap();
    /// assert_eq!(id.as_str(), "tri1");
    /// assert!(engine.register(RuleSpec::trigger("(")).is_err());
    /// assert_eq!(engine.len(), 1);
    /// ```
    pub fn register(&mut self, spec: RuleSpec) -> Result<RuleId, RuleError> {
        let regexes = compile(&spec.pattern, spec.plain)?;
        if let Some(message) = self.id_warning(&spec) {
            warn!("{}", message);
        }
        let id = match spec.id {
            Some(id) => {
                self.remove(&id);
                id
            }
            None => self.derive_id(spec.kind),
        };
        self.next_seq += 1;
        let rule = Rule {
            id: id.clone(),
            kind: spec.kind,
            pattern: spec.pattern,
            regexes,
            group: spec.group,
            priority: spec.priority,
            one_shot: spec.one_shot,
            exclusive: spec.exclusive,
            enabled: spec.enabled,
            source: spec.source,
            seq: self.next_seq,
            action: spec.action,
            raw: spec.raw,
            plain: spec.plain,
            callback_name: spec.callback_name,
        };
        debug!("註冊規則 {} <{}> '{}'", id, rule.kind, rule.pattern);
        self.order.insert((rule.priority, rule.seq), id.clone());
        self.rules.insert(id.clone(), Arc::new(rule));
        Ok(id)
    }

    /// 註冊這條規則時應該提出的警告
    ///
    /// 指定的 id 會取代現有規則，或 id 是另一種規則的自動編號形式（例如觸發器用了 `ali3`）。
    pub fn id_warning(&self, spec: &RuleSpec) -> Option<String> {
        let id = spec.id.as_ref()?;
        if self.rules.contains_key(id) {
            return Some(format!("規則 {} 已存在，以新的定義取代", id));
        }
        match RuleKind::of_derived_id(id.as_str()) {
            Some(kind) if kind != spec.kind => Some(format!("規則 id {} 是 {} 的編號形式，與 {} 不符", id, kind, spec.kind)),
            _ => None,
        }
    }

    // 與現有規則相同的 id 會被跳過
    fn derive_id(&mut self, kind: RuleKind) -> RuleId {
        loop {
            self.next_uid += 1;
            let id = RuleId::new(format!("{}{}", kind.abbr(), self.next_uid));
            if !self.rules.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn remove(&mut self, id: &RuleId) -> Option<Arc<Rule>> {
        let rule = self.rules.remove(id)?;
        self.order.remove(&(rule.priority, rule.seq));
        self.progress.remove(id);
        Some(rule)
    }

    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.rules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn set_enabled(&mut self, id: &RuleId, enabled: bool) -> Result<(), RuleError> {
        let rule = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        Arc::make_mut(rule).enabled = enabled;
        if !enabled {
            self.progress.remove(id);
        }
        Ok(())
    }

    /// 更換樣式，新樣式無法編譯時保留原樣式
    pub fn set_pattern(&mut self, id: &RuleId, pattern: &str) -> Result<(), RuleError> {
        let rule = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.clone()))?;
        let regexes = compile(pattern, rule.plain)?;
        let rule = Arc::make_mut(rule);
        rule.pattern = pattern.to_string();
        rule.regexes = regexes;
        self.progress.remove(id);
        Ok(())
    }

    /// 一次啟用或停用整個群組，返回受影響的規則數
    pub fn set_group_enabled(&mut self, group: &str, enabled: bool) -> usize {
        let mut count = 0;
        for rule in self.rules.values_mut().filter(|r| r.group == group) {
            Arc::make_mut(rule).enabled = enabled;
            if !enabled {
                self.progress.remove(&rule.id);
            }
            count += 1;
        }
        count
    }

    /// 以新的規則集合取代某個來源註冊的所有規則
    ///
    /// 所有樣式都先編譯過，任何一個失敗時整個重新載入不生效。
    pub fn reload_source(&mut self, source: &str, specs: Vec<RuleSpec>) -> Result<Vec<RuleId>, RuleError> {
        for spec in &specs {
            compile(&spec.pattern, spec.plain)?;
        }
        let stale: Vec<RuleId> = self
            .rules
            .values()
            .filter(|r| r.source == source)
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.register(spec.source(source))?);
        }
        debug!("重新載入來源 {}: 移除 {} 條，註冊 {} 條", source, stale.len(), ids.len());
        Ok(ids)
    }

    /// 依比對順序列出規則，`kind` 為 `None` 時列出全部
    pub fn list(&self, kind: Option<RuleKind>) -> Vec<RuleInfo> {
        self.iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .map(Rule::info)
            .collect()
    }

    /// 依比對順序走訪所有規則
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.order
            .values()
            .filter_map(|id| self.rules.get(id).map(Arc::as_ref))
    }

    /// 目前啟用中、指定種類的規則快照
    pub(crate) fn snapshot(&self, kind: RuleKind) -> Vec<Arc<Rule>> {
        self.order
            .values()
            .filter_map(|id| self.rules.get(id))
            .filter(|r| r.kind == kind && r.enabled)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ids_skip_existing() {
        let mut engine = RuleEngine::new();
        engine.register(RuleSpec::alias("^x").id("ali2")).unwrap();
        let a = engine.register(RuleSpec::alias("^a")).unwrap();
        let b = engine.register(RuleSpec::alias("^b")).unwrap();
        let t = engine.register(RuleSpec::trigger("^t")).unwrap();
        assert_eq!(a.as_str(), "ali1");
        assert_eq!(b.as_str(), "ali3");
        assert_eq!(t.as_str(), "tri4");
    }

    #[test]
    fn test_invalid_pattern_registers_nothing() {
        let mut engine = RuleEngine::new();
        let err = engine.register(RuleSpec::trigger("[abc")).unwrap_err();
        assert!(matches!(err, RuleError::Pattern { .. }));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_order_by_priority_then_registration() {
        let mut engine = RuleEngine::new();
        engine.register(RuleSpec::trigger("a").id("late").priority(200)).unwrap();
        engine.register(RuleSpec::trigger("a").id("first")).unwrap();
        engine.register(RuleSpec::trigger("a").id("second")).unwrap();
        engine.register(RuleSpec::trigger("a").id("early").priority(1)).unwrap();
        let ids: Vec<_> = engine.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["early", "first", "second", "late"]);
    }

    #[test]
    fn test_replace_existing_id() {
        let mut engine = RuleEngine::new();
        engine.register(RuleSpec::trigger("old").id("hp")).unwrap();
        engine.register(RuleSpec::trigger("new").id("hp")).unwrap();
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get(&RuleId::from("hp")).unwrap().pattern(), "new");
        assert_eq!(engine.iter().count(), 1);
    }

    #[test]
    fn test_id_warnings() {
        let mut engine = RuleEngine::new();
        assert_eq!(engine.id_warning(&RuleSpec::trigger("a")), None);
        assert_eq!(engine.id_warning(&RuleSpec::trigger("a").id("hp")), None);
        assert_eq!(engine.id_warning(&RuleSpec::trigger("a").id("tri9")), None);
        let other = engine.id_warning(&RuleSpec::trigger("a").id("ali3")).unwrap();
        assert!(other.contains("ali3"));
        engine.register(RuleSpec::trigger("a").id("hp")).unwrap();
        let replaced = engine.id_warning(&RuleSpec::trigger("b").id("hp")).unwrap();
        assert!(replaced.contains("取代"));
    }

    #[test]
    fn test_group_toggle() {
        let mut engine = RuleEngine::new();
        engine.register(RuleSpec::trigger("a").group("fight")).unwrap();
        engine.register(RuleSpec::trigger("b").group("fight")).unwrap();
        engine.register(RuleSpec::trigger("c")).unwrap();
        assert_eq!(engine.set_group_enabled("fight", false), 2);
        assert_eq!(engine.snapshot(RuleKind::Trigger).len(), 1);
        assert_eq!(engine.set_group_enabled("none", false), 0);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let mut engine = RuleEngine::new();
        let id = engine.register(RuleSpec::trigger("a")).unwrap();
        let snapshot = engine.snapshot(RuleKind::Trigger);
        engine.set_enabled(&id, false).unwrap();
        assert!(snapshot[0].is_enabled());
        assert!(!engine.get(&id).unwrap().is_enabled());
    }

    #[test]
    fn test_set_pattern_keeps_old_on_error() {
        let mut engine = RuleEngine::new();
        let id = engine.register(RuleSpec::trigger("good")).unwrap();
        assert!(engine.set_pattern(&id, "(bad").is_err());
        assert_eq!(engine.get(&id).unwrap().pattern(), "good");
        engine.set_pattern(&id, "better").unwrap();
        assert_eq!(engine.get(&id).unwrap().pattern(), "better");
    }

    #[test]
    fn test_reload_source_is_atomic() {
        let mut engine = RuleEngine::new();
        engine
            .reload_source("combat", vec![RuleSpec::trigger("a"), RuleSpec::trigger("b")])
            .unwrap();
        engine.register(RuleSpec::trigger("keep")).unwrap();
        assert_eq!(engine.len(), 3);

        let result = engine.reload_source("combat", vec![RuleSpec::trigger("c"), RuleSpec::trigger("(")]);
        assert!(result.is_err());
        assert_eq!(engine.len(), 3);

        let ids = engine.reload_source("combat", vec![RuleSpec::trigger("c")]).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.get(&ids[0]).unwrap().source(), "combat");
    }

    #[test]
    fn test_list_by_kind() {
        let mut engine = RuleEngine::new();
        engine.register(RuleSpec::trigger("a")).unwrap();
        engine.register(RuleSpec::alias("b")).unwrap();
        engine.register(RuleSpec::gmcp("Char.Vitals")).unwrap();
        assert_eq!(engine.list(Some(RuleKind::Alias)).len(), 1);
        assert_eq!(engine.list(None).len(), 3);
    }

    #[test]
    fn test_missing_rule_errors() {
        let mut engine = RuleEngine::new();
        let err = engine.set_enabled(&RuleId::from("tri9"), true).unwrap_err();
        assert!(matches!(err, RuleError::NotFound(_)));
    }
}
