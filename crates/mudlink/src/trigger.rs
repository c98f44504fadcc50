//! Trigger（觸發器）比對
//!
//! 對伺服器送來的每一行依優先權比對觸發器，GMCP 訊息則比對 GMCP 觸發器的套件名稱。

use tracing::{debug, trace};

use crate::engine::RuleEngine;
use crate::rule::{captures_of, compile_line, Rule, RuleError, RuleKind, RuleMatch};

/// 比對模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// 只回報會比對成功的規則，不移除一次性規則
    DryRun,
    /// 回報並交由工作階段執行動作
    Live,
}

/// 多行觸發器目前已比對到的行
#[derive(Debug, Clone, Default)]
pub(crate) struct LineProgress {
    lines: Vec<String>,
    captures: Vec<Vec<String>>,
}

impl LineProgress {
    fn step(&self) -> usize {
        self.lines.len()
    }

    fn push(&mut self, line: &str, captures: Vec<String>) {
        self.lines.push(line.to_string());
        self.captures.push(captures);
    }

    /// 合併成一次比對：第 0 組為各行比對結果以換行連接，其後依序是每一行的擷取群組
    fn finish(self) -> (Vec<String>, String) {
        let whole: Vec<&str> = self
            .captures
            .iter()
            .map(|c| c.first().map_or("", String::as_str))
            .collect();
        let mut captures = vec![whole.join("\n")];
        for groups in &self.captures {
            captures.extend(groups.iter().skip(1).cloned());
        }
        (captures, self.lines.join("\n"))
    }
}

impl RuleEngine {
    /// 以一行的純文字比對所有啟用的觸發器
    ///
    /// Live 模式下一次性規則會在返回前移除，回呼執行時它已不在規則表中。
    pub fn on_line(&mut self, line: &str, mode: EvalMode) -> Vec<RuleMatch> {
        self.on_raw_line(line, line, mode)
    }

    /// 同時提供純文字與含 ANSI 序列的原始文字，`raw` 觸發器比對後者
    pub fn on_raw_line(&mut self, line: &str, raw: &str, mode: EvalMode) -> Vec<RuleMatch> {
        self.evaluate(RuleKind::Trigger, line, raw, line, mode)
    }

    /// 以套件名稱比對 GMCP 觸發器，`RuleMatch::line` 為 JSON 內容
    pub fn on_gmcp(&mut self, package: &str, payload: &str, mode: EvalMode) -> Vec<RuleMatch> {
        self.evaluate(RuleKind::Gmcp, package, package, payload, mode)
    }

    fn evaluate(&mut self, kind: RuleKind, subject: &str, raw: &str, line: &str, mode: EvalMode) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in self.snapshot(kind) {
            let (subject, line) = if rule.raw && kind == RuleKind::Trigger {
                (raw, raw)
            } else {
                (subject, line)
            };
            let found = if rule.line_count() > 1 {
                self.advance(&rule, subject, mode)
            } else {
                rule.captures(subject).map(|captures| (captures, line.to_string()))
            };
            let Some((captures, line)) = found else {
                continue;
            };
            if mode == EvalMode::Live && rule.one_shot {
                self.remove(&rule.id);
                debug!("一次性規則 {} 已觸發並移除", rule.id);
            }
            matches.push(RuleMatch {
                rule_id: rule.id.clone(),
                kind,
                captures,
                line,
                action: rule.action.clone(),
            });
            if rule.exclusive {
                break;
            }
        }
        matches
    }

    /// 多行觸發器前進一行，最後一行也成立時返回合併的結果
    ///
    /// 中途不符時從第一行的樣式重新比對這一行。DryRun 不保存進度。
    fn advance(&mut self, rule: &Rule, text: &str, mode: EvalMode) -> Option<(Vec<String>, String)> {
        let current = self.progress.get(&rule.id).cloned().unwrap_or_default();
        let restart = current.step() > 0;
        let (mut progress, captures) = match rule.captures_at(current.step(), text) {
            Some(captures) => (current, captures),
            None => match restart.then(|| rule.captures_at(0, text)).flatten() {
                Some(captures) => (LineProgress::default(), captures),
                None => {
                    if mode == EvalMode::Live {
                        self.progress.remove(&rule.id);
                    }
                    return None;
                }
            },
        };
        progress.push(text, captures);
        if progress.step() < rule.line_count() {
            if mode == EvalMode::Live {
                trace!("多行規則 {} 進度 {}/{}", rule.id, progress.step(), rule.line_count());
                self.progress.insert(rule.id.clone(), progress);
            }
            return None;
        }
        if mode == EvalMode::Live {
            self.progress.remove(&rule.id);
        }
        Some(progress.finish())
    }
}

/// 以任意樣式試比對文字，返回擷取群組
///
/// 與規則相同，樣式從行首開始比對。
pub fn test_pattern(pattern: &str, text: &str) -> Result<Option<Vec<String>>, RuleError> {
    let regex = compile_line(pattern, false).map_err(|source| RuleError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(captures_of(&regex, text))
}
