//! Alias（別名）模組
//!
//! 送出的命令先比對別名，再展開 `%N` 擷取群組與 `@name` 變數參照。
//! 展開結果同時保留帶型別的參數，只有在送出到網路時才轉成文字。

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::engine::RuleEngine;
use crate::rule::{RuleAction, RuleKind, RuleMatch};
use crate::value::Value;
use crate::variables::VarLookup;

lazy_static! {
    // @name 為變數，%0-%9 為擷取群組，%name 為暫存變數
    static ref REFERENCE: Regex =
        Regex::new(r"@([\p{L}\p{N}_]+)|%(\d)|%([\p{L}_][\p{L}\p{N}_]*)").expect("參照樣式無效");
}

/// 展開後的命令
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedCommand {
    wire: String,
    args: Vec<Value>,
}

impl ExpandedCommand {
    /// 不含任何參照的命令
    pub fn literal(text: impl Into<String>) -> Self {
        let wire = text.into();
        let args = wire.split_whitespace().map(Value::infer).collect();
        Self { wire, args }
    }

    /// 送到網路上的文字
    pub fn wire(&self) -> &str {
        &self.wire
    }

    /// 帶型別的參數
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.wire, self.args)
    }
}

/// 別名比對結果
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// 沒有別名比對成功，直接送出
    Transmit(ExpandedCommand),
    /// 由別名接手處理
    Aliased(RuleMatch, ExpandedCommand),
}

/// 展開命令樣板
///
/// 參數依空白切分；整個參數恰好是一個變數參照時保留變數的型別，
/// 其餘參數以字面語法推斷。找不到的變數參照原樣保留。
///
/// # Example
/// ```
/// use mudlink::{expand, Value, VariableStore};
///
/// let mut vars = VariableStore::new();
/// vars.set("gold", Value::Int(500));
/// let cmd = expand("give @gold to %1", &vars, &["x".into(), "bob".into()]);
/// assert_eq!(cmd.wire(), "give 500 to bob");
/// assert_eq!(cmd.args()[1], Value::Int(500));
/// ```
pub fn expand(template: &str, vars: &dyn VarLookup, captures: &[String]) -> ExpandedCommand {
    ExpandedCommand {
        wire: substitute(template, vars, captures),
        args: template
            .split_whitespace()
            .map(|token| expand_arg(token, vars, captures))
            .collect(),
    }
}

fn substitute(text: &str, vars: &dyn VarLookup, captures: &[String]) -> String {
    REFERENCE
        .replace_all(text, |caps: &Captures| {
            resolve(caps, vars, captures)
                .map(|v| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn expand_arg(token: &str, vars: &dyn VarLookup, captures: &[String]) -> Value {
    if let Some(caps) = REFERENCE.captures(token) {
        if caps[0].len() == token.len() && caps.get(2).is_none() {
            if let Some(value) = resolve(&caps, vars, captures) {
                return value;
            }
        }
    }
    Value::infer(&substitute(token, vars, captures))
}

fn resolve(caps: &Captures, vars: &dyn VarLookup, captures: &[String]) -> Option<Value> {
    if let Some(name) = caps.get(1) {
        return vars.lookup(name.as_str());
    }
    if let Some(index) = caps.get(2) {
        // 沒有擷取群組時退回同名的暫存變數（%1 等由工作階段維護）
        let n: usize = index.as_str().parse().ok()?;
        return match captures.get(n) {
            Some(text) => Some(Value::Str(text.clone())),
            None if captures.is_empty() => vars.lookup(&caps[0]),
            None => Some(Value::Str(String::new())),
        };
    }
    vars.lookup(&caps[0])
}

impl RuleEngine {
    /// 比對送出的命令，第一個比對成功的別名接手
    ///
    /// 別名樣式比對的是尚未展開的原始文字。
    pub fn on_outbound(&mut self, text: &str, vars: &dyn VarLookup) -> Outbound {
        for rule in self.snapshot(RuleKind::Alias) {
            let Some(captures) = rule.captures(text) else {
                continue;
            };
            if rule.one_shot {
                self.remove(&rule.id);
            }
            let command = match &rule.action {
                RuleAction::Send(template) => expand(template, vars, &captures),
                _ => ExpandedCommand {
                    wire: substitute(text, vars, &[]),
                    args: captures
                        .iter()
                        .skip(1)
                        .map(|c| expand_arg(c, vars, &[]))
                        .collect(),
                },
            };
            let matched = RuleMatch {
                rule_id: rule.id.clone(),
                kind: RuleKind::Alias,
                captures,
                line: text.to_string(),
                action: rule.action.clone(),
            };
            return Outbound::Aliased(matched, command);
        }
        Outbound::Transmit(expand(text, vars, &[]))
    }
}

/// 以分隔字串切開多個命令，大括號內的分隔字串不切
///
/// # Example
/// ```
/// use mudlink::split_commands;
///
/// assert_eq!(split_commands("n;e;#tri x {a;b}", ";"), vec!["n", "e", "#tri x {a;b}"]);
/// ```
pub fn split_commands(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return vec![text.to_string()];
    }
    let mut commands = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with('{') {
            depth += 1;
        } else if rest.starts_with('}') {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && rest.starts_with(separator) {
            commands.push(text[start..i].to_string());
            i += separator.len();
            start = i;
            continue;
        }
        i += rest.chars().next().map_or(1, char::len_utf8);
    }
    commands.push(text[start..].to_string());
    commands
}

/// 去除最外層的一對大括號
pub fn strip_braces(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .unwrap_or(trimmed)
}
