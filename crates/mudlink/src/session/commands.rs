//! 內建命令
//!
//! 以命令前綴（預設 `#`）開頭的輸入不會送往伺服器，而是在這裡處理。
//! 大括號可把含空白或分隔字元的參數包成一個。

use std::time::Duration;

use tracing::debug;

use crate::alias::strip_braces;
use crate::rule::{RuleId, RuleKind, RuleSpec};
use crate::trigger::EvalMode;
use crate::value::Value;
use crate::variables::Variable;

use super::context::SessionContext;

/// `#N 命令` 允許的最大重複次數
pub const MAX_REPEAT: usize = 1000;

/// 內建命令的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Builtin {
    Done,
    /// 等待一段時間後再處理後續命令
    Wait(Duration),
    /// 重複執行命令
    Repeat(usize, String),
}

/// 執行一條內建命令，`line` 不含前綴
pub(crate) fn run(ctx: &mut SessionContext, line: &str) -> Builtin {
    let line = line.trim();
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    debug!("[{}] 內建命令 {} {}", ctx.name(), name, rest);
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        return repeat(ctx, name, rest);
    }
    match name.to_lowercase().as_str() {
        "var" | "variable" => variable(ctx, rest, false),
        "global" => variable(ctx, rest, true),
        "unvar" => {
            match ctx.remove_var(rest) {
                Some(_) => ctx.info(format!("已刪除變數 {}", rest)),
                None => ctx.warning(format!("變數 {} 不存在", rest)),
            }
        }
        "tri" | "trigger" | "action" => rule(ctx, RuleKind::Trigger, rest),
        "ali" | "alias" => rule(ctx, RuleKind::Alias, rest),
        "gmcp" => rule(ctx, RuleKind::Gmcp, rest),
        "ti" | "timer" => timer(ctx, rest),
        "group" => group(ctx, rest),
        "show" => test_line(ctx, rest, EvalMode::DryRun),
        "test" => test_line(ctx, rest, EvalMode::Live),
        "task" => {
            let tasks = ctx.tasks();
            ctx.info(format!("共有 {} 個背景任務", tasks.len()));
            for task in tasks {
                ctx.info(format!("  #{} {} ({:.1}s)", task.id, task.name, task.elapsed.as_secs_f64()));
            }
        }
        "idle" => {
            let idle = ctx.idle();
            ctx.info(format!("已閒置 {:.1} 秒", idle.as_secs_f64()));
        }
        "ig" | "ignore" => match rest.to_lowercase().as_str() {
            "on" => set_ignore(ctx, true),
            "off" => set_ignore(ctx, false),
            "" => {
                let state = if ctx.ignores_triggers() { "暫停中" } else { "正常" };
                ctx.info(format!("觸發器狀態: {}", state));
            }
            other => ctx.warning(format!("#ignore 參數 {} 無效，只接受 on 或 off", other)),
        },
        "t+" => set_ignore(ctx, true),
        "t-" => set_ignore(ctx, false),
        "wa" | "wait" => match rest.parse::<u64>() {
            Ok(ms) => return Builtin::Wait(Duration::from_millis(ms)),
            Err(_) => ctx.warning(format!("#wait 需要毫秒數，收到 {}", rest)),
        },
        "split" => {
            let at = if rest.is_empty() { None } else { rest.parse::<usize>().ok() };
            match ctx.split(at) {
                Some(pin) => ctx.info(format!("分割檢視固定在第 {} 行", pin)),
                None => ctx.warning("緩衝區沒有內容，無法分割"),
            }
        }
        "unsplit" => ctx.unsplit(),
        "mssp" => {
            let table = ctx.server_status().to_vec();
            if table.is_empty() {
                ctx.info("伺服器沒有提供 MSSP 資訊");
            }
            for (key, value) in table {
                ctx.info(format!("  {} = {}", key, value));
            }
        }
        "gag" => {
            if !ctx.gag_line() {
                ctx.warning("#gag 只能在觸發器中使用");
            }
        }
        "replace" => {
            if !ctx.replace_line(strip_braces(rest)) {
                ctx.warning("#replace 只能在觸發器中使用");
            }
        }
        "con" | "connect" => ctx.request_connect(),
        "dis" | "disconnect" => ctx.request_disconnect(),
        "save" => match ctx.save_snapshot() {
            Ok(path) => ctx.info(format!("已存檔至 {}", path.display())),
            Err(e) => ctx.error(format!("存檔失敗: {}", e)),
        },
        _ => ctx.warning(format!("未知的命令: {}", name)),
    }
    Builtin::Done
}

fn repeat(ctx: &mut SessionContext, count: &str, command: &str) -> Builtin {
    let count = match count.parse::<usize>() {
        Ok(n) if (1..=MAX_REPEAT).contains(&n) => n,
        _ => {
            ctx.error(format!("重複次數 {} 無效，必須介於 1 到 {}", count, MAX_REPEAT));
            return Builtin::Done;
        }
    };
    if command.is_empty() {
        ctx.warning("#N 之後缺少要重複的命令");
        return Builtin::Done;
    }
    Builtin::Repeat(count, command.to_string())
}

/// 取出第一個參數，返回參數與剩餘文字
///
/// 以 `{` 開頭的參數延伸到對應的 `}`，其他參數到空白為止。
fn next_arg(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    if text.starts_with('{') {
        let mut depth = 0usize;
        for (i, c) in text.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((text[1..i].to_string(), &text[i + 1..]));
                    }
                }
                _ => {}
            }
        }
        return Some((text[1..].to_string(), ""));
    }
    match text.split_once(char::is_whitespace) {
        Some((arg, rest)) => Some((arg.to_string(), rest)),
        None => Some((text.to_string(), "")),
    }
}

fn set_ignore(ctx: &mut SessionContext, ignore: bool) {
    ctx.set_ignore_triggers(ignore);
    if ignore {
        ctx.info("觸發器已暫停，不會回應伺服器訊息");
    } else {
        ctx.info("觸發器已恢復");
    }
}

fn show_variable(ctx: &mut SessionContext, name: &str, var: &Variable) {
    let value = var.value();
    ctx.info(format!("  {} = {} ({})", name, value, value.type_name()));
}

fn variable(ctx: &mut SessionContext, args: &str, global: bool) {
    let Some((name, rest)) = next_arg(args) else {
        let vars = if global {
            ctx.globals().sorted()
        } else {
            ctx.variables().sorted()
        };
        ctx.info(format!("共有 {} 個{}變數", vars.len(), if global { "全域" } else { "" }));
        for (name, var) in &vars {
            show_variable(ctx, name, var);
        }
        return;
    };
    let rest = rest.trim();
    if rest.is_empty() {
        let value = if global {
            ctx.globals().get(&name)
        } else {
            ctx.variables().get(&name).cloned()
        };
        match value {
            Some(value) => ctx.info(format!("  {} = {} ({})", name, value, value.type_name())),
            None => ctx.warning(format!("變數 {} 不存在", name)),
        }
        return;
    }
    let value = Value::infer(strip_braces(rest));
    if global {
        ctx.globals().set(&name, value);
    } else {
        ctx.set_var(&name, value);
    }
}

fn rule(ctx: &mut SessionContext, kind: RuleKind, args: &str) {
    let Some((first, rest)) = next_arg(args) else {
        let rules = ctx.rules().list(Some(kind));
        ctx.info(format!("共有 {} 個 {}", rules.len(), kind));
        for info in rules {
            ctx.info(format!("  {}", info));
        }
        return;
    };

    let id = RuleId::new(first.as_str());
    let is_own = ctx.rules().get(&id).map_or(false, |r| r.kind() == kind);
    if is_own {
        match rest.trim().to_lowercase().as_str() {
            "on" | "off" => {
                let enabled = rest.trim().eq_ignore_ascii_case("on");
                if let Err(e) = ctx.rules_mut().set_enabled(&id, enabled) {
                    ctx.warning(e.to_string());
                }
                return;
            }
            "del" => {
                ctx.remove_rule(&id);
                ctx.info(format!("已刪除 {} {}", kind, id));
                return;
            }
            "" => {
                if let Some(info) = ctx.rules().get(&id).map(|r| r.info()) {
                    ctx.info(format!("  {}", info));
                }
                return;
            }
            _ => {}
        }
    }

    let mut spec = RuleSpec::new(kind, first);
    let command = strip_braces(rest);
    if !command.is_empty() {
        spec = spec.send(command);
    }
    match ctx.register_rule(spec) {
        Ok(id) => ctx.info(format!("已建立 {} {}", kind, id)),
        Err(e) => ctx.error(e.to_string()),
    }
}

fn timer(ctx: &mut SessionContext, args: &str) {
    let Some((first, rest)) = next_arg(args) else {
        let timers = ctx.timers();
        ctx.info(format!("共有 {} 個定時器", timers.len()));
        for info in timers {
            ctx.info(format!("  {}", info));
        }
        return;
    };

    if ctx.timers_mut().contains(&first) {
        match rest.trim().to_lowercase().as_str() {
            "on" => {
                ctx.timers_mut().set_enabled(&first, true);
            }
            "off" => {
                ctx.timers_mut().set_enabled(&first, false);
            }
            "del" => {
                ctx.cancel_timer(&first);
                ctx.info(format!("已刪除定時器 {}", first));
            }
            other => ctx.warning(format!("定時器參數 {} 無效，只接受 on、off 或 del", other)),
        }
        return;
    }

    let seconds = match first.parse::<f64>() {
        Ok(s) if s > 0.0 && s.is_finite() => s,
        _ => {
            ctx.warning(format!("定時器週期 {} 無效", first));
            return;
        }
    };
    let command = strip_braces(rest).to_string();
    if command.is_empty() {
        ctx.warning("定時器需要要執行的命令");
        return;
    }
    let id = ctx.add_timer(Duration::from_secs_f64(seconds), true, move |_: &str, ctx: &mut SessionContext| {
        ctx.send(command.clone())
    });
    ctx.info(format!("已建立定時器 {}", id));
}

fn group(ctx: &mut SessionContext, args: &str) {
    let Some((name, rest)) = next_arg(args) else {
        ctx.warning("用法: #group 群組名稱 on|off");
        return;
    };
    let enabled = match rest.trim().to_lowercase().as_str() {
        "on" => true,
        "off" => false,
        other => {
            ctx.warning(format!("#group 參數 {} 無效，只接受 on 或 off", other));
            return;
        }
    };
    let count = ctx.rules_mut().set_group_enabled(&name, enabled);
    ctx.info(format!(
        "群組 {} 共 {} 條規則已{}",
        name,
        count,
        if enabled { "啟用" } else { "停用" }
    ));
}

fn test_line(ctx: &mut SessionContext, text: &str, mode: EvalMode) {
    let text = strip_braces(text).to_string();
    let matches = ctx.rules_mut().on_line(&text, mode);
    if matches.is_empty() {
        ctx.info("沒有觸發器比對成功");
        return;
    }
    ctx.info(format!("共 {} 個觸發器比對成功", matches.len()));
    for matched in matches {
        ctx.info(format!("  {} 擷取: {:?}", matched.rule_id, matched.captures));
        if mode == EvalMode::Live {
            ctx.dispatch(matched);
        }
    }
}
