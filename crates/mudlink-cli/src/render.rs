//! 終端渲染
//!
//! 把工作階段的行（含 SGR 序列）輸出到終端。

use std::io::{self, Write};

use mudlink::{ConnectionState, DecodedLine, Renderer, StatusLevel, StatusMessage};
use tokio::sync::watch;
use tracing::warn;

/// 寫入終端（或任何 `Write`）的渲染端
pub struct StdoutRenderer<W: Write + Send = io::Stdout> {
    out: W,
    color: bool,
    /// 目前顯示中的工作階段，其餘工作階段的行加上名稱前綴
    active: watch::Receiver<Option<String>>,
}

impl StdoutRenderer {
    pub fn stdout(active: watch::Receiver<Option<String>>) -> Self {
        Self::new(io::stdout(), active)
    }
}

impl<W: Write + Send> StdoutRenderer<W> {
    pub fn new(out: W, active: watch::Receiver<Option<String>>) -> Self {
        Self { out, color: true, active }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn prefix(&self, session: &str) -> String {
        if self.active.borrow().as_deref() == Some(session) {
            String::new()
        } else {
            format!("[{}] ", session)
        }
    }

    fn write(&mut self, text: &str, flush: bool) {
        let result = self
            .out
            .write_all(text.as_bytes())
            .and_then(|_| if flush { self.out.flush() } else { Ok(()) });
        if let Err(e) = result {
            warn!("終端輸出失敗: {}", e);
        }
    }
}

impl<W: Write + Send> Renderer for StdoutRenderer<W> {
    fn line(&mut self, session: &str, line: &DecodedLine) {
        let body = if self.color {
            line.to_ansi()
        } else {
            line.text()
        };
        let mut text = self.prefix(session);
        text.push_str(&body);
        if !line.prompt {
            text.push('\n');
        }
        self.write(&text, line.prompt);
    }

    fn state(&mut self, session: &str, state: ConnectionState) {
        let label = match state {
            ConnectionState::Connecting => "連線中",
            ConnectionState::Connected => "已連線",
            ConnectionState::Closing => "斷線中",
            ConnectionState::Disconnected => "已斷線",
        };
        let text = format!("[{}] #{}\n", session, label);
        self.write(&text, true);
    }

    fn status(&mut self, session: &str, message: &StatusMessage) {
        let mark = match message.level {
            StatusLevel::Info => "",
            StatusLevel::Warning => "警告: ",
            StatusLevel::Error => "錯誤: ",
        };
        let text = format!("[{}] {}{}\n", session, mark, message.text);
        self.write(&text, true);
    }

    fn closed(&mut self, session: &str) {
        let text = format!("[{}] #工作階段已結束\n", session);
        self.write(&text, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudlink::buffer::{Color, Span, Style};

    #[test]
    fn test_color_output_keeps_styles() {
        let (_active, rx) = watch::channel(Some("main".to_string()));
        let mut renderer = StdoutRenderer::new(Vec::new(), rx);
        let red = Style {
            fg: Color::Indexed(1),
            ..Style::default()
        };
        let line = DecodedLine {
            spans: vec![Span {
                text: "紅".to_string(),
                style: red,
            }],
            prompt: false,
        };
        renderer.line("main", &line);
        let text = String::from_utf8(renderer.into_inner()).unwrap();
        assert_eq!(text, "\x1b[0;31m紅\x1b[0m\n");
    }

    #[test]
    fn test_renderer_prefixes_background_sessions() {
        let (_active, rx) = watch::channel(Some("main".to_string()));
        let mut renderer = StdoutRenderer::new(Vec::new(), rx).with_color(false);
        renderer.line("main", &DecodedLine::plain("hello"));
        renderer.line("alt", &DecodedLine::plain("world"));
        let prompt = DecodedLine {
            prompt: true,
            ..DecodedLine::plain("> ")
        };
        renderer.line("main", &prompt);
        let text = String::from_utf8(renderer.into_inner()).unwrap();
        assert_eq!(text, "hello\n[alt] world\n> ");
    }

    #[test]
    fn test_status_and_close() {
        let (active, rx) = watch::channel(Some("main".to_string()));
        let mut renderer = StdoutRenderer::new(Vec::new(), rx);
        renderer.status(
            "main",
            &StatusMessage {
                level: StatusLevel::Warning,
                text: "未連線".to_string(),
            },
        );
        renderer.closed("main");
        active.send_replace(None);
        renderer.line("main", &DecodedLine::plain("late"));
        let text = String::from_utf8(renderer.into_inner()).unwrap();
        assert_eq!(text, "[main] 警告: 未連線\n[main] #工作階段已結束\n[main] late\n");
    }
}
