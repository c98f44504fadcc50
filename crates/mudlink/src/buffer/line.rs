//! 行組裝
//!
//! 將解碼後的文字切成行，並把內嵌的 ANSI 序列轉成帶樣式的片段。
//! 未完成的轉義序列會保留到下一次 `feed`，樣式也會延續到下一行。

use super::ansi::{parse_sgr_params, Style};

const MAX_CSI_LEN: usize = 64;

/// 帶樣式的文字片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub style: Style,
}

/// 組裝完成的一行，送出後不再修改
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedLine {
    pub spans: Vec<Span>,
    /// 由 GA 送出的提示行（沒有換行結尾）
    pub prompt: bool,
}

impl DecodedLine {
    /// 從純文字建立沒有樣式的一行
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        let spans = if text.is_empty() {
            Vec::new()
        } else {
            vec![Span {
                text,
                style: Style::default(),
            }]
        };
        Self {
            spans,
            prompt: false,
        }
    }

    /// 去除樣式後的文字，觸發器以此比對
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// 轉回含 SGR 序列的文字，raw 觸發器與終端輸出都使用這個形式
    ///
    /// 樣式只在片段之間改變時輸出，結尾若有樣式則重設。
    pub fn to_ansi(&self) -> String {
        let mut out = String::new();
        let mut current = Style::default();
        for span in &self.spans {
            if span.style != current {
                out.push_str(&span.style.to_sgr());
                current = span.style;
            }
            out.push_str(&span.text);
        }
        if current != Style::default() {
            out.push_str("\x1b[0m");
        }
        out
    }

    /// 把可能含 ANSI 序列的文字解析成一行，換行字元之後的內容併入同一行
    pub fn from_ansi(text: &str) -> Self {
        let mut assembler = LineAssembler::default();
        let mut spans: Vec<Span> = assembler.feed(text).into_iter().flat_map(|l| l.spans).collect();
        if let Some(rest) = assembler.finish() {
            spans.extend(rest.spans);
        }
        Self { spans, prompt: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EscapeState {
    Text,
    Esc,
    Csi(String),
    Osc,
    OscEsc,
}

/// 行組裝器
#[derive(Debug)]
pub struct LineAssembler {
    state: EscapeState,
    style: Style,
    spans: Vec<Span>,
    column: usize,
    tabstop: usize,
}

impl LineAssembler {
    pub fn new(tabstop: usize) -> Self {
        Self {
            state: EscapeState::Text,
            style: Style::default(),
            spans: Vec::new(),
            column: 0,
            tabstop: tabstop.max(1),
        }
    }

    /// 目前的樣式
    pub fn style(&self) -> Style {
        self.style
    }

    /// 餵入文字，返回已完成的行
    pub fn feed(&mut self, text: &str) -> Vec<DecodedLine> {
        let mut lines = Vec::new();
        for c in text.chars() {
            self.state = match std::mem::replace(&mut self.state, EscapeState::Text) {
                EscapeState::Text => match c {
                    '\x1b' => EscapeState::Esc,
                    '\n' => {
                        lines.push(self.take_line(false));
                        EscapeState::Text
                    }
                    '\t' => {
                        let width = self.tabstop - self.column % self.tabstop;
                        for _ in 0..width {
                            self.push_char(' ');
                        }
                        EscapeState::Text
                    }
                    c if c.is_control() => EscapeState::Text,
                    c => {
                        self.push_char(c);
                        EscapeState::Text
                    }
                },
                EscapeState::Esc => match c {
                    '[' => EscapeState::Csi(String::new()),
                    ']' => EscapeState::Osc,
                    // 兩字元序列，例如 ESC 7 / ESC 8
                    _ => EscapeState::Text,
                },
                EscapeState::Csi(mut params) => {
                    if ('\x40'..='\x7e').contains(&c) {
                        if c == 'm' {
                            self.style.apply_sgr(&parse_sgr_params(&params));
                        }
                        EscapeState::Text
                    } else if ('\x20'..='\x3f').contains(&c) && params.len() < MAX_CSI_LEN {
                        params.push(c);
                        EscapeState::Csi(params)
                    } else {
                        // 不合法或過長的序列直接丟棄
                        EscapeState::Text
                    }
                }
                EscapeState::Osc => match c {
                    '\x07' => EscapeState::Text,
                    '\x1b' => EscapeState::OscEsc,
                    _ => EscapeState::Osc,
                },
                EscapeState::OscEsc => match c {
                    '\\' => EscapeState::Text,
                    _ => EscapeState::Osc,
                },
            };
        }
        lines
    }

    /// 伺服器送出 GA 時把未完成的行當成提示行送出
    pub fn flush_prompt(&mut self) -> Option<DecodedLine> {
        if self.spans.is_empty() {
            None
        } else {
            Some(self.take_line(true))
        }
    }

    /// 連線結束時送出殘留內容並重設狀態
    pub fn finish(&mut self) -> Option<DecodedLine> {
        self.state = EscapeState::Text;
        let line = self.flush_prompt().map(|mut line| {
            line.prompt = false;
            line
        });
        self.style = Style::default();
        line
    }

    fn push_char(&mut self, c: char) {
        self.column += 1;
        match self.spans.last_mut() {
            Some(span) if span.style == self.style => span.text.push(c),
            _ => self.spans.push(Span {
                text: c.to_string(),
                style: self.style,
            }),
        }
    }

    fn take_line(&mut self, prompt: bool) -> DecodedLine {
        self.column = 0;
        DecodedLine {
            spans: std::mem::take(&mut self.spans),
            prompt,
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(4)
    }
}
