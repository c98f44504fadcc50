//! 記錄檔模組
//!
//! 把工作階段收到的每一行寫入檔案，可選純文字或 HTML。

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::buffer::{Color, DecodedLine, Span};
use crate::settings::LogFormat;

/// 記錄檔錯誤
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("IO 錯誤: {0}")]
    Io(#[from] io::Error),

    #[error("記錄檔未開啟")]
    NotOpen,
}

/// 工作階段記錄檔
pub struct Transcript {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    format: LogFormat,
}

impl Transcript {
    /// 以附加模式開啟記錄檔，HTML 格式會寫入檔頭
    pub fn open(path: impl AsRef<Path>, format: LogFormat) -> Result<Self, TranscriptError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut transcript = Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            format,
        };
        if format == LogFormat::Html {
            transcript.write_raw(HTML_HEADER)?;
        }
        Ok(transcript)
    }

    /// 工作階段記錄檔的預設路徑：`<dir>/<session>.log` 或 `.html`
    pub fn path_for(dir: &Path, session: &str, format: LogFormat) -> PathBuf {
        let ext = match format {
            LogFormat::Text => "log",
            LogFormat::Html => "html",
        };
        dir.join(format!("{}.{}", session, ext))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// 寫入一行
    pub fn write_line(&mut self, line: &DecodedLine) -> Result<(), TranscriptError> {
        let text = match self.format {
            LogFormat::Text => format!("{}\n", line.text()),
            LogFormat::Html => format!("{}<br>\n", line_to_html(line)),
        };
        self.write_raw(&text)
    }

    pub fn flush(&mut self) -> Result<(), TranscriptError> {
        let writer = self.writer.as_mut().ok_or(TranscriptError::NotOpen)?;
        writer.flush()?;
        Ok(())
    }

    /// 關閉記錄檔，HTML 格式會寫入檔尾
    pub fn close(&mut self) -> Result<(), TranscriptError> {
        if self.writer.is_none() {
            return Ok(());
        }
        if self.format == LogFormat::Html {
            self.write_raw(HTML_FOOTER)?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn write_raw(&mut self, text: &str) -> Result<(), TranscriptError> {
        let writer = self.writer.as_mut().ok_or(TranscriptError::NotOpen)?;
        writer.write_all(text.as_bytes())?;
        Ok(())
    }
}

impl Drop for Transcript {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

const HTML_HEADER: &str = "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
<style>body { background: #000; color: #c0c0c0; font-family: monospace; white-space: pre; }</style>\n\
</head>\n<body>\n";

const HTML_FOOTER: &str = "</body>\n</html>\n";

/// 把一行轉為 HTML，每個有樣式的片段包在 `<span>` 中
pub fn line_to_html(line: &DecodedLine) -> String {
    let mut html = String::new();
    for span in &line.spans {
        let style = span_css(span);
        if style.is_empty() {
            html.push_str(&escape_html(&span.text));
        } else {
            let _ = write!(html, "<span style=\"{}\">{}</span>", style, escape_html(&span.text));
        }
    }
    html
}

fn span_css(span: &Span) -> String {
    let style = &span.style;
    let (mut fg, mut bg) = (style.fg, style.bg);
    if style.reverse {
        std::mem::swap(&mut fg, &mut bg);
    }
    let mut css = Vec::new();
    if let Some((r, g, b)) = fg.to_rgb(style.bold) {
        css.push(format!("color: #{:02x}{:02x}{:02x}", r, g, b));
    } else if style.reverse {
        css.push("color: #000000".to_string());
    }
    if let Some((r, g, b)) = bg.to_rgb(false) {
        css.push(format!("background: #{:02x}{:02x}{:02x}", r, g, b));
    } else if style.reverse && fg == Color::Default {
        css.push("background: #c0c0c0".to_string());
    }
    if style.bold {
        css.push("font-weight: bold".to_string());
    }
    if style.italic {
        css.push("font-style: italic".to_string());
    }
    if style.underline {
        css.push("text-decoration: underline".to_string());
    }
    css.join("; ")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LineAssembler;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("mudlink-transcript-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_plain_text_transcript() {
        let path = temp_path("plain.log");
        let _ = fs::remove_file(&path);
        let mut asm = LineAssembler::default();
        let lines = asm.feed("\x1b[31mred\x1b[0m line\n");
        {
            let mut transcript = Transcript::open(&path, LogFormat::Text).unwrap();
            transcript.write_line(&lines[0]).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "red line\n");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_html_escapes_and_colors() {
        let mut asm = LineAssembler::default();
        let lines = asm.feed("\x1b[32m<ok>\x1b[0m & done\n");
        let html = line_to_html(&lines[0]);
        assert!(html.starts_with("<span style=\"color: #"));
        assert!(html.contains("&lt;ok&gt;"));
        assert!(html.ends_with(" &amp; done"));
    }

    #[test]
    fn test_html_file_has_header_and_footer() {
        let path = temp_path("page.html");
        let _ = fs::remove_file(&path);
        {
            let mut transcript = Transcript::open(&path, LogFormat::Html).unwrap();
            transcript.write_line(&DecodedLine::plain("hi")).unwrap();
            transcript.close().unwrap();
            assert!(!transcript.is_open());
        }
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("<!DOCTYPE html>"));
        assert!(content.contains("hi<br>"));
        assert!(content.ends_with("</html>\n"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_path_for() {
        let path = Transcript::path_for(Path::new("logs"), "pk", LogFormat::Html);
        assert_eq!(path, Path::new("logs/pk.html"));
    }
}
