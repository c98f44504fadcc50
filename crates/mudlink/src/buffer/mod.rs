//! 訊息緩衝區模組
//!
//! - `ansi`: SGR 樣式解析
//! - `line`: 行組裝
//! - `Scrollback`: 固定容量（或不限容量）的歷史行緩衝區，附分割檢視的釘選位置

pub mod ansi;
pub mod line;

use std::collections::VecDeque;

pub use ansi::{Color, Style};
pub use line::{DecodedLine, LineAssembler, Span};

/// 歷史行緩衝區
///
/// 超過容量時從最舊的一端移除。分割檢視的上半部釘選在 `pin` 指向的行，
/// 新行加入時不會移動；舊行被移除時索引會跟著調整，
/// 指向已移除行的釘選則夾到目前最舊的一行。
#[derive(Debug, Clone)]
pub struct Scrollback {
    lines: VecDeque<DecodedLine>,
    capacity: Option<usize>,
    pin: Option<usize>,
}

impl Scrollback {
    /// 創建新的緩衝區，`capacity` 為 0 表示不限容量
    ///
    /// # Example
    /// ```
    /// use mudlink::buffer::{DecodedLine, Scrollback};
    ///
    /// let mut buffer = Scrollback::new(2);
    /// for text in ["a", "b", "c"] {
    ///     buffer.push(DecodedLine::plain(text));
    /// }
    /// assert_eq!(buffer.len(), 2);
    /// assert_eq!(buffer.get(0).unwrap().text(), "b");
    /// ```
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            return Self::unbounded();
        }
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity: Some(capacity),
            pin: None,
        }
    }

    /// 不會移除任何行的緩衝區
    pub fn unbounded() -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: None,
            pin: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// 加入一行，返回被移除的最舊行
    pub fn push(&mut self, line: DecodedLine) -> Option<DecodedLine> {
        self.lines.push_back(line);
        match self.capacity {
            Some(cap) if self.lines.len() > cap => {
                let evicted = self.lines.pop_front();
                self.pin = self.pin.map(|p| p.saturating_sub(1));
                evicted
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DecodedLine> {
        self.lines.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodedLine> {
        self.lines.iter()
    }

    /// 獲取最後 n 行
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &DecodedLine> {
        self.lines.iter().skip(self.lines.len().saturating_sub(n))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.pin = None;
    }

    /// 分割檢視的釘選位置
    pub fn pin(&self) -> Option<usize> {
        self.pin
    }

    /// 進入分割檢視，`at` 為 `None` 時釘選在最新一行
    ///
    /// 超出範圍的索引會夾到最新一行；緩衝區為空時無法分割。
    pub fn split(&mut self, at: Option<usize>) -> Option<usize> {
        let newest = self.lines.len().checked_sub(1)?;
        let index = at.map_or(newest, |i| i.min(newest));
        self.pin = Some(index);
        self.pin
    }

    /// 離開分割檢視
    pub fn unsplit(&mut self) {
        self.pin = None;
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(5000) // 預設容量 5000 行
    }
}
