//! ANSI 顏色與樣式
//!
//! 解析 SGR (`ESC [ … m`) 參數並維護目前的文字樣式

/// 文字顏色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    /// 終端預設色
    #[default]
    Default,
    /// 256 色表索引 (0-15 為基本色與高亮色)
    Indexed(u8),
    /// 24 位元真彩色
    Rgb(u8, u8, u8),
}

impl Color {
    /// 轉換為 RGB，預設色返回 `None` 交給渲染端決定
    ///
    /// `bold` 為真時基本色 0-7 會換成對應的高亮色
    pub fn to_rgb(&self, bold: bool) -> Option<(u8, u8, u8)> {
        match *self {
            Color::Default => None,
            Color::Rgb(r, g, b) => Some((r, g, b)),
            Color::Indexed(index) if bold && index < 8 => Some(palette_256(index + 8)),
            Color::Indexed(index) => Some(palette_256(index)),
        }
    }
}

fn basic_color(index: u8, bright: bool) -> (u8, u8, u8) {
    match (index, bright) {
        (0, false) => (0, 0, 0),       // Black
        (0, true) => (128, 128, 128),  // Gray
        (1, false) => (187, 0, 0),     // Red
        (1, true) => (255, 85, 85),    // Bright Red
        (2, false) => (0, 187, 0),     // Green
        (2, true) => (85, 255, 85),    // Bright Green
        (3, false) => (187, 187, 0),   // Yellow
        (3, true) => (255, 255, 85),   // Bright Yellow
        (4, false) => (0, 0, 187),     // Blue
        (4, true) => (85, 85, 255),    // Bright Blue
        (5, false) => (187, 0, 187),   // Magenta
        (5, true) => (255, 85, 255),   // Bright Magenta
        (6, false) => (0, 187, 187),   // Cyan
        (6, true) => (85, 255, 255),   // Bright Cyan
        (7, false) => (187, 187, 187), // White
        _ => (255, 255, 255),          // Bright White
    }
}

fn palette_256(index: u8) -> (u8, u8, u8) {
    if index < 8 {
        basic_color(index, false)
    } else if index < 16 {
        basic_color(index - 8, true)
    } else if index < 232 {
        // 6x6x6 color cube
        let i = index - 16;
        (i / 36 * 51, (i / 6) % 6 * 51, i % 6 * 51)
    } else {
        // Grayscale ramp
        let gray = (index - 232) * 10 + 8;
        (gray, gray, gray)
    }
}

/// 文字樣式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub blink: bool,
    pub reverse: bool,
}

impl Style {
    /// 套用一組 SGR 參數
    pub fn apply_sgr(&mut self, codes: &[u16]) {
        if codes.is_empty() {
            *self = Style::default();
            return;
        }
        let mut i = 0;
        while i < codes.len() {
            let code = codes[i];
            match code {
                0 => *self = Style::default(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                5 | 6 => self.blink = true,
                7 => self.reverse = true,
                22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                25 => self.blink = false,
                27 => self.reverse = false,
                // 前景色
                30..=37 => self.fg = Color::Indexed((code - 30) as u8),
                38 => {
                    if let Some((color, used)) = extended_color(&codes[i + 1..]) {
                        self.fg = color;
                        i += used;
                    }
                }
                39 => self.fg = Color::Default,
                // 背景色
                40..=47 => self.bg = Color::Indexed((code - 40) as u8),
                48 => {
                    if let Some((color, used)) = extended_color(&codes[i + 1..]) {
                        self.bg = color;
                        i += used;
                    }
                }
                49 => self.bg = Color::Default,
                // 高亮前景色 (90-97)
                90..=97 => self.fg = Color::Indexed((code - 90 + 8) as u8),
                // 高亮背景色 (100-107)
                100..=107 => self.bg = Color::Indexed((code - 100 + 8) as u8),
                _ => {}
            }
            i += 1;
        }
    }

    /// 轉回完整的 SGR 序列，先重設再套用所有屬性
    pub fn to_sgr(&self) -> String {
        let mut codes = vec!["0".to_string()];
        let flags = [
            (self.bold, "1"),
            (self.dim, "2"),
            (self.italic, "3"),
            (self.underline, "4"),
            (self.blink, "5"),
            (self.reverse, "7"),
        ];
        codes.extend(flags.iter().filter(|(on, _)| *on).map(|(_, code)| code.to_string()));
        codes.extend(self.fg.sgr_code(30, 90, 38));
        codes.extend(self.bg.sgr_code(40, 100, 48));
        format!("\x1b[{}m", codes.join(";"))
    }
}

impl Color {
    fn sgr_code(&self, base: u8, bright: u8, extended: u8) -> Option<String> {
        match *self {
            Color::Default => None,
            Color::Indexed(i) if i < 8 => Some((base + i).to_string()),
            Color::Indexed(i) if i < 16 => Some((bright + i - 8).to_string()),
            Color::Indexed(i) => Some(format!("{};5;{}", extended, i)),
            Color::Rgb(r, g, b) => Some(format!("{};2;{};{};{}", extended, r, g, b)),
        }
    }
}

/// 解析 `38;5;n` 或 `38;2;r;g;b` 之後的參數，返回顏色與使用掉的參數數
fn extended_color(rest: &[u16]) -> Option<(Color, usize)> {
    match rest {
        [5, n, ..] => Some((Color::Indexed((*n).min(255) as u8), 2)),
        [2, r, g, b, ..] => Some((
            Color::Rgb((*r).min(255) as u8, (*g).min(255) as u8, (*b).min(255) as u8),
            4,
        )),
        _ => None,
    }
}

/// 把 SGR 參數字串轉為數字，空白參數視為 0
pub fn parse_sgr_params(params: &str) -> Vec<u16> {
    if params.is_empty() {
        return Vec::new();
    }
    params
        .split([';', ':'])
        .map(|part| {
            part.chars()
                .filter_map(|c| c.to_digit(10))
                .fold(0u16, |acc, d| acc.saturating_mul(10).saturating_add(d as u16))
        })
        .collect()
}
