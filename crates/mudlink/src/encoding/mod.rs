//! 編解碼模組
//!
//! 以 encoding_rs 的串流解碼器處理 UTF-8、GBK 與 Big5。
//! 解碼器在呼叫之間保留未完成的多位元組序列，網路讀取把一個中文字
//! 切成兩半時不會產生亂碼。無法解碼的位元組以 U+FFFD 取代。

use encoding_rs::{CoderResult, Decoder, Encoding, BIG5, GB18030, UTF_8};
use tracing::debug;

const ESC: u8 = 0x1b;
const MAX_ESCAPE_LEN: usize = 32;

/// 無法解碼時使用的替代字元
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// 工作階段可選的文字編碼
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// GBK，實際以 GB18030 解碼（GBK 的超集）
    Gbk,
    Big5,
}

impl TextEncoding {
    /// 從編碼名稱解析，不分大小寫
    ///
    /// # Example
    /// ```
    /// use mudlink::encoding::TextEncoding;
    ///
    /// assert_eq!(TextEncoding::from_label("gb2312"), Some(TextEncoding::Gbk));
    /// assert_eq!(TextEncoding::from_label("BIG5"), Some(TextEncoding::Big5));
    /// ```
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "gbk" | "gb2312" | "gb18030" | "cp936" => Some(Self::Gbk),
            "big5" | "big5-hkscs" | "cp950" => Some(Self::Big5),
            _ => None,
        }
    }

    /// 標準名稱
    pub fn label(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Gbk => "GBK",
            Self::Big5 => "BIG5",
        }
    }

    fn encoding(&self) -> &'static Encoding {
        match self {
            Self::Utf8 => UTF_8,
            Self::Gbk => GB18030,
            Self::Big5 => BIG5,
        }
    }

    fn is_double_byte(&self) -> bool {
        matches!(self, Self::Gbk | Self::Big5)
    }
}

/// 將字串編碼為指定編碼的位元組（無法編碼的字元會被替換）
///
/// # Example
/// ```
/// use mudlink::encoding::{encode, TextEncoding};
///
/// assert_eq!(encode("你好", TextEncoding::Big5), vec![0xa7, 0x41, 0xa6, 0x6e]);
/// ```
pub fn encode(text: &str, encoding: TextEncoding) -> Vec<u8> {
    let (encoded, _, had_errors) = encoding.encoding().encode(text);
    if had_errors {
        debug!("部分字元無法以 {} 編碼", encoding.label());
    }
    encoded.into_owned()
}

/// 串流解碼器
pub struct StreamDecoder {
    encoding: TextEncoding,
    decoder: Decoder,
    framer: CharFramer,
    replacements: u64,
}

impl StreamDecoder {
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            decoder: encoding.encoding().new_decoder_without_bom_handling(),
            framer: CharFramer::default(),
            replacements: 0,
        }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// 切換編碼，尚未完成的位元組會被捨棄
    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        *self = Self {
            replacements: self.replacements,
            ..Self::new(encoding)
        };
    }

    /// 到目前為止以替代字元取代的次數
    pub fn replacements(&self) -> u64 {
        self.replacements
    }

    /// 餵入一段位元組，返回可以確定的文字
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        if self.encoding.is_double_byte() {
            let mut framed = Vec::with_capacity(bytes.len());
            self.framer.frame(self.encoding, bytes, &mut framed);
            self.decode(&framed, false)
        } else {
            self.decode(bytes, false)
        }
    }

    /// 連線結束時取出所有殘留內容
    pub fn finish(&mut self) -> String {
        let mut rest = Vec::new();
        self.framer.flush(&mut rest);
        let text = self.decode(&rest, true);
        self.decoder = self.encoding.encoding().new_decoder_without_bom_handling();
        text
    }

    fn decode(&mut self, mut input: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(input.len())
                .unwrap_or(input.len() * 3 + 16);
            out.reserve(needed);
            let before = out.len();
            let (result, read, had_errors) = self.decoder.decode_to_string(input, &mut out, last);
            if had_errors {
                let count = out[before..].matches(REPLACEMENT_CHAR).count() as u64;
                self.replacements += count;
                debug!("{} 解碼時以替代字元取代了 {} 處", self.encoding.label(), count);
            }
            input = &input[read..];
            if let CoderResult::InputEmpty = result {
                break;
            }
        }
        out
    }
}

/// 雙位元組編碼的字元切分器
///
/// 只把完整的字元交給解碼器。若字元的兩個位元組之間夾了 ANSI 序列
/// （部分 MUD 用來替半個字上色），序列會移到該字元之後；
/// 單純的 `ESC[m` 重設則移到字元之前。
#[derive(Debug, Default)]
struct CharFramer {
    pending: Vec<u8>,
    need: usize,
    escape: Vec<u8>,
    before: Vec<u8>,
    after: Vec<u8>,
}

impl CharFramer {
    fn frame(&mut self, encoding: TextEncoding, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if !self.escape.is_empty() {
                self.escape.push(b);
                if escape_complete(&self.escape) {
                    let seq = std::mem::take(&mut self.escape);
                    if seq == b"\x1b[m" {
                        self.before.extend_from_slice(&seq);
                    } else {
                        self.after.extend_from_slice(&seq);
                    }
                }
                continue;
            }

            if self.need > 0 {
                if b == ESC {
                    self.escape.push(b);
                    continue;
                }
                self.pending.push(b);
                self.need -= 1;
                // GB18030 四位元組序列：第二個位元組為數字
                if encoding == TextEncoding::Gbk && self.pending.len() == 2 && b.is_ascii_digit() {
                    self.need = 2;
                }
                if self.need == 0 {
                    out.append(&mut self.before);
                    out.append(&mut self.pending);
                    out.append(&mut self.after);
                }
                continue;
            }

            if (0x81..=0xfe).contains(&b) {
                self.pending.push(b);
                self.need = 1;
            } else {
                out.push(b);
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.before);
        out.append(&mut self.pending);
        out.append(&mut self.escape);
        out.append(&mut self.after);
        self.need = 0;
    }
}

fn escape_complete(seq: &[u8]) -> bool {
    match seq {
        [_, b'['] => false,
        [_, _] => true,
        [_, b'[', .., last] => (0x40..=0x7e).contains(last) || seq.len() >= MAX_ESCAPE_LEN,
        _ => seq.len() >= MAX_ESCAPE_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BIG5_NIHAO: [u8; 4] = [0xa7, 0x41, 0xa6, 0x6e];
    const GBK_NIHAO: [u8; 4] = [0xc4, 0xe3, 0xba, 0xc3];

    fn decode_all(encoding: TextEncoding, bytes: &[u8]) -> String {
        let mut decoder = StreamDecoder::new(encoding);
        let mut text = decoder.feed(bytes);
        text.push_str(&decoder.finish());
        text
    }

    fn decode_chunks(encoding: TextEncoding, bytes: &[u8], cuts: &[usize]) -> String {
        let mut decoder = StreamDecoder::new(encoding);
        let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
        cuts.sort_unstable();
        let mut text = String::new();
        let mut start = 0;
        for cut in cuts {
            text.push_str(&decoder.feed(&bytes[start..cut]));
            start = cut;
        }
        text.push_str(&decoder.feed(&bytes[start..]));
        text.push_str(&decoder.finish());
        text
    }

    #[test]
    fn test_from_label() {
        assert_eq!(TextEncoding::from_label("UTF-8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_label(" gb18030 "), Some(TextEncoding::Gbk));
        assert_eq!(TextEncoding::from_label("latin1"), None);
    }

    #[test]
    fn test_decode_big5_chinese() {
        assert_eq!(decode_all(TextEncoding::Big5, &BIG5_NIHAO), "你好");
    }

    #[test]
    fn test_decode_gbk_chinese() {
        assert_eq!(decode_all(TextEncoding::Gbk, &GBK_NIHAO), "你好");
    }

    #[test]
    fn test_big5_split_at_read_boundary() {
        let mut decoder = StreamDecoder::new(TextEncoding::Big5);
        assert_eq!(decoder.feed(&[b'H', b'i', 0xa7]), "Hi");
        assert_eq!(decoder.feed(&[0x41, 0xa6]), "你");
        assert_eq!(decoder.feed(&[0x6e]), "好");
    }

    #[test]
    fn test_utf8_split_at_read_boundary() {
        let bytes = "你好".as_bytes();
        let mut decoder = StreamDecoder::new(TextEncoding::Utf8);
        assert_eq!(decoder.feed(&bytes[..2]), "");
        assert_eq!(decoder.feed(&bytes[2..4]), "你");
        assert_eq!(decoder.feed(&bytes[4..]), "好");
    }

    #[test]
    fn test_gb18030_four_byte_sequence() {
        let bytes = encode("€😀", TextEncoding::Gbk);
        let mut decoder = StreamDecoder::new(TextEncoding::Gbk);
        let mut text = String::new();
        for b in &bytes {
            text.push_str(&decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(text, "€😀");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = StreamDecoder::new(TextEncoding::Utf8);
        let text = decoder.feed(&[b'a', 0xff, b'b']);
        assert_eq!(text, "a\u{FFFD}b");
        assert_eq!(decoder.replacements(), 1);
    }

    #[test]
    fn test_escape_inside_double_byte_character() {
        // 0xa7 [ESC[31m] 0x41：顏色碼應移到「你」之後
        let mut bytes = vec![0xa7];
        bytes.extend_from_slice(b"\x1b[31m");
        bytes.push(0x41);
        assert_eq!(decode_all(TextEncoding::Big5, &bytes), "你\x1b[31m");

        let mut bytes = vec![0xa7];
        bytes.extend_from_slice(b"\x1b[m");
        bytes.push(0x41);
        assert_eq!(decode_all(TextEncoding::Big5, &bytes), "\x1b[m你");
    }

    #[test]
    fn test_encode_roundtrip() {
        assert_eq!(encode("你好", TextEncoding::Gbk), GBK_NIHAO.to_vec());
        assert_eq!(encode("abc", TextEncoding::Utf8), b"abc".to_vec());
    }

    fn sample_bytes(encoding: TextEncoding) -> impl Strategy<Value = Vec<u8>> {
        let pieces = prop_oneof![
            "[a-zA-Z0-9 \n]{0,8}".prop_map(move |s| encode(&s, encoding)),
            "[你好世界測試中文字]{1,4}".prop_map(move |s| encode(&s, encoding)),
            Just(b"\x1b[1;31m".to_vec()),
            prop::collection::vec(any::<u8>(), 0..4),
        ];
        prop::collection::vec(pieces, 0..12).prop_map(|v| v.concat())
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_utf8(bytes in sample_bytes(TextEncoding::Utf8),
                                         cuts in prop::collection::vec(any::<usize>(), 0..6)) {
            prop_assert_eq!(decode_chunks(TextEncoding::Utf8, &bytes, &cuts),
                            decode_all(TextEncoding::Utf8, &bytes));
        }

        #[test]
        fn chunking_does_not_change_gbk(bytes in sample_bytes(TextEncoding::Gbk),
                                        cuts in prop::collection::vec(any::<usize>(), 0..6)) {
            prop_assert_eq!(decode_chunks(TextEncoding::Gbk, &bytes, &cuts),
                            decode_all(TextEncoding::Gbk, &bytes));
        }

        #[test]
        fn chunking_does_not_change_big5(bytes in sample_bytes(TextEncoding::Big5),
                                         cuts in prop::collection::vec(any::<usize>(), 0..6)) {
            prop_assert_eq!(decode_chunks(TextEncoding::Big5, &bytes, &cuts),
                            decode_all(TextEncoding::Big5, &bytes));
        }
    }
}
