//! Telnet 選項協商
//!
//! 追蹤每個選項的協商狀態並回應伺服器的要求：
//! NAWS 視窗大小、TTYPE/MTTS 終端類型、GMCP 結構化資料、MSSP 伺服器狀態
//! 以及 CHARSET 字元集。不支援的選項一律明確拒絕。
//!
//! 客戶端這一端 (DO/DONT 要求、WILL/WONT 回覆) 與伺服器那一端
//! (WILL/WONT 要求、DO/DONT 回覆) 的狀態分開記錄，同一個選項兩端互不影響。

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::protocol::{
    negotiation, subnegotiation, TelnetCommand, TelnetEvent, TelnetOption, TelnetParser,
};

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;
const MSSP_VAR: u8 = 1;
const MSSP_VAL: u8 = 2;
const CHARSET_REQUEST: u8 = 1;
const CHARSET_ACCEPTED: u8 = 2;
const CHARSET_REJECTED: u8 = 3;

/// 單一選項的協商狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionState {
    /// 客戶端已主動提出，等待伺服器回應
    Offered,
    /// 雙方同意，但此選項沒有子協商通道（SGA、ECHO）
    Accepted,
    /// 被任一方拒絕
    Rejected,
    /// 雙方同意且子協商通道已開啟
    Active,
}

/// 選項由哪一端執行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// 客戶端，回應伺服器的 DO/DONT
    Local,
    /// 伺服器，回應伺服器的 WILL/WONT
    Remote,
}

/// 協商過程中產生的事件
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// 伺服器送出 GA/EOR，`offset` 為它在純文字資料中的位置
    GoAhead { offset: usize },
    /// GMCP 訊息，`package` 為套件名稱，`payload` 為原封不動的 JSON 文字
    Gmcp { package: String, payload: String },
    /// MSSP 伺服器狀態表
    ServerStatus(Vec<(String, String)>),
    /// 伺服器同意使用的字元集
    Charset(String),
    /// 選項狀態改變
    StateChanged {
        side: Side,
        option: TelnetOption,
        state: OptionState,
    },
    /// 格式錯誤或不合時宜的協商區塊，已被丟棄
    Violation(String),
}

/// `OptionNegotiator::feed` 的結果
#[derive(Debug, Default, PartialEq)]
pub struct Negotiated {
    /// 去除協商位元組後的純資料
    pub data: Vec<u8>,
    /// 依序發生的協商事件
    pub events: Vec<NegotiationEvent>,
    /// 需要回寫給伺服器的位元組
    pub replies: Vec<u8>,
}

/// 協商器設定
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// 依序回覆的終端類型名稱，最後再回覆 `MTTS <flags>`
    pub ttype_names: Vec<String>,
    /// MTTS 能力位元遮罩
    pub mtts_flags: u32,
    /// 初始視窗大小 (寬, 高)
    pub window_size: (u16, u16),
    /// 連線後主動送出 WILL NAWS
    pub offer_naws: bool,
    pub gmcp: bool,
    pub mssp: bool,
    pub charset: bool,
    pub sga: bool,
    pub echo: bool,
    /// 工作階段目前的編碼名稱，CHARSET 協商時優先接受
    pub encoding: String,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ttype_names: vec!["ANSI".to_string(), "XTERM".to_string()],
            mtts_flags: 137,
            window_size: (150, 40),
            offer_naws: true,
            gmcp: true,
            mssp: true,
            charset: true,
            sga: true,
            echo: false,
            encoding: "UTF-8".to_string(),
        }
    }
}

/// Telnet 選項協商器
pub struct OptionNegotiator {
    config: NegotiatorConfig,
    parser: TelnetParser,
    local: HashMap<TelnetOption, OptionState>,
    remote: HashMap<TelnetOption, OptionState>,
    ttype_replies: usize,
    window_size: (u16, u16),
}

impl OptionNegotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        let window_size = config.window_size;
        Self {
            config,
            parser: TelnetParser::new(),
            local: HashMap::new(),
            remote: HashMap::new(),
            ttype_replies: 0,
            window_size,
        }
    }

    /// 查詢選項的協商狀態，以承載子協商的那一端為準
    pub fn state(&self, option: TelnetOption) -> Option<OptionState> {
        let side = subnegotiation_side(option);
        let other = match side {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        };
        self.side_state(side, option)
            .or_else(|| self.side_state(other, option))
    }

    /// 查詢某一端的協商狀態
    pub fn side_state(&self, side: Side, option: TelnetOption) -> Option<OptionState> {
        self.states(side).get(&option).copied()
    }

    fn states(&self, side: Side) -> &HashMap<TelnetOption, OptionState> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    /// 目前的視窗大小
    pub fn window_size(&self) -> (u16, u16) {
        self.window_size
    }

    /// 連線建立後主動送出的協商
    pub fn start(&mut self) -> Vec<u8> {
        if self.config.offer_naws && self.side_state(Side::Local, TelnetOption::Naws).is_none() {
            self.local.insert(TelnetOption::Naws, OptionState::Offered);
            return negotiation(TelnetCommand::Will, TelnetOption::Naws).to_vec();
        }
        Vec::new()
    }

    /// 處理一段原始位元組
    pub fn feed(&mut self, chunk: &[u8]) -> Negotiated {
        let mut out = Negotiated::default();
        for event in self.parser.feed(chunk) {
            match event {
                TelnetEvent::Data(bytes) => out.data.extend_from_slice(&bytes),
                TelnetEvent::Command(TelnetCommand::GoAhead | TelnetCommand::Eor) => {
                    out.events.push(NegotiationEvent::GoAhead {
                        offset: out.data.len(),
                    });
                }
                TelnetEvent::Command(cmd) => trace!("忽略 Telnet 命令: {:?}", cmd),
                TelnetEvent::Negotiation(cmd, option) => self.on_negotiation(cmd, option, &mut out),
                TelnetEvent::Subnegotiation(option, payload) => {
                    self.on_subnegotiation(option, &payload, &mut out)
                }
                TelnetEvent::Malformed(reason) => violation(&mut out, reason),
            }
        }
        out
    }

    /// 終端大小改變；NAWS 已啟用時返回需要送出的子協商
    pub fn resize(&mut self, width: u16, height: u16) -> Option<Vec<u8>> {
        self.window_size = (width, height);
        if self.side_state(Side::Local, TelnetOption::Naws) == Some(OptionState::Active) {
            Some(self.naws_report())
        } else {
            None
        }
    }

    fn naws_report(&self) -> Vec<u8> {
        let (w, h) = self.window_size;
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&w.to_be_bytes());
        payload.extend_from_slice(&h.to_be_bytes());
        subnegotiation(TelnetOption::Naws, &payload)
    }

    /// 伺服器要啟用它那一端的選項 (WILL)
    fn accepts_remote(&self, option: TelnetOption) -> bool {
        match option {
            TelnetOption::Gmcp => self.config.gmcp,
            TelnetOption::Mssp => self.config.mssp,
            TelnetOption::Charset => self.config.charset,
            TelnetOption::SuppressGoAhead => self.config.sga,
            TelnetOption::Echo => self.config.echo,
            _ => false,
        }
    }

    /// 伺服器要求客戶端啟用選項 (DO)
    fn accepts_local(&self, option: TelnetOption) -> bool {
        matches!(option, TelnetOption::TerminalType | TelnetOption::Naws)
    }

    fn set_state(&mut self, side: Side, option: TelnetOption, state: OptionState, out: &mut Negotiated) {
        let states = match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        };
        if states.insert(option, state) != Some(state) {
            debug!("選項 {:?} ({:?}) 狀態變為 {:?}", option, side, state);
            out.events.push(NegotiationEvent::StateChanged { side, option, state });
        }
    }

    fn on_negotiation(&mut self, cmd: TelnetCommand, option: TelnetOption, out: &mut Negotiated) {
        let side = match cmd {
            TelnetCommand::Will | TelnetCommand::Wont => Side::Remote,
            TelnetCommand::Do | TelnetCommand::Dont => Side::Local,
            _ => return,
        };
        let current = self.side_state(side, option);
        let agreed = matches!(current, Some(OptionState::Accepted | OptionState::Active));
        let agreed_state = if has_subnegotiation(option) {
            OptionState::Active
        } else {
            OptionState::Accepted
        };

        match cmd {
            TelnetCommand::Will => {
                if self.accepts_remote(option) {
                    if !agreed {
                        out.replies.extend_from_slice(&negotiation(TelnetCommand::Do, option));
                    }
                    self.set_state(side, option, agreed_state, out);
                } else {
                    out.replies.extend_from_slice(&negotiation(TelnetCommand::Dont, option));
                    self.set_state(side, option, OptionState::Rejected, out);
                }
            }
            TelnetCommand::Do => {
                if self.accepts_local(option) {
                    if !agreed && current != Some(OptionState::Offered) {
                        out.replies.extend_from_slice(&negotiation(TelnetCommand::Will, option));
                    }
                    self.set_state(side, option, agreed_state, out);
                    if option == TelnetOption::Naws {
                        out.replies.extend_from_slice(&self.naws_report());
                    }
                } else {
                    out.replies.extend_from_slice(&negotiation(TelnetCommand::Wont, option));
                    self.set_state(side, option, OptionState::Rejected, out);
                }
            }
            TelnetCommand::Wont | TelnetCommand::Dont => {
                if agreed {
                    let ack = if cmd == TelnetCommand::Wont {
                        TelnetCommand::Dont
                    } else {
                        TelnetCommand::Wont
                    };
                    out.replies.extend_from_slice(&negotiation(ack, option));
                }
                self.set_state(side, option, OptionState::Rejected, out);
            }
            _ => {}
        }
    }

    fn on_subnegotiation(&mut self, option: TelnetOption, payload: &[u8], out: &mut Negotiated) {
        if self.side_state(subnegotiation_side(option), option) != Some(OptionState::Active) {
            violation(out, format!("選項 {:?} 尚未啟用，丟棄子協商", option));
            return;
        }
        match option {
            TelnetOption::TerminalType => self.reply_ttype(payload, out),
            TelnetOption::Gmcp => {
                let text = String::from_utf8_lossy(payload);
                let (package, body) = match text.split_once(' ') {
                    Some((package, body)) => (package.to_string(), body.trim().to_string()),
                    None => (text.trim().to_string(), String::new()),
                };
                if package.is_empty() {
                    violation(out, "GMCP 訊息缺少套件名稱".to_string());
                    return;
                }
                out.events.push(NegotiationEvent::Gmcp {
                    package,
                    payload: body,
                });
            }
            TelnetOption::Mssp => match parse_mssp(payload) {
                Some(table) => out.events.push(NegotiationEvent::ServerStatus(table)),
                None => violation(out, "MSSP 區塊格式錯誤".to_string()),
            },
            TelnetOption::Charset => self.reply_charset(payload, out),
            other => violation(out, format!("不處理 {:?} 的子協商", other)),
        }
    }

    fn reply_ttype(&mut self, payload: &[u8], out: &mut Negotiated) {
        if payload.first() != Some(&TTYPE_SEND) {
            violation(out, "TTYPE 子協商不是 SEND 請求".to_string());
            return;
        }
        let names = &self.config.ttype_names;
        let name = if self.ttype_replies < names.len() {
            names[self.ttype_replies].clone()
        } else if self.ttype_replies == names.len() {
            format!("MTTS {}", self.config.mtts_flags)
        } else {
            debug!("終端類型協商已結束，忽略重複請求");
            return;
        };
        self.ttype_replies += 1;
        debug!("回覆終端類型: {}", name);

        let mut body = vec![TTYPE_IS];
        body.extend_from_slice(name.as_bytes());
        out.replies
            .extend_from_slice(&subnegotiation(TelnetOption::TerminalType, &body));
    }

    fn reply_charset(&mut self, payload: &[u8], out: &mut Negotiated) {
        let Some((&CHARSET_REQUEST, rest)) = payload.split_first() else {
            trace!("忽略非 REQUEST 的 CHARSET 子協商");
            return;
        };
        let Some((&sep, list)) = rest.split_first() else {
            violation(out, "CHARSET REQUEST 缺少分隔字元".to_string());
            return;
        };
        let offered: Vec<String> = list
            .split(|b| *b == sep)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();

        let wanted = [self.config.encoding.as_str(), "UTF-8"];
        let chosen = wanted.iter().find_map(|want| {
            offered
                .iter()
                .find(|name| name.eq_ignore_ascii_case(want))
                .cloned()
        });

        match chosen {
            Some(name) => {
                let mut body = vec![CHARSET_ACCEPTED];
                body.extend_from_slice(name.as_bytes());
                out.replies
                    .extend_from_slice(&subnegotiation(TelnetOption::Charset, &body));
                out.events.push(NegotiationEvent::Charset(name));
            }
            None => {
                debug!("伺服器提供的字元集皆不支援: {:?}", offered);
                out.replies
                    .extend_from_slice(&subnegotiation(TelnetOption::Charset, &[CHARSET_REJECTED]));
            }
        }
    }
}

fn has_subnegotiation(option: TelnetOption) -> bool {
    matches!(
        option,
        TelnetOption::TerminalType
            | TelnetOption::Naws
            | TelnetOption::Gmcp
            | TelnetOption::Mssp
            | TelnetOption::Charset
    )
}

/// 子協商由哪一端的選項承載：TTYPE 與 NAWS 由客戶端執行，其餘由伺服器執行
fn subnegotiation_side(option: TelnetOption) -> Side {
    match option {
        TelnetOption::TerminalType | TelnetOption::Naws => Side::Local,
        _ => Side::Remote,
    }
}

fn violation(out: &mut Negotiated, reason: String) {
    warn!("Telnet 協商錯誤: {}", reason);
    out.events.push(NegotiationEvent::Violation(reason));
}

/// 解析 MSSP 的 VAR/VAL 序列，同一個 VAR 帶多個 VAL 時展開為多筆
fn parse_mssp(payload: &[u8]) -> Option<Vec<(String, String)>> {
    let (&first, _) = payload.split_first()?;
    if first != MSSP_VAR {
        return None;
    }

    let mut segments: Vec<(u8, &[u8])> = Vec::new();
    let mut mark = first;
    let mut start = 1;
    for (i, &b) in payload.iter().enumerate().skip(1) {
        if b == MSSP_VAR || b == MSSP_VAL {
            segments.push((mark, &payload[start..i]));
            mark = b;
            start = i + 1;
        }
    }
    segments.push((mark, &payload[start..]));

    let mut table = Vec::new();
    let mut var = String::new();
    for (mark, body) in segments {
        let text = String::from_utf8_lossy(body).into_owned();
        if mark == MSSP_VAR {
            var = text;
        } else {
            table.push((var.clone(), text));
        }
    }
    Some(table)
}

#[cfg(test)]
mod tests {
    use super::super::protocol::IAC;
    use super::*;

    const WILL: u8 = 251;
    const WONT: u8 = 252;
    const DO: u8 = 253;
    const DONT: u8 = 254;
    const SB: u8 = 250;
    const SE: u8 = 240;

    fn negotiator() -> OptionNegotiator {
        OptionNegotiator::new(NegotiatorConfig {
            offer_naws: false,
            ..Default::default()
        })
    }

    fn ttype_request() -> Vec<u8> {
        vec![IAC, SB, 24, TTYPE_SEND, IAC, SE]
    }

    fn ttype_reply(name: &str) -> Vec<u8> {
        let mut v = vec![IAC, SB, 24, TTYPE_IS];
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(&[IAC, SE]);
        v
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let mut n = negotiator();
        let out = n.feed(&[IAC, WILL, 99, IAC, DO, 98]);
        assert_eq!(out.replies, vec![IAC, DONT, 99, IAC, WONT, 98]);
        assert_eq!(n.state(TelnetOption::Unknown(99)), Some(OptionState::Rejected));
        assert_eq!(n.state(TelnetOption::Unknown(98)), Some(OptionState::Rejected));
    }

    #[test]
    fn test_plain_data_passes_through() {
        let mut n = negotiator();
        let out = n.feed(&[b'h', b'i', IAC, IAC, b'\n']);
        assert_eq!(out.data, vec![b'h', b'i', 255, b'\n']);
        assert!(out.replies.is_empty());
    }

    #[test]
    fn test_ttype_mtts_sequence() {
        let mut n = negotiator();
        let out = n.feed(&[IAC, DO, 24]);
        assert_eq!(out.replies, vec![IAC, WILL, 24]);
        assert_eq!(n.state(TelnetOption::TerminalType), Some(OptionState::Active));

        assert_eq!(n.feed(&ttype_request()).replies, ttype_reply("ANSI"));
        assert_eq!(n.feed(&ttype_request()).replies, ttype_reply("XTERM"));
        assert_eq!(n.feed(&ttype_request()).replies, ttype_reply("MTTS 137"));
        // 送出能力遮罩之後不再回覆
        assert!(n.feed(&ttype_request()).replies.is_empty());
        assert!(n.feed(&ttype_request()).replies.is_empty());
    }

    #[test]
    fn test_subnegotiation_before_active_is_dropped() {
        let mut n = negotiator();
        let out = n.feed(&ttype_request());
        assert!(out.replies.is_empty());
        assert!(matches!(out.events[0], NegotiationEvent::Violation(_)));
    }

    #[test]
    fn test_naws_on_do_and_resize() {
        let mut n = negotiator();
        assert_eq!(n.resize(100, 30), None);
        let out = n.feed(&[IAC, DO, 31]);
        assert_eq!(
            out.replies,
            vec![IAC, WILL, 31, IAC, SB, 31, 0, 100, 0, 30, IAC, SE]
        );
        let report = n.resize(300, 255).unwrap();
        // 255 的高度位元組需要加倍
        assert_eq!(report, vec![IAC, SB, 31, 1, 44, 0, 255, 255, IAC, SE]);
    }

    #[test]
    fn test_naws_offered_proactively() {
        let mut n = OptionNegotiator::new(NegotiatorConfig::default());
        assert_eq!(n.start(), vec![IAC, WILL, 31]);
        assert_eq!(n.state(TelnetOption::Naws), Some(OptionState::Offered));
        let out = n.feed(&[IAC, DO, 31]);
        // 已經說過 WILL，只送出大小
        assert_eq!(out.replies, vec![IAC, SB, 31, 0, 150, 0, 40, IAC, SE]);
    }

    #[test]
    fn test_gmcp_event() {
        let mut n = negotiator();
        let out = n.feed(&[IAC, WILL, 201]);
        assert_eq!(out.replies, vec![IAC, DO, 201]);

        let mut block = vec![IAC, SB, 201];
        block.extend_from_slice(br#"Char.Vitals {"hp": 10}"#);
        block.extend_from_slice(&[IAC, SE]);
        let (head, tail) = block.split_at(7);
        let mut events = n.feed(head).events;
        events.extend(n.feed(tail).events);
        assert_eq!(
            events,
            vec![NegotiationEvent::Gmcp {
                package: "Char.Vitals".to_string(),
                payload: r#"{"hp": 10}"#.to_string(),
            }]
        );
    }

    #[test]
    fn test_mssp_table() {
        let mut n = negotiator();
        n.feed(&[IAC, WILL, 70]);
        let mut block = vec![IAC, SB, 70, MSSP_VAR];
        block.extend_from_slice(b"NAME");
        block.push(MSSP_VAL);
        block.extend_from_slice(b"Test MUD");
        block.push(MSSP_VAR);
        block.extend_from_slice(b"PORT");
        block.push(MSSP_VAL);
        block.extend_from_slice(b"4000");
        block.push(MSSP_VAL);
        block.extend_from_slice(b"4001");
        block.extend_from_slice(&[IAC, SE]);
        let out = n.feed(&block);
        assert_eq!(
            out.events,
            vec![NegotiationEvent::ServerStatus(vec![
                ("NAME".to_string(), "Test MUD".to_string()),
                ("PORT".to_string(), "4000".to_string()),
                ("PORT".to_string(), "4001".to_string()),
            ])]
        );
    }

    #[test]
    fn test_charset_accepts_utf8() {
        let mut n = negotiator();
        n.feed(&[IAC, WILL, 42]);
        let mut block = vec![IAC, SB, 42, CHARSET_REQUEST, b';'];
        block.extend_from_slice(b"BIG5;utf-8");
        block.extend_from_slice(&[IAC, SE]);
        let out = n.feed(&block);
        let mut expected = vec![IAC, SB, 42, CHARSET_ACCEPTED];
        expected.extend_from_slice(b"utf-8");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(out.replies, expected);
        assert_eq!(out.events, vec![NegotiationEvent::Charset("utf-8".to_string())]);
    }

    #[test]
    fn test_go_ahead_offset() {
        let mut n = negotiator();
        let out = n.feed(&[b'H', b'P', b'>', IAC, 249, b'x']);
        assert_eq!(out.data, b"HP>x".to_vec());
        assert_eq!(out.events, vec![NegotiationEvent::GoAhead { offset: 3 }]);
    }

    #[test]
    fn test_wont_after_agreement_is_acknowledged_once() {
        let mut n = negotiator();
        n.feed(&[IAC, WILL, 3]);
        assert_eq!(n.state(TelnetOption::SuppressGoAhead), Some(OptionState::Accepted));
        let out = n.feed(&[IAC, WONT, 3]);
        assert_eq!(out.replies, vec![IAC, DONT, 3]);
        let out = n.feed(&[IAC, WONT, 3]);
        assert!(out.replies.is_empty());
    }

    #[test]
    fn test_sides_are_tracked_separately() {
        let mut n = negotiator();
        n.feed(&[IAC, DO, 24]);
        // 伺服器自己要執行 TTYPE 不影響客戶端已同意的那一端
        let out = n.feed(&[IAC, WILL, 24]);
        assert_eq!(out.replies, vec![IAC, DONT, 24]);
        assert_eq!(n.side_state(Side::Remote, TelnetOption::TerminalType), Some(OptionState::Rejected));
        assert_eq!(n.side_state(Side::Local, TelnetOption::TerminalType), Some(OptionState::Active));
        assert_eq!(n.state(TelnetOption::TerminalType), Some(OptionState::Active));
        assert_eq!(n.feed(&ttype_request()).replies, ttype_reply("ANSI"));
    }

    #[test]
    fn test_remote_refusal_keeps_local_naws() {
        let mut n = negotiator();
        n.feed(&[IAC, DO, 31]);
        let out = n.feed(&[IAC, WONT, 31]);
        // 伺服器那一端從未同意，不需要回覆
        assert!(out.replies.is_empty());
        assert!(n.resize(80, 24).is_some());

        n.feed(&[IAC, WILL, 201]);
        let out = n.feed(&[IAC, DONT, 201]);
        assert!(out.replies.is_empty());
        assert_eq!(n.side_state(Side::Remote, TelnetOption::Gmcp), Some(OptionState::Active));
        assert_eq!(
            out.events,
            vec![NegotiationEvent::StateChanged {
                side: Side::Local,
                option: TelnetOption::Gmcp,
                state: OptionState::Rejected,
            }]
        );
    }
}
