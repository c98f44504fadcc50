//! Telnet 協定常數和串流解析
//!
//! 實作 RFC 854 Telnet 協定的命令序列，解析器可跨越多次讀取保留狀態，
//! 因此子協商區塊被切成好幾段送達時也能正確組回。

/// Telnet IAC (Interpret As Command) - 0xFF
pub const IAC: u8 = 255;

/// 子協商內容的長度上限，超過即視為格式錯誤
pub const SB_MAX_LEN: usize = 64 * 1024;

/// Telnet 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TelnetCommand {
    /// End of Record
    Eor = 239,
    /// Sub-negotiation End
    Se = 240,
    /// No Operation
    Nop = 241,
    /// Data Mark
    DataMark = 242,
    /// Break
    Break = 243,
    /// Interrupt Process
    InterruptProcess = 244,
    /// Abort Output
    AbortOutput = 245,
    /// Are You There
    AreYouThere = 246,
    /// Erase Character
    EraseCharacter = 247,
    /// Erase Line
    EraseLine = 248,
    /// Go Ahead
    GoAhead = 249,
    /// Sub-negotiation Begin
    Sb = 250,
    /// Will
    Will = 251,
    /// Won't
    Wont = 252,
    /// Do
    Do = 253,
    /// Don't
    Dont = 254,
}

impl TelnetCommand {
    /// 從位元組解析 Telnet 命令
    pub fn from_byte(byte: u8) -> Option<Self> {
        let cmd = match byte {
            239 => Self::Eor,
            240 => Self::Se,
            241 => Self::Nop,
            242 => Self::DataMark,
            243 => Self::Break,
            244 => Self::InterruptProcess,
            245 => Self::AbortOutput,
            246 => Self::AreYouThere,
            247 => Self::EraseCharacter,
            248 => Self::EraseLine,
            249 => Self::GoAhead,
            250 => Self::Sb,
            251 => Self::Will,
            252 => Self::Wont,
            253 => Self::Do,
            254 => Self::Dont,
            _ => return None,
        };
        Some(cmd)
    }

    /// 是否為 WILL/WONT/DO/DONT 這類需要選項位元組的協商命令
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Will | Self::Wont | Self::Do | Self::Dont)
    }
}

/// Telnet 選項
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelnetOption {
    /// Echo
    Echo,
    /// Suppress Go Ahead
    SuppressGoAhead,
    /// Terminal Type (TTYPE / MTTS)
    TerminalType,
    /// Window Size (NAWS)
    Naws,
    /// New Environ (MNES)
    NewEnviron,
    /// Charset
    Charset,
    /// MUD Server Data Protocol
    Msdp,
    /// MUD Server Status Protocol
    Mssp,
    /// MCCP2
    Mccp2,
    /// GMCP (Generic MUD Communication Protocol)
    Gmcp,
    /// 其他未支援的選項
    Unknown(u8),
}

impl TelnetOption {
    /// 從位元組解析 Telnet 選項
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Echo,
            3 => Self::SuppressGoAhead,
            24 => Self::TerminalType,
            31 => Self::Naws,
            39 => Self::NewEnviron,
            42 => Self::Charset,
            69 => Self::Msdp,
            70 => Self::Mssp,
            86 => Self::Mccp2,
            201 => Self::Gmcp,
            other => Self::Unknown(other),
        }
    }

    /// 獲取選項的位元組值
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Echo => 1,
            Self::SuppressGoAhead => 3,
            Self::TerminalType => 24,
            Self::Naws => 31,
            Self::NewEnviron => 39,
            Self::Charset => 42,
            Self::Msdp => 69,
            Self::Mssp => 70,
            Self::Mccp2 => 86,
            Self::Gmcp => 201,
            Self::Unknown(b) => *b,
        }
    }
}

/// 解析器產生的事件，依照在位元組串流中出現的順序排列
#[derive(Debug, Clone, PartialEq)]
pub enum TelnetEvent {
    /// 純文字資料（`IAC IAC` 已還原為單一 0xFF）
    Data(Vec<u8>),
    /// 不帶選項的命令，例如 GA、NOP、EOR
    Command(TelnetCommand),
    /// WILL / WONT / DO / DONT 協商
    Negotiation(TelnetCommand, TelnetOption),
    /// 完整的子協商區塊
    Subnegotiation(TelnetOption, Vec<u8>),
    /// 格式錯誤的命令序列，該區塊已被丟棄
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Data,
    Iac,
    Negotiate(TelnetCommand),
    SbOption,
    SbData(TelnetOption),
    SbIac(TelnetOption),
}

/// 增量式 Telnet 解析器
///
/// 每次 `feed` 只處理手上的位元組，尚未完成的命令或子協商會保留到下一次呼叫。
#[derive(Debug)]
pub struct TelnetParser {
    state: ParserState,
    sb_buf: Vec<u8>,
    sb_overflow: bool,
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Data,
            sb_buf: Vec::new(),
            sb_overflow: false,
        }
    }

    /// 目前是否沒有未完成的命令序列
    pub fn is_idle(&self) -> bool {
        self.state == ParserState::Data
    }

    /// 餵入一段位元組，返回依序排列的事件
    pub fn feed(&mut self, input: &[u8]) -> Vec<TelnetEvent> {
        let mut events = Vec::new();
        let mut data = Vec::with_capacity(input.len());
        for &byte in input {
            self.step(byte, &mut data, &mut events);
        }
        flush_data(&mut data, &mut events);
        events
    }

    fn step(&mut self, byte: u8, data: &mut Vec<u8>, events: &mut Vec<TelnetEvent>) {
        self.state = match self.state {
            ParserState::Data => {
                if byte == IAC {
                    ParserState::Iac
                } else {
                    data.push(byte);
                    ParserState::Data
                }
            }
            ParserState::Iac => match TelnetCommand::from_byte(byte) {
                _ if byte == IAC => {
                    data.push(IAC);
                    ParserState::Data
                }
                Some(cmd) if cmd.is_negotiation() => ParserState::Negotiate(cmd),
                Some(TelnetCommand::Sb) => ParserState::SbOption,
                Some(cmd) => {
                    flush_data(data, events);
                    events.push(TelnetEvent::Command(cmd));
                    ParserState::Data
                }
                None => {
                    flush_data(data, events);
                    events.push(TelnetEvent::Malformed(format!("未知的 IAC 命令: {}", byte)));
                    ParserState::Data
                }
            },
            ParserState::Negotiate(cmd) => {
                flush_data(data, events);
                events.push(TelnetEvent::Negotiation(cmd, TelnetOption::from_byte(byte)));
                ParserState::Data
            }
            ParserState::SbOption => {
                if byte == IAC {
                    flush_data(data, events);
                    events.push(TelnetEvent::Malformed("子協商缺少選項位元組".to_string()));
                    ParserState::Iac
                } else {
                    self.sb_buf.clear();
                    self.sb_overflow = false;
                    ParserState::SbData(TelnetOption::from_byte(byte))
                }
            }
            ParserState::SbData(option) => {
                if byte == IAC {
                    ParserState::SbIac(option)
                } else {
                    self.push_sb(byte);
                    ParserState::SbData(option)
                }
            }
            ParserState::SbIac(option) => {
                if byte == IAC {
                    self.push_sb(IAC);
                    ParserState::SbData(option)
                } else if byte == TelnetCommand::Se as u8 {
                    flush_data(data, events);
                    let payload = std::mem::take(&mut self.sb_buf);
                    if self.sb_overflow {
                        events.push(TelnetEvent::Malformed(format!(
                            "{:?} 子協商超過 {} 位元組",
                            option, SB_MAX_LEN
                        )));
                    } else {
                        events.push(TelnetEvent::Subnegotiation(option, payload));
                    }
                    ParserState::Data
                } else {
                    // 區塊內出現其他命令，丟棄區塊並把這個位元組當成新的 IAC 命令處理
                    flush_data(data, events);
                    events.push(TelnetEvent::Malformed(format!(
                        "{:?} 子協商中出現非預期的命令 {}",
                        option, byte
                    )));
                    self.sb_buf.clear();
                    self.state = ParserState::Iac;
                    return self.step(byte, data, events);
                }
            }
        };
    }

    fn push_sb(&mut self, byte: u8) {
        if self.sb_buf.len() >= SB_MAX_LEN {
            self.sb_overflow = true;
        } else {
            self.sb_buf.push(byte);
        }
    }
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

fn flush_data(data: &mut Vec<u8>, events: &mut Vec<TelnetEvent>) {
    if !data.is_empty() {
        events.push(TelnetEvent::Data(std::mem::take(data)));
    }
}

/// 產生三位元組的協商命令
pub fn negotiation(cmd: TelnetCommand, option: TelnetOption) -> [u8; 3] {
    [IAC, cmd as u8, option.as_byte()]
}

/// 產生子協商區塊，內容中的 0xFF 會自動加倍
pub fn subnegotiation(option: TelnetOption, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&[IAC, TelnetCommand::Sb as u8, option.as_byte()]);
    out.extend_from_slice(&escape_iac(payload));
    out.extend_from_slice(&[IAC, TelnetCommand::Se as u8]);
    out
}

/// 將資料中的 0xFF 轉為 `IAC IAC`
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}
