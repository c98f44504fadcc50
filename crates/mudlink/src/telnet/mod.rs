//! Telnet 協定模組
//!
//! 串流解析與選項協商。連線本身由 `session::transport` 管理。

mod negotiator;
mod protocol;

pub use negotiator::{
    Negotiated, NegotiationEvent, NegotiatorConfig, OptionNegotiator, OptionState, Side,
};
pub use protocol::{
    escape_iac, negotiation, subnegotiation, TelnetCommand, TelnetEvent, TelnetOption,
    TelnetParser, IAC,
};
