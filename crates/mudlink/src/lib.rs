//! MUD 協定與工作階段核心
//!
//! 提供 MUD 客戶端不含介面的部分：
//! - `telnet`: Telnet 串流解析與選項協商（TTYPE/MTTS、NAWS、GMCP、MSSP、CHARSET）
//! - `encoding`: UTF-8/GBK/Big5 串流解碼，處理跨封包的多位元組字元
//! - `buffer`: ANSI 樣式解析、行組裝與歷史緩衝區
//! - `rule` / `engine` / `trigger` / `alias`: 觸發器與別名
//! - `variables` / `value`: 具型別的工作階段與全域變數
//! - `timer`: 定時器佇列
//! - `session`: 單一連線的工作階段任務
//! - `scheduler`: 多工作階段排程與渲染
//! - `settings` / `snapshot` / `logger`: 設定、存檔與記錄檔
//!
//! # Example
//! ```
//! use mudlink::{EvalMode, RuleEngine, RuleSpec};
//!
//! let mut rules = RuleEngine::new();
//! rules.register(RuleSpec::trigger(r"^(\w+) 走了過來").send("hi %1")).unwrap();
//! let matched = rules.on_line("bob 走了過來", EvalMode::DryRun);
//! assert_eq!(matched[0].group(1), Some("bob"));
//! ```

pub mod alias;
pub mod buffer;
pub mod encoding;
pub mod engine;
pub mod logger;
pub mod rule;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod telnet;
pub mod timer;
pub mod trigger;
pub mod value;
pub mod variables;

pub use alias::{expand, split_commands, ExpandedCommand, Outbound};
pub use buffer::{DecodedLine, LineAssembler, Scrollback};
pub use encoding::{StreamDecoder, TextEncoding};
pub use engine::RuleEngine;
pub use logger::Transcript;
pub use rule::{
    CallbackError, CommandCall, CommandHandler, RuleAction, RuleCallback, RuleError, RuleId, RuleInfo, RuleKind,
    RuleMatch, RuleSpec,
};
pub use scheduler::{Renderer, Scheduler, SchedulerContext, SchedulerError, SchedulerHandle, TickCallback};
pub use session::{
    CloseOutcome, ConnectionState, Connector, SessionContext, SessionEnv, SessionError, SessionEvent, SessionHandle,
    StatusLevel, StatusMessage, TcpConnector, WaitOutcome,
};
pub use settings::{SessionConfig, Settings};
pub use snapshot::{CallbackRegistry, SessionSnapshot};
pub use telnet::{OptionNegotiator, TelnetParser};
pub use trigger::{test_pattern, EvalMode};
pub use value::Value;
pub use variables::{GlobalVariables, VariableStore};
