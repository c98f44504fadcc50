//! MUD 命令列客戶端
//!
//! 讀取 Profile 建立工作階段，標準輸入的每一行送往目前的工作階段。

mod config;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use config::{Profile, PROFILE_SOURCE};
use mudlink::{Scheduler, SchedulerHandle, SessionConfig, SessionHandle, TcpConnector};
use render::StdoutRenderer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日誌，輸出到 stderr 以免和 MUD 文字混在一起
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(Profile::default_path);
    let profile = match Profile::load(&path) {
        Ok(profile) => profile,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            std::process::exit(1);
        }
    };
    info!("載入設定檔 {}", path.display());

    let (active_tx, active_rx) = watch::channel(None);
    let renderer = StdoutRenderer::stdout(active_rx).with_color(std::env::var_os("NO_COLOR").is_none());
    let connector = Arc::new(TcpConnector::new(profile.settings.client.connect_timeout()));
    let scheduler = Scheduler::new(profile.settings.clone(), connector, renderer);
    let handle = scheduler.handle();
    let runner = tokio::spawn(scheduler.run());

    let mut console = Console {
        handle,
        profile,
        active: None,
        active_tx,
    };
    for config in console.profile.sessions.clone() {
        console.open(config).await;
    }
    console.run().await;

    if let Err(e) = runner.await {
        error!("排程器異常結束: {}", e);
    }
}

/// 標準輸入的控制台
struct Console {
    handle: SchedulerHandle,
    profile: Profile,
    active: Option<SessionHandle>,
    active_tx: watch::Sender<Option<String>>,
}

impl Console {
    async fn run(&mut self) {
        let prefix = self.profile.settings.client.command_prefix;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("讀取標準輸入失敗: {}", e);
                    break;
                }
            };
            let handled = match line.strip_prefix(prefix) {
                Some(rest) => self.control(rest).await,
                None => None,
            };
            match handled {
                Some(true) => break,
                Some(false) => {}
                None => self.send(line),
            }
        }
        if let Err(e) = self.handle.shutdown().await {
            warn!("{}", e);
        }
    }

    /// 處理控制台命令，`None` 表示交給工作階段
    async fn control(&mut self, command: &str) -> Option<bool> {
        let mut words = command.split_whitespace();
        match words.next()? {
            "quit" => return Some(true),
            "sessions" => match self.handle.sessions().await {
                Ok(names) => println!("#工作階段: {}", names.join(", ")),
                Err(e) => warn!("{}", e),
            },
            "session" => {
                let name = words.next()?;
                match self.handle.session(name).await {
                    Ok(Some(session)) => self.activate(Some(session)),
                    Ok(None) => println!("#找不到工作階段 {}", name),
                    Err(e) => warn!("{}", e),
                }
            }
            "new" => {
                let (name, host, port) = (words.next()?, words.next()?, words.next()?);
                let Ok(port) = port.parse() else {
                    println!("#連接埠無效: {}", port);
                    return Some(false);
                };
                self.open(SessionConfig::new(name, host, port)).await;
            }
            "close" => {
                let name = match words.next() {
                    Some(name) => name.to_string(),
                    None => self.active.as_ref()?.name().to_string(),
                };
                if let Err(e) = self.handle.close_session(&name).await {
                    println!("#{}", e);
                }
                if self.active.as_ref().map(|s| s.name()) == Some(name.as_str()) {
                    self.activate(None);
                }
            }
            _ => return None,
        }
        Some(false)
    }

    async fn open(&mut self, config: SessionConfig) {
        let session = match self.handle.create_session(config).await {
            Ok(session) => session,
            Err(e) => {
                println!("#{}", e);
                return;
            }
        };
        if let Err(e) = session.reload_source(PROFILE_SOURCE, self.profile.rule_specs()).await {
            warn!("{}: 載入規則失敗: {}", session.name(), e);
        }
        if self.active.is_none() {
            self.activate(Some(session));
        }
    }

    fn activate(&mut self, session: Option<SessionHandle>) {
        self.active_tx.send_replace(session.as_ref().map(|s| s.name().to_string()));
        self.active = session;
    }

    fn send(&mut self, line: String) {
        let Some(session) = &self.active else {
            println!("#沒有作用中的工作階段");
            return;
        };
        if let Err(e) = session.send(line) {
            println!("#{}", e);
            if session.is_closed() {
                self.activate(None);
            }
        }
    }
}
