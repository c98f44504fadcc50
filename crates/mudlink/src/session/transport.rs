//! 傳輸層
//!
//! 工作階段只需要一條可讀寫的位元組串流。`Connector` 負責建立串流，
//! 正式環境用 `TcpConnector`，測試可以換成記憶體中的管道。

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// 傳輸錯誤
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("連線失敗: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("連線逾時")]
    Timeout,

    #[error("未連線")]
    NotConnected,

    #[error("DNS 解析失敗: {0}")]
    DnsResolutionFailed(String),
}

/// 可讀寫的位元組串流
pub trait MudStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MudStream for T {}

pub type BoxedStream = Box<dyn MudStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>>;

/// 建立連線
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> ConnectFuture<'a>;
}

/// TCP 連線
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        info!("正在連線到 {}:{}", host, port);

        let addr = format!("{}:{}", host, port);
        let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| TransportError::DnsResolutionFailed(e.to_string()))?
            .collect();

        let first = socket_addrs
            .first()
            .ok_or_else(|| TransportError::DnsResolutionFailed(format!("無法解析主機: {}", host)))?;
        debug!("已解析到位址: {:?}", socket_addrs);

        let stream = timeout(self.connect_timeout, TcpStream::connect(first))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        info!("已連線到 {}:{}", host, port);
        Ok(Box::new(stream))
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> ConnectFuture<'a> {
        Box::pin(self.open(host, port))
    }
}
