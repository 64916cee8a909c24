//! TCP dialer for probe connections.
//!
//! Centralizes connect timeout, source binding and socket options so every
//! protocol probe opens its transport the same way.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tracing::debug;

use super::error::CheckError;

/// Dialer configuration.
#[derive(Debug, Clone, Default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    pub bind_address: Option<String>,

    /// Connect timeout in milliseconds. Default: 5000.
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5000))
    }
}

/// Probe dialer that applies socket options and connects.
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// Create a dialer with default settings.
    pub fn default_dialer() -> Self {
        Self {
            config: DialerConfig::default(),
        }
    }

    /// Connect to the given address, applying all configured socket options.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.connect_inner(addr))
            .await
            .map_err(|_| {
                CheckError::ConnectionTimeout(format!("connect to {} after {:?}", addr, timeout))
            })??;

        self.apply_post_connect(&stream)?;

        debug!(addr = %addr, "dialer connected");

        Ok(stream)
    }

    /// Connect to a host:port, resolving via system DNS when needed.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = self.resolve_host(host, port).await?;
        self.connect(addr).await
    }

    async fn resolve_host(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let addr_str = format!("{}:{}", host, port);
        let lookup = addr_str.clone();
        let addrs = tokio::task::spawn_blocking(move || {
            use std::net::ToSocketAddrs;
            lookup.to_socket_addrs()
        })
        .await?
        .map_err(|e| CheckError::DnsResolutionFailed(format!("{}: {}", addr_str, e)))?;
        addrs
            .into_iter()
            .next()
            .ok_or_else(|| CheckError::DnsResolutionFailed(addr_str).into())
    }

    async fn connect_inner(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };

        if let Some(ref bind_addr) = self.config.bind_address {
            let ip: IpAddr = bind_addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", bind_addr, e))?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = socket.connect(addr).await?;
        Ok(stream)
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<()> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // TCP_NODELAY — handshake frames are tiny, don't batch them
        stream.set_nodelay(true)?;

        Ok(())
    }
}
