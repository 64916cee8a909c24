use tokio::io::{AsyncRead, AsyncWrite};

/// 探测流类型别名：明文 TCP 或 TLS 包装后的连接
pub type ProbeStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}
