//! 发布通道。
//!
//! 验证过的链接通过 SSH 推到远端仓库。认证失败不可重试，
//! 连接和远端执行失败可以重试，区分交给 [`ChannelError::is_retryable`]。

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel connect failed: {0}")]
    Connect(String),

    #[error("channel authentication failed: {0}")]
    Auth(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("channel IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// 认证失败重试只会再失败一次，其余故障值得退避重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Auth(_))
    }
}

/// 远端发布通道
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// 连接并认证一次，不留副作用。失败视为环境不可用。
    async fn health_check(&self) -> Result<(), ChannelError>;

    /// 把内容追加到远端链接文件并提交推送
    async fn publish(&self, content: &str, message: &str) -> Result<(), ChannelError>;
}

/// SSH 通道配置
#[derive(Debug, Clone)]
pub struct SshChannelConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// OpenSSH 私钥文件路径
    pub key_path: String,
    pub key_passphrase: Option<String>,
    /// 远端仓库工作树路径
    pub repo_path: String,
    /// 仓库内的链接文件
    pub file_path: String,
    pub branch: String,
}

/// 基于 russh 的发布通道实现
pub struct SshChannel {
    config: SshChannelConfig,
}

impl SshChannel {
    pub fn new(config: SshChannelConfig) -> Self {
        Self { config }
    }
}

#[cfg(feature = "ssh")]
mod russh_impl {
    use super::*;

    struct AcceptingHandler;

    #[async_trait]
    impl russh::client::Handler for AcceptingHandler {
        type Error = anyhow::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &ssh_key::PublicKey,
        ) -> std::result::Result<bool, Self::Error> {
            // 等价 StrictHostKeyChecking=no
            // TODO: known_hosts 校验
            Ok(true)
        }
    }

    impl SshChannel {
        async fn connect_authed(
            &self,
        ) -> Result<russh::client::Handle<AcceptingHandler>, ChannelError> {
            let ssh_config = std::sync::Arc::new(russh::client::Config::default());

            let addr = format!("{}:{}", self.config.host, self.config.port);
            let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host(&addr)
                .await
                .map_err(|e| ChannelError::Connect(format!("resolve {}: {}", addr, e)))?
                .collect();
            let addr = addrs
                .first()
                .copied()
                .ok_or_else(|| ChannelError::Connect(format!("no address for {}", addr)))?;

            debug!(host = %self.config.host, port = self.config.port, "SSH connecting");
            let mut handle = russh::client::connect(ssh_config, addr, AcceptingHandler)
                .await
                .map_err(|e| ChannelError::Connect(e.to_string()))?;

            let key = russh_keys::load_secret_key(
                &self.config.key_path,
                self.config.key_passphrase.as_deref(),
            )
            .map_err(|e| {
                ChannelError::Auth(format!("load key {}: {}", self.config.key_path, e))
            })?;

            let auth_ok = handle
                .authenticate_publickey(&self.config.user, std::sync::Arc::new(key))
                .await
                .map_err(|e| ChannelError::Auth(e.to_string()))?;
            if !auth_ok {
                return Err(ChannelError::Auth(format!(
                    "public key rejected for user '{}'",
                    self.config.user
                )));
            }

            debug!(user = %self.config.user, "SSH authenticated");
            Ok(handle)
        }

        async fn exec_with_stdin(
            &self,
            handle: &mut russh::client::Handle<AcceptingHandler>,
            command: &str,
            stdin: &[u8],
        ) -> Result<(), ChannelError> {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ChannelError::Remote(e.to_string()))?;

            channel
                .exec(true, command)
                .await
                .map_err(|e| ChannelError::Remote(e.to_string()))?;
            channel
                .data(stdin)
                .await
                .map_err(|e| ChannelError::Remote(e.to_string()))?;
            channel
                .eof()
                .await
                .map_err(|e| ChannelError::Remote(e.to_string()))?;

            let mut exit_status = None;
            while let Some(msg) = channel.wait().await {
                if let russh::ChannelMsg::ExitStatus { exit_status: code } = msg {
                    exit_status = Some(code);
                }
            }

            match exit_status {
                Some(0) => Ok(()),
                Some(code) => Err(ChannelError::Remote(format!(
                    "command exited with status {}",
                    code
                ))),
                None => Err(ChannelError::Remote(
                    "channel closed without exit status".to_string(),
                )),
            }
        }
    }

    #[async_trait]
    impl RemoteChannel for SshChannel {
        async fn health_check(&self) -> Result<(), ChannelError> {
            let handle = self.connect_authed().await?;
            drop(handle);
            Ok(())
        }

        async fn publish(&self, content: &str, message: &str) -> Result<(), ChannelError> {
            let mut handle = self.connect_authed().await?;

            let command = format!(
                "cd {repo} && cat >> {file} && git add {file} && git commit -q -m {msg} && git push -q origin {branch}",
                repo = shell_quote(&self.config.repo_path),
                file = shell_quote(&self.config.file_path),
                msg = shell_quote(message),
                branch = shell_quote(&self.config.branch),
            );

            self.exec_with_stdin(&mut handle, &command, content.as_bytes())
                .await?;
            debug!(
                file = %self.config.file_path,
                branch = %self.config.branch,
                "published to remote"
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "ssh"))]
#[async_trait]
impl RemoteChannel for SshChannel {
    async fn health_check(&self) -> Result<(), ChannelError> {
        Err(ChannelError::Connect(
            "SSH support requires the 'ssh' feature".to_string(),
        ))
    }

    async fn publish(&self, _content: &str, _message: &str) -> Result<(), ChannelError> {
        Err(ChannelError::Connect(
            "SSH support requires the 'ssh' feature".to_string(),
        ))
    }
}

/// 单引号包裹，内部引号按 POSIX 约定转义
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
