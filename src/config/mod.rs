//! YAML 配置加载。
//!
//! 加载时做 `${VAR}` / `$VAR` 环境变量展开，再反序列化并校验。
//! 加密密钥以 hex 形式出现在配置里，解码为 32 字节后交给密封盒。

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::update::KEY_LEN;

/// 顶层配置
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    /// 未配置远端时只做检查，不发布
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub store: StoreConfig,
}

/// 检查参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_concurrent: usize,
    pub check_timeout_ms: u64,
    /// 握手里声明的透传目标 host
    pub check_host: String,
    pub bind_address: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            check_timeout_ms: 10_000,
            check_host: "cp.cloudflare.com".to_string(),
            bind_address: None,
        }
    }
}

/// SSH 发布端配置
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    pub ssh_key_path: String,
    #[serde(default)]
    pub ssh_key_passphrase: Option<String>,
    pub repo_path: String,
    #[serde(default = "default_file_path")]
    pub file_path: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// 32 字节密钥的 hex 表示（64 个 hex 字符）
    pub encryption_key: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "git".to_string()
}

fn default_file_path() -> String {
    "links.txt".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl RemoteConfig {
    /// 解析 hex 加密密钥
    pub fn encryption_key_bytes(&self) -> Result<[u8; KEY_LEN]> {
        let hex = self.encryption_key.trim();
        if !hex.is_ascii() {
            bail!("encryption_key must be ASCII hex");
        }
        if hex.len() != KEY_LEN * 2 {
            bail!(
                "encryption_key must be {} hex characters, got {}",
                KEY_LEN * 2,
                hex.len()
            );
        }
        let mut key = [0u8; KEY_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .with_context(|| format!("encryption_key has non-hex characters at offset {}", i * 2))?;
        }
        Ok(key)
    }
}

/// 指纹存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key_prefix: String,
    pub dedup_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "subcheck".to_string(),
            // 七天
            dedup_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.app.max_concurrent == 0 {
            bail!("app.max_concurrent must be at least 1");
        }
        if self.app.check_timeout_ms == 0 {
            bail!("app.check_timeout_ms must be positive");
        }
        if self.app.check_host.is_empty() {
            bail!("app.check_host must not be empty");
        }
        if let Some(ref remote) = self.remote {
            if remote.host.is_empty() {
                bail!("remote.host must not be empty");
            }
            remote.encryption_key_bytes()?;
        }
        if self.store.key_prefix.is_empty() {
            bail!("store.key_prefix must not be empty");
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config file {}", path))?;
    let expanded = expand_env_vars(&raw);
    let config: Config = serde_yml::from_str(&expanded)
        .with_context(|| format!("failed to parse config file {}", path))?;
    config.validate()?;
    Ok(config)
}

/// `${VAR}`、`${VAR:-default}` 和 `$VAR` 展开，未定义的变量替换为空
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            if chars.peek() == Some(&'{') {
                chars.next();
                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(val) if !val.is_empty() => result.push_str(&val),
                        _ => result.push_str(default),
                    }
                } else if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                }
            } else {
                let mut var_name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        var_name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    result.push('$');
                } else if let Ok(val) = std::env::var(&var_name) {
                    result.push_str(&val);
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
