//! Subscription link decoding.
//!
//! Turns one raw `vmess://` / `vless://` / `ss://` / `trojan://` string into
//! a typed [`ConnectionDescriptor`], or a [`DecodeError`] naming the broken
//! field. Pure functions only: no network, no disk, no panics.

pub mod shadowsocks;
pub mod trojan;
pub mod vless;
pub mod vmess;

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use shadowsocks::ShadowsocksDescriptor;
pub use trojan::TrojanDescriptor;
pub use vless::VlessDescriptor;
pub use vmess::VmessDescriptor;

/// 链接解码失败的原因，定位到具体字段
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported link scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// 解码后的连接描述符，四种协议的封闭和类型。
///
/// 新增协议是编译期检查的扩展：Decoder 和 Prober 里的 match 都是穷尽的。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Vmess(VmessDescriptor),
    Vless(VlessDescriptor),
    Shadowsocks(ShadowsocksDescriptor),
    Trojan(TrojanDescriptor),
}

impl ConnectionDescriptor {
    pub fn protocol(&self) -> &'static str {
        match self {
            ConnectionDescriptor::Vmess(_) => "vmess",
            ConnectionDescriptor::Vless(_) => "vless",
            ConnectionDescriptor::Shadowsocks(_) => "ss",
            ConnectionDescriptor::Trojan(_) => "trojan",
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ConnectionDescriptor::Vmess(d) => &d.address,
            ConnectionDescriptor::Vless(d) => &d.address,
            ConnectionDescriptor::Shadowsocks(d) => &d.address,
            ConnectionDescriptor::Trojan(d) => &d.address,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ConnectionDescriptor::Vmess(d) => d.port,
            ConnectionDescriptor::Vless(d) => d.port,
            ConnectionDescriptor::Shadowsocks(d) => d.port,
            ConnectionDescriptor::Trojan(d) => d.port,
        }
    }

    /// 显示名（URI fragment 或 vmess 的 ps 字段）
    pub fn tag(&self) -> &str {
        match self {
            ConnectionDescriptor::Vmess(d) => &d.tag,
            ConnectionDescriptor::Vless(d) => &d.tag,
            ConnectionDescriptor::Shadowsocks(d) => &d.tag,
            ConnectionDescriptor::Trojan(d) => &d.tag,
        }
    }

    /// 身份凭据：UUID 或密码
    pub fn credential(&self) -> &str {
        match self {
            ConnectionDescriptor::Vmess(d) => &d.id,
            ConnectionDescriptor::Vless(d) => &d.id,
            ConnectionDescriptor::Shadowsocks(d) => &d.password,
            ConnectionDescriptor::Trojan(d) => &d.password,
        }
    }

    /// 跨轮次去重用的稳定指纹。
    ///
    /// 只覆盖协议、地址、端口和凭据；tag 等易变字段不参与，
    /// 改个备注名的重复节点也能正确去重。
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}",
            self.protocol(),
            self.host(),
            self.port(),
            self.credential()
        );
        let digest = Sha256::digest(canonical.as_bytes());
        hex_encode(&digest)
    }
}

/// 解码一条原始链接，按 scheme 分发。
///
/// 输入字符串不会被修改；同样的输入永远得到同样的输出。
pub fn decode(raw: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("vmess://") {
        return vmess::decode(rest);
    }
    if let Some(rest) = raw.strip_prefix("vless://") {
        return vless::decode(rest);
    }
    if let Some(rest) = raw.strip_prefix("ss://") {
        return shadowsocks::decode(rest);
    }
    if let Some(rest) = raw.strip_prefix("trojan://") {
        return trojan::decode(rest);
    }

    let scheme = raw.split("://").next().unwrap_or(raw);
    Err(DecodeError::UnsupportedScheme(truncate_for_error(scheme)))
}

fn truncate_for_error(s: &str) -> String {
    const MAX: usize = 32;
    if s.chars().count() > MAX {
        let head: String = s.chars().take(MAX).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Base64 解码，依次尝试 standard / URL-safe / no-pad 字母表
pub(crate) fn base64_decode_any(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let s = s.replace(['\n', '\r'], "");
    base64::engine::general_purpose::STANDARD
        .decode(&s)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(&s))
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&s))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&s))
        .ok()
}

pub(crate) fn percent_decode(s: &str) -> String {
    // 先解到字节再整体转 UTF-8，多字节序列（%E4%B8%AD 之类）才能还原
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                bytes.push(byte);
            } else {
                bytes.push(b'%');
                bytes.extend_from_slice(hex.as_bytes());
            }
        } else if c == '+' {
            bytes.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// 解析 "host:port"（兼容 "[v6]:port"），端口必须在 [1,65535]
pub(crate) fn parse_host_port(s: &str) -> Result<(String, u16), DecodeError> {
    let (host, port_str) = if s.starts_with('[') {
        let end = s
            .find(']')
            .ok_or_else(|| DecodeError::invalid("host", "unterminated IPv6 literal"))?;
        let host = &s[1..end];
        let rest = &s[end + 1..];
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| DecodeError::MissingField("port"))?;
        (host.to_string(), port)
    } else {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(DecodeError::MissingField("port"))?;
        (host.to_string(), port)
    };

    if host.is_empty() {
        return Err(DecodeError::MissingField("host"));
    }

    let port: u16 = port_str
        .parse()
        .map_err(|_| DecodeError::invalid("port", format!("not a number: '{}'", port_str)))?;
    if port == 0 {
        return Err(DecodeError::invalid("port", "port 0 is not addressable"));
    }

    Ok((host, port))
}

/// 解析查询串为 key/value（value 做 percent 解码）
pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            params.insert(k.to_string(), percent_decode(v));
        }
    }
    params
}

/// 拆出 URI fragment 作为显示名，缺省用 fallback
pub(crate) fn split_fragment<'a>(rest: &'a str, fallback: &str) -> (&'a str, String) {
    match rest.rfind('#') {
        Some(idx) => (&rest[..idx], percent_decode(&rest[idx + 1..])),
        None => (rest, fallback.to_string()),
    }
}
