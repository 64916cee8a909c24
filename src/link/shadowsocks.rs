//! ss:// 链接解码。
//!
//! 两种野外形态都支持：
//!   SIP002:  `ss://<base64(method:password)>@host:port#tag`
//!   遗留版:  `ss://<base64(method:password@host:port)>#tag`

use super::{base64_decode_any, parse_host_port, split_fragment, DecodeError};
use crate::link::ConnectionDescriptor;

/// 接受的 AEAD 加密方式白名单。
///
/// 流式加密（rc4、cfb 系列）早已废弃，不在探测范围内。
const SUPPORTED_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "chacha20-poly1305",
];

/// Shadowsocks 节点描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksDescriptor {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub tag: String,
}

pub fn decode(rest: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let (rest, tag) = split_fragment(rest, "");

    // SIP002 带插件参数的情况，插件部分对可达性探测无意义，丢弃
    let rest = rest.split_once("/?").map(|(r, _)| r).unwrap_or(rest);

    let (method, password, address, port) = if let Some((user_info, host_port)) =
        rest.rsplit_once('@')
    {
        // SIP002：@ 前是 base64(method:password)
        let decoded = base64_decode_any(user_info).ok_or(DecodeError::InvalidBase64)?;
        let user_info =
            String::from_utf8(decoded).map_err(|_| DecodeError::InvalidBase64)?;
        let (method, password) = user_info
            .split_once(':')
            .ok_or(DecodeError::MissingField("password"))?;
        let (address, port) = parse_host_port(host_port)?;
        (method.to_string(), password.to_string(), address, port)
    } else {
        // 整体 base64：解出 method:password@host:port
        let decoded = base64_decode_any(rest).ok_or(DecodeError::InvalidBase64)?;
        let full = String::from_utf8(decoded).map_err(|_| DecodeError::InvalidBase64)?;
        let (user_info, host_port) = full
            .rsplit_once('@')
            .ok_or(DecodeError::MissingField("host"))?;
        let (method, password) = user_info
            .split_once(':')
            .ok_or(DecodeError::MissingField("password"))?;
        let (address, port) = parse_host_port(host_port)?;
        (method.to_string(), password.to_string(), address, port)
    };

    let method = method.to_ascii_lowercase();
    if !SUPPORTED_METHODS.contains(&method.as_str()) {
        return Err(DecodeError::invalid(
            "method",
            format!("unsupported cipher '{}'", method),
        ));
    }
    if password.is_empty() {
        return Err(DecodeError::MissingField("password"));
    }

    Ok(ConnectionDescriptor::Shadowsocks(ShadowsocksDescriptor {
        address,
        port,
        method,
        password,
        tag,
    }))
}
