//! vless:// 链接解码。
//!
//! 格式：`vless://<uuid>@<host>:<port>?<query>#<tag>`。
//! encryption 参数只接受 "none"（协议本身不带加密，安全性来自外层 TLS）。

use uuid::Uuid;

use super::{parse_host_port, parse_query, percent_decode, split_fragment, DecodeError};
use crate::link::ConnectionDescriptor;

/// VLESS 节点描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessDescriptor {
    pub address: String,
    pub port: u16,
    pub id: String,
    /// security 查询参数：none / tls / reality
    pub security: String,
    pub sni: Option<String>,
    pub flow: Option<String>,
    /// 传输层：tcp / ws / grpc ...
    pub network: String,
    pub allow_insecure: bool,
    pub tag: String,
}

pub fn decode(rest: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let (rest, tag) = split_fragment(rest, "");

    let (main, query) = match rest.split_once('?') {
        Some((m, q)) => (m, parse_query(q)),
        None => (rest, Default::default()),
    };

    let (user, host_port) = main
        .split_once('@')
        .ok_or(DecodeError::MissingField("id"))?;

    let user = percent_decode(user);
    let uuid = Uuid::parse_str(user.trim())
        .map_err(|e| DecodeError::invalid("id", format!("not a UUID: {}", e)))?;

    let (address, port) = parse_host_port(host_port)?;

    if let Some(enc) = query.get("encryption") {
        if enc != "none" {
            return Err(DecodeError::invalid(
                "encryption",
                format!("only 'none' is defined, got '{}'", enc),
            ));
        }
    }

    let security = query
        .get("security")
        .cloned()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "none".to_string());

    let network = query
        .get("type")
        .cloned()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "tcp".to_string());

    let allow_insecure = matches!(
        query.get("allowInsecure").map(String::as_str),
        Some("1") | Some("true")
    );

    Ok(ConnectionDescriptor::Vless(VlessDescriptor {
        address,
        port,
        id: uuid.hyphenated().to_string(),
        security,
        sni: query.get("sni").cloned().filter(|s| !s.is_empty()),
        flow: query.get("flow").cloned().filter(|s| !s.is_empty()),
        network,
        allow_insecure,
        tag,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn decode_full_link() {
        let link = format!(
            "{}@jp1.example.com:443?encryption=none&security=tls&sni=jp1.example.com&flow=xtls-rprx-vision&type=tcp#JP%20Node",
            UUID
        );
        let desc = decode(&link).unwrap();
        let ConnectionDescriptor::Vless(v) = desc else {
            panic!("wrong variant");
        };
        assert_eq!(v.address, "jp1.example.com");
        assert_eq!(v.port, 443);
        assert_eq!(v.id, UUID);
        assert_eq!(v.security, "tls");
        assert_eq!(v.sni.as_deref(), Some("jp1.example.com"));
        assert_eq!(v.flow.as_deref(), Some("xtls-rprx-vision"));
        assert_eq!(v.tag, "JP Node");
    }

    #[test]
    fn decode_minimal_link() {
        let link = format!("{}@1.2.3.4:8443", UUID);
        let desc = decode(&link).unwrap();
        let ConnectionDescriptor::Vless(v) = desc else {
            panic!("wrong variant");
        };
        assert_eq!(v.security, "none");
        assert_eq!(v.network, "tcp");
        assert!(!v.allow_insecure);
        assert_eq!(v.tag, "");
    }

    #[test]
    fn decode_ipv6_host() {
        let link = format!("{}@[2001:db8::1]:443?security=tls", UUID);
        let desc = decode(&link).unwrap();
        assert_eq!(desc.host(), "2001:db8::1");
        assert_eq!(desc.port(), 443);
    }

    #[test]
    fn reject_nonstandard_encryption() {
        let link = format!("{}@a.com:443?encryption=aes-128-gcm", UUID);
        assert!(matches!(
            decode(&link),
            Err(DecodeError::InvalidField {
                field: "encryption",
                ..
            })
        ));
    }

    #[test]
    fn reject_missing_uuid() {
        assert_eq!(decode("a.com:443"), Err(DecodeError::MissingField("id")));
    }

    #[test]
    fn reject_bad_uuid() {
        assert!(matches!(
            decode("zzz@a.com:443"),
            Err(DecodeError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn allow_insecure_flag() {
        let link = format!("{}@a.com:443?security=tls&allowInsecure=1", UUID);
        let ConnectionDescriptor::Vless(v) = decode(&link).unwrap() else {
            panic!("wrong variant");
        };
        assert!(v.allow_insecure);
    }
}
