//! vmess:// 链接解码。
//!
//! 格式：`vmess://<base64(JSON)>`，JSON 字段来自 V2RayN 订阅约定。
//! `port` 和 `aid` 在野外既有字符串也有数字形式，两种都接受。

use serde::Deserialize;
use uuid::Uuid;

use super::{base64_decode_any, DecodeError};
use crate::link::ConnectionDescriptor;

/// VMess 节点描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmessDescriptor {
    pub address: String,
    pub port: u16,
    /// 用户 UUID（规范化为小写连字符形式）
    pub id: String,
    pub alter_id: u32,
    /// 加密方式：auto / aes-128-gcm / chacha20-poly1305 / none
    pub security: String,
    /// 传输层：tcp / ws / grpc ...
    pub network: String,
    pub tls: bool,
    pub sni: Option<String>,
    pub ws_host: Option<String>,
    pub ws_path: Option<String>,
    pub tag: String,
}

/// 订阅 JSON 的原始形态，字段宽松接收后再校验
#[derive(Deserialize)]
struct RawVmess {
    add: Option<String>,
    port: Option<StringOrNumber>,
    id: Option<String>,
    aid: Option<StringOrNumber>,
    #[serde(default)]
    scy: Option<String>,
    #[serde(default)]
    net: Option<String>,
    #[serde(default)]
    tls: Option<String>,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    ps: Option<String>,
}

/// 同一字段在不同客户端导出里是 "443" 或 443
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(i64),
}

impl StringOrNumber {
    fn as_u32(&self, field: &'static str) -> Result<u32, DecodeError> {
        match self {
            StringOrNumber::String(s) => s
                .trim()
                .parse()
                .map_err(|_| DecodeError::invalid(field, format!("not a number: '{}'", s))),
            StringOrNumber::Number(n) => u32::try_from(*n)
                .map_err(|_| DecodeError::invalid(field, format!("out of range: {}", n))),
        }
    }
}

pub fn decode(payload: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let bytes = base64_decode_any(payload).ok_or(DecodeError::InvalidBase64)?;
    let json = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidBase64)?;

    let raw: RawVmess =
        serde_json::from_str(&json).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let address = raw
        .add
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingField("add"))?;

    let port = raw
        .port
        .ok_or(DecodeError::MissingField("port"))?
        .as_u32("port")?;
    let port = u16::try_from(port)
        .map_err(|_| DecodeError::invalid("port", format!("out of range: {}", port)))?;
    if port == 0 {
        return Err(DecodeError::invalid("port", "port 0 is not addressable"));
    }

    let id = raw.id.ok_or(DecodeError::MissingField("id"))?;
    let uuid = Uuid::parse_str(id.trim())
        .map_err(|e| DecodeError::invalid("id", format!("not a UUID: {}", e)))?;

    let alter_id = match raw.aid {
        Some(v) => v.as_u32("aid")?,
        None => 0,
    };

    let security = match raw.scy.as_deref() {
        None | Some("") => "auto".to_string(),
        Some(s @ ("auto" | "aes-128-gcm" | "chacha20-poly1305" | "none" | "zero")) => {
            s.to_string()
        }
        Some(other) => {
            return Err(DecodeError::invalid(
                "scy",
                format!("unknown security '{}'", other),
            ))
        }
    };

    let network = match raw.net.as_deref() {
        None | Some("") => "tcp".to_string(),
        Some(s) => s.to_string(),
    };

    let tls = matches!(raw.tls.as_deref(), Some("tls") | Some("1") | Some("true"));

    Ok(ConnectionDescriptor::Vmess(VmessDescriptor {
        address,
        port,
        id: uuid.hyphenated().to_string(),
        alter_id,
        security,
        network,
        tls,
        sni: raw.sni.filter(|s| !s.is_empty()),
        ws_host: raw.host.filter(|s| !s.is_empty()),
        ws_path: raw.path.filter(|s| !s.is_empty()),
        tag: raw.ps.unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn encode_link(json: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    #[test]
    fn decode_full_link() {
        let json = r#"{
            "v": "2",
            "ps": "HK node",
            "add": "hk1.example.com",
            "port": "443",
            "id": "b831381d-6324-4d53-ad4f-8cda48b30811",
            "aid": "0",
            "scy": "auto",
            "net": "ws",
            "host": "hk1.example.com",
            "path": "/ray",
            "tls": "tls",
            "sni": "hk1.example.com"
        }"#;
        let desc = decode(&encode_link(json)).unwrap();
        let ConnectionDescriptor::Vmess(v) = desc else {
            panic!("wrong variant");
        };
        assert_eq!(v.address, "hk1.example.com");
        assert_eq!(v.port, 443);
        assert_eq!(v.id, "b831381d-6324-4d53-ad4f-8cda48b30811");
        assert_eq!(v.alter_id, 0);
        assert_eq!(v.network, "ws");
        assert!(v.tls);
        assert_eq!(v.ws_path.as_deref(), Some("/ray"));
        assert_eq!(v.tag, "HK node");
    }

    #[test]
    fn decode_numeric_port_and_aid() {
        let json = r#"{"add":"1.2.3.4","port":8443,"id":"b831381d-6324-4d53-ad4f-8cda48b30811","aid":2}"#;
        let desc = decode(&encode_link(json)).unwrap();
        let ConnectionDescriptor::Vmess(v) = desc else {
            panic!("wrong variant");
        };
        assert_eq!(v.port, 8443);
        assert_eq!(v.alter_id, 2);
        // defaults kick in
        assert_eq!(v.security, "auto");
        assert_eq!(v.network, "tcp");
        assert!(!v.tls);
    }

    #[test]
    fn uuid_is_normalized() {
        let json = r#"{"add":"a.com","port":1,"id":"B831381D63244D53AD4F8CDA48B30811"}"#;
        let desc = decode(&encode_link(json)).unwrap();
        assert_eq!(desc.credential(), "b831381d-6324-4d53-ad4f-8cda48b30811");
    }

    #[test]
    fn reject_bad_base64() {
        assert_eq!(decode("%%%not-base64%%%"), Err(DecodeError::InvalidBase64));
    }

    #[test]
    fn reject_bad_json() {
        let err = decode(&encode_link("{not json")).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn reject_missing_id() {
        let json = r#"{"add":"a.com","port":"443"}"#;
        assert_eq!(
            decode(&encode_link(json)),
            Err(DecodeError::MissingField("id"))
        );
    }

    #[test]
    fn reject_malformed_uuid() {
        let json = r#"{"add":"a.com","port":"443","id":"not-a-uuid"}"#;
        assert!(matches!(
            decode(&encode_link(json)),
            Err(DecodeError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn reject_port_out_of_range() {
        let json = r#"{"add":"a.com","port":"70000","id":"b831381d-6324-4d53-ad4f-8cda48b30811"}"#;
        assert!(matches!(
            decode(&encode_link(json)),
            Err(DecodeError::InvalidField { field: "port", .. })
        ));
    }

    #[test]
    fn reject_unknown_security() {
        let json = r#"{"add":"a.com","port":"443","id":"b831381d-6324-4d53-ad4f-8cda48b30811","scy":"rc4-md5"}"#;
        assert!(matches!(
            decode(&encode_link(json)),
            Err(DecodeError::InvalidField { field: "scy", .. })
        ));
    }
}
