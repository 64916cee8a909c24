//! trojan:// 链接解码。
//!
//! 格式：`trojan://<password>@<host>:<port>?<query>#<tag>`。
//! Trojan 永远跑在 TLS 上，sni 缺省回落到 host。

use super::{parse_host_port, parse_query, percent_decode, split_fragment, DecodeError};
use crate::link::ConnectionDescriptor;

/// Trojan 节点描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanDescriptor {
    pub address: String,
    pub port: u16,
    pub password: String,
    pub sni: Option<String>,
    pub allow_insecure: bool,
    pub tag: String,
}

impl TrojanDescriptor {
    /// TLS SNI：显式 sni 参数优先，否则用服务器地址
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.address)
    }
}

pub fn decode(rest: &str) -> Result<ConnectionDescriptor, DecodeError> {
    let (rest, tag) = split_fragment(rest, "");

    let (main, query) = match rest.split_once('?') {
        Some((m, q)) => (m, parse_query(q)),
        None => (rest, Default::default()),
    };

    let (password, host_port) = main
        .split_once('@')
        .ok_or(DecodeError::MissingField("password"))?;

    let password = percent_decode(password);
    if password.is_empty() {
        return Err(DecodeError::MissingField("password"));
    }

    let (address, port) = parse_host_port(host_port)?;

    let allow_insecure = matches!(
        query.get("allowInsecure").map(String::as_str),
        Some("1") | Some("true")
    );

    Ok(ConnectionDescriptor::Trojan(TrojanDescriptor {
        address,
        port,
        password,
        sni: query.get("sni").cloned().filter(|s| !s.is_empty()),
        allow_insecure,
        tag,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_link() {
        let desc =
            decode("my-password@us1.example.com:443?sni=cdn.example.com&allowInsecure=1#US%201")
                .unwrap();
        let ConnectionDescriptor::Trojan(t) = desc else {
            panic!("wrong variant");
        };
        assert_eq!(t.address, "us1.example.com");
        assert_eq!(t.port, 443);
        assert_eq!(t.password, "my-password");
        assert_eq!(t.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(t.server_name(), "cdn.example.com");
        assert!(t.allow_insecure);
        assert_eq!(t.tag, "US 1");
    }

    #[test]
    fn sni_defaults_to_host() {
        let ConnectionDescriptor::Trojan(t) = decode("pw@host.example.com:443").unwrap() else {
            panic!("wrong variant");
        };
        assert!(t.sni.is_none());
        assert_eq!(t.server_name(), "host.example.com");
    }

    #[test]
    fn percent_encoded_password() {
        let ConnectionDescriptor::Trojan(t) = decode("p%40ss%3Aword@a.com:443").unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(t.password, "p@ss:word");
    }

    #[test]
    fn reject_empty_password() {
        assert_eq!(
            decode("@a.com:443"),
            Err(DecodeError::MissingField("password"))
        );
    }

    #[test]
    fn reject_missing_at() {
        assert_eq!(
            decode("a.com:443"),
            Err(DecodeError::MissingField("password"))
        );
    }

    #[test]
    fn reject_missing_port() {
        assert_eq!(decode("pw@a.com"), Err(DecodeError::MissingField("port")));
    }
}
