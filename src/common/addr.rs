use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

/// 探测目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// 从 host 字符串和端口构造：IP 字面量走 Ip 分支，其余按域名处理
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<std::net::IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为 VLESS 地址格式
    /// [AddrType: 1B] [Address: 变长]
    /// AddrType: 0x01=IPv4, 0x02=Domain, 0x03=IPv6
    pub fn encode_vless(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x03);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(0x02);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    ///
    /// Trojan 请求头和 Shadowsocks 首帧都使用这一格式。
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn from_host_port_ip_literal() {
        let addr = Address::from_host_port("10.0.0.1", 443);
        assert_eq!(
            addr,
            Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443))
        );
    }

    #[test]
    fn from_host_port_ipv6_literal() {
        let addr = Address::from_host_port("::1", 53);
        assert_eq!(addr, Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53)));
    }

    #[test]
    fn from_host_port_domain() {
        let addr = Address::from_host_port("example.com", 8443);
        assert_eq!(addr, Address::Domain("example.com".to_string(), 8443));
    }

    #[test]
    fn port_and_host() {
        let ip_addr = Address::Ip("10.0.0.1:3000".parse().unwrap());
        assert_eq!(ip_addr.port(), 3000);
        assert_eq!(ip_addr.host(), "10.0.0.1");

        let domain_addr = Address::Domain("foo.bar".to_string(), 8443);
        assert_eq!(domain_addr.port(), 8443);
        assert_eq!(domain_addr.host(), "foo.bar");
    }

    #[test]
    fn display_format() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert_eq!(format!("{}", addr), "example.com:443");

        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        assert_eq!(format!("{}", addr), "1.2.3.4:80");
    }

    #[test]
    fn encode_vless_ipv4() {
        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_vless(&mut buf);
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4]);
    }

    #[test]
    fn encode_vless_domain() {
        let addr = Address::Domain("test.com".to_string(), 443);
        let mut buf = BytesMut::new();
        addr.encode_vless(&mut buf);
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 8);
        assert_eq!(&buf[2..], b"test.com");
    }

    #[test]
    fn encode_vless_ipv6() {
        let addr = Address::Ip("[::1]:443".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_vless(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf.len(), 1 + 16);
    }

    #[test]
    fn encode_socks5_ipv4() {
        let addr = Address::Ip("1.2.3.4:443".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x01, 0xBB]);
    }

    #[test]
    fn encode_socks5_domain() {
        let addr = Address::Domain("test.com".to_string(), 8080);
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1], 8);
        assert_eq!(&buf[2..10], b"test.com");
        assert_eq!(u16::from_be_bytes([buf[10], buf[11]]), 8080);
    }

    #[test]
    fn encode_socks5_ipv6() {
        let addr = Address::Ip("[::1]:80".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x04);
        assert_eq!(buf.len(), 1 + 16 + 2);
    }
}
