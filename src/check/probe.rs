//! 协议感知探测。
//!
//! 每种协议走到能证明"对端确实在跑这个协议、且凭据被接受"的最浅深度：
//!   vmess  - AEAD 请求头 + 解密验证响应头
//!   vless  - 请求头 + 校验响应版本字节
//!   ss     - salt + 首帧，解开服务端回的长度块
//!   trojan - TLS + 认证头 + 透传 HTTP 请求，读到回包即通过
//!
//! ws/grpc 等非 TCP 传输层的节点只做传输层可达性验证。

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::{ss_wire, vmess_wire};
use crate::common::tls::tls_connect;
use crate::common::{Address, CheckError, Dialer, ProbeStream};
use crate::link::{
    ConnectionDescriptor, ShadowsocksDescriptor, TrojanDescriptor, VlessDescriptor,
    VmessDescriptor,
};

/// 单个节点的握手探测。
///
/// 成功返回 Ok(())；错误的分类（拒绝 / 超时 / 内部故障）交给
/// [`CheckError::classify`]。实现必须自己管好连接的生命周期。
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, descriptor: &ConnectionDescriptor, target: &Address) -> Result<()>;
}

/// 真实网络上的协议探测器
pub struct ProtocolProber {
    dialer: Dialer,
}

impl ProtocolProber {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }

    async fn probe_vmess(&self, d: &VmessDescriptor, target: &Address) -> Result<()> {
        let stream = self.dialer.connect_host(&d.address, d.port).await?;

        let mut stream: ProbeStream = if d.tls {
            let sni = d.sni.as_deref().unwrap_or(&d.address);
            Box::new(tls_connect(stream, sni, false).await?)
        } else {
            Box::new(stream)
        };

        if d.network != "tcp" {
            // ws/grpc 需要各自的帧封装，这里只验证到传输层
            return Ok(());
        }

        let uuid = Uuid::parse_str(&d.id)
            .map_err(|e| anyhow::anyhow!("descriptor uuid invalid: {}", e))?;
        let security = vmess_wire::SecurityType::from_link(&d.security);
        let sealed = vmess_wire::seal_request(uuid.as_bytes(), security, target)?;

        stream.write_all(&sealed.bytes).await?;
        stream.flush().await?;

        vmess_wire::read_response_header(&mut stream, &sealed).await
    }

    async fn probe_vless(&self, d: &VlessDescriptor, target: &Address) -> Result<()> {
        let stream = self.dialer.connect_host(&d.address, d.port).await?;

        let mut stream: ProbeStream = if d.security == "tls" {
            let sni = d.sni.as_deref().unwrap_or(&d.address);
            Box::new(tls_connect(stream, sni, d.allow_insecure).await?)
        } else {
            Box::new(stream)
        };

        if d.network != "tcp" {
            return Ok(());
        }

        let uuid = Uuid::parse_str(&d.id)
            .map_err(|e| anyhow::anyhow!("descriptor uuid invalid: {}", e))?;

        // 版本 + UUID + addons(空) + CMD_TCP + 端口 + 地址
        let mut request = BytesMut::new();
        request.put_u8(0x00);
        request.put_slice(uuid.as_bytes());
        request.put_u8(0x00);
        request.put_u8(0x01);
        request.put_u16(target.port());
        target.encode_vless(&mut request);

        stream.write_all(&request).await?;
        stream.flush().await?;

        // 响应：版本字节 + addons 长度
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x00 {
            return Err(CheckError::HandshakeRejected(format!(
                "unexpected response version 0x{:02x}",
                head[0]
            ))
            .into());
        }

        Ok(())
    }

    async fn probe_shadowsocks(&self, d: &ShadowsocksDescriptor, target: &Address) -> Result<()> {
        let mut stream = self.dialer.connect_host(&d.address, d.port).await?;

        let mut session = ss_wire::ClientSession::new(&d.method, &d.password)?;

        // 首帧：SOCKS5 目标地址 + 一个透传 HTTP 请求，促使服务端回包
        let mut payload = BytesMut::new();
        target.encode_socks5(&mut payload);
        payload.put_slice(&http_probe_request(&target.host()));

        let mut wire = session.local_salt.clone();
        wire.extend_from_slice(&session.send.seal_chunk(&payload)?);

        stream.write_all(&wire).await?;
        stream.flush().await?;

        session.read_server_hello(&mut stream).await?;
        Ok(())
    }

    async fn probe_trojan(&self, d: &TrojanDescriptor, target: &Address) -> Result<()> {
        let stream = self.dialer.connect_host(&d.address, d.port).await?;
        let mut stream = tls_connect(stream, d.server_name(), d.allow_insecure).await?;

        // hex(SHA224(password)) CRLF CMD addr CRLF
        let mut request = BytesMut::new();
        request.put_slice(password_hash(&d.password).as_bytes());
        request.put_slice(b"\r\n");
        request.put_u8(0x01);
        target.encode_socks5(&mut request);
        request.put_slice(b"\r\n");
        request.put_slice(&http_probe_request(&target.host()));

        stream.write_all(&request).await?;
        stream.flush().await?;

        // Trojan 没有协议层回执，凭据错误时服务端断连或回伪装页。
        // 能读到透传目标的任何回包就算通过。
        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(
                CheckError::HandshakeRejected("server closed without relaying".into()).into(),
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Prober for ProtocolProber {
    async fn probe(&self, descriptor: &ConnectionDescriptor, target: &Address) -> Result<()> {
        match descriptor {
            ConnectionDescriptor::Vmess(d) => self.probe_vmess(d, target).await,
            ConnectionDescriptor::Vless(d) => self.probe_vless(d, target).await,
            ConnectionDescriptor::Shadowsocks(d) => self.probe_shadowsocks(d, target).await,
            ConnectionDescriptor::Trojan(d) => self.probe_trojan(d, target).await,
        }
    }
}

/// Trojan 认证头：SHA224 摘要的小写 hex
pub fn password_hash(password: &str) -> String {
    let digest = Sha224::digest(password.as_bytes());
    crate::link::hex_encode(&digest)
}

/// 透传给目标的最小 HTTP 请求
fn http_probe_request(host: &str) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: subcheck/0.1\r\nConnection: close\r\n\r\n",
        host
    )
    .into_bytes()
}
