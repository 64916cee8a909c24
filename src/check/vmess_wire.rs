//! VMess AEAD 握手报文编解码。
//!
//! 只覆盖探测需要的部分：加密请求头的构造和响应头的读取验证。
//! 响应头能解开且 resp_auth 匹配，说明对端持有同一 UUID，节点判定有效。

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::{Address, CheckError};

type HmacMd5 = Hmac<Md5>;

pub const CMD_TCP: u8 = 0x01;

const TAG_LEN: usize = 16;

/// VMess 安全类型字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Aes128Gcm,
    Chacha20Poly1305,
    None,
    Zero,
}

impl SecurityType {
    /// 订阅里的 scy 字段；"auto" 在探测场景等价于 aes-128-gcm
    pub fn from_link(s: &str) -> Self {
        match s {
            "chacha20-poly1305" => SecurityType::Chacha20Poly1305,
            "none" => SecurityType::None,
            "zero" => SecurityType::Zero,
            _ => SecurityType::Aes128Gcm,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SecurityType::Aes128Gcm => 0x03,
            SecurityType::Chacha20Poly1305 => 0x04,
            SecurityType::None => 0x05,
            SecurityType::Zero => 0x06,
        }
    }
}

/// 从 UUID 派生 cmd_key (MD5(UUID))
pub fn cmd_key_from_uuid(uuid: &[u8; 16]) -> [u8; 16] {
    let digest = Md5::digest(uuid);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// AEAD 认证 ID：HMAC-MD5(cmd_key, timestamp_be)
pub fn auth_id(cmd_key: &[u8; 16], timestamp: u64) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(cmd_key).expect("HMAC accepts any key length");
    mac.update(&timestamp.to_be_bytes());
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&result[..16]);
    out
}

/// VMess KDF：HMAC-SHA256 链，每一级用上一级输出做密钥
pub fn kdf(key: &[u8], paths: &[&[u8]]) -> Vec<u8> {
    let mut current = key.to_vec();
    for path in paths {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&current).expect("HMAC accepts any key length");
        mac.update(path);
        current = mac.finalize().into_bytes().to_vec();
    }
    current
}

pub fn fnv1a_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// 封装好的请求头和验证响应所需的派生材料
pub struct SealedRequest {
    pub bytes: BytesMut,
    pub resp_auth: u8,
    pub resp_key: [u8; 16],
    pub resp_iv: [u8; 16],
}

/// 构造 AEAD 请求头。
///
/// body key/iv/resp_auth 随机生成；返回值里带的 resp_key/resp_iv 是
/// SHA256(请求 key/iv) 的前 16 字节，用于解响应头。
pub fn seal_request(
    uuid: &[u8; 16],
    security: SecurityType,
    target: &Address,
) -> Result<SealedRequest> {
    let mut rng = rand::thread_rng();
    let mut body_key = [0u8; 16];
    let mut body_iv = [0u8; 16];
    rng.fill(&mut body_key);
    rng.fill(&mut body_iv);
    let resp_auth: u8 = rng.gen();

    let mut header = BytesMut::new();
    header.put_u8(1); // 版本
    header.put_slice(&body_iv);
    header.put_slice(&body_key);
    header.put_u8(resp_auth);
    header.put_u8(0x01); // option: chunk stream
    header.put_u8(security.to_byte() & 0x0f); // P=0，无 padding
    header.put_u8(0x00); // 保留
    header.put_u8(CMD_TCP);
    encode_target(&mut header, target);
    let checksum = fnv1a_hash(&header);
    header.put_u32(checksum);

    let cmd_key = cmd_key_from_uuid(uuid);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| anyhow::anyhow!("system clock before epoch: {}", e))?
        .as_secs();
    let aid = auth_id(&cmd_key, timestamp);

    let mut conn_nonce = [0u8; 8];
    rng.fill(&mut conn_nonce);

    use aes_gcm::{aead::Aead, Aes128Gcm, KeyInit, Nonce};

    let header_key = kdf16(&cmd_key, &[b"VMess Header AEAD Key", &aid, &conn_nonce]);
    let header_nonce = kdf12(&cmd_key, &[b"VMess Header AEAD Nonce", &aid, &conn_nonce]);
    let cipher = Aes128Gcm::new_from_slice(&header_key)
        .map_err(|e| anyhow::anyhow!("AES key init failed: {}", e))?;
    let sealed_header = cipher
        .encrypt(Nonce::from_slice(&header_nonce), header.as_ref())
        .map_err(|e| anyhow::anyhow!("header encrypt failed: {}", e))?;

    let length_key = kdf16(
        &cmd_key,
        &[b"VMess Header AEAD Key Length", &aid, &conn_nonce],
    );
    let length_nonce = kdf12(
        &cmd_key,
        &[b"VMess Header AEAD Nonce Length", &aid, &conn_nonce],
    );
    let length_cipher = Aes128Gcm::new_from_slice(&length_key)
        .map_err(|e| anyhow::anyhow!("AES key init failed: {}", e))?;
    let sealed_length = length_cipher
        .encrypt(
            Nonce::from_slice(&length_nonce),
            (sealed_header.len() as u16).to_be_bytes().as_ref(),
        )
        .map_err(|e| anyhow::anyhow!("length encrypt failed: {}", e))?;

    // auth_id(16) + sealed_length(18) + nonce(8) + sealed_header
    let mut bytes = BytesMut::with_capacity(16 + 18 + 8 + sealed_header.len());
    bytes.put_slice(&aid);
    bytes.put_slice(&sealed_length);
    bytes.put_slice(&conn_nonce);
    bytes.put_slice(&sealed_header);

    let (resp_key, resp_iv) = derive_response_key_iv(&body_key, &body_iv);

    Ok(SealedRequest {
        bytes,
        resp_auth,
        resp_key,
        resp_iv,
    })
}

/// VMess 目标地址编码：port(BE) 在前，随后 atyp + addr
fn encode_target(buf: &mut BytesMut, addr: &Address) {
    match addr {
        Address::Ip(socket_addr) => {
            buf.put_u16(socket_addr.port());
            match socket_addr.ip() {
                std::net::IpAddr::V4(v4) => {
                    buf.put_u8(0x01);
                    buf.put_slice(&v4.octets());
                }
                std::net::IpAddr::V6(v6) => {
                    buf.put_u8(0x03);
                    buf.put_slice(&v6.octets());
                }
            }
        }
        Address::Domain(domain, port) => {
            buf.put_u16(*port);
            buf.put_u8(0x02);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
        }
    }
}

/// 响应 key/iv = SHA256(请求 key/iv) 前 16 字节
pub fn derive_response_key_iv(body_key: &[u8; 16], body_iv: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let key_digest = Sha256::digest(body_key);
    let iv_digest = Sha256::digest(body_iv);
    let mut resp_key = [0u8; 16];
    let mut resp_iv = [0u8; 16];
    resp_key.copy_from_slice(&key_digest[..16]);
    resp_iv.copy_from_slice(&iv_digest[..16]);
    (resp_key, resp_iv)
}

/// 读取并验证 AEAD 响应头。
///
/// 先读 18 字节加密长度块，再读 len+16 字节加密头。解密失败或
/// resp_auth 不匹配都归为 [`CheckError::HandshakeRejected`]。
pub async fn read_response_header<S>(stream: &mut S, sealed: &SealedRequest) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    use aes_gcm::{aead::Aead, Aes128Gcm, KeyInit, Nonce};

    let mut sealed_length = [0u8; 2 + TAG_LEN];
    stream.read_exact(&mut sealed_length).await?;

    let length_key = kdf16(&sealed.resp_key, &[b"AEAD Resp Header Len Key"]);
    let length_nonce = kdf12(&sealed.resp_iv, &[b"AEAD Resp Header Len IV"]);
    let length_cipher = Aes128Gcm::new_from_slice(&length_key)
        .map_err(|e| anyhow::anyhow!("response length key init: {}", e))?;
    let length_plain = length_cipher
        .decrypt(Nonce::from_slice(&length_nonce), sealed_length.as_ref())
        .map_err(|_| CheckError::HandshakeRejected("response length decrypt failed".into()))?;
    if length_plain.len() != 2 {
        return Err(CheckError::HandshakeRejected("bad response length block".into()).into());
    }
    let header_len = u16::from_be_bytes([length_plain[0], length_plain[1]]) as usize;
    if header_len < 4 || header_len > 2048 {
        return Err(CheckError::HandshakeRejected(format!(
            "implausible response header length {}",
            header_len
        ))
        .into());
    }

    let mut sealed_header = vec![0u8; header_len + TAG_LEN];
    stream.read_exact(&mut sealed_header).await?;

    let header_key = kdf16(&sealed.resp_key, &[b"AEAD Resp Header Key"]);
    let header_nonce = kdf12(&sealed.resp_iv, &[b"AEAD Resp Header IV"]);
    let header_cipher = Aes128Gcm::new_from_slice(&header_key)
        .map_err(|e| anyhow::anyhow!("response header key init: {}", e))?;
    let header = header_cipher
        .decrypt(Nonce::from_slice(&header_nonce), sealed_header.as_ref())
        .map_err(|_| CheckError::HandshakeRejected("response header decrypt failed".into()))?;

    if header.is_empty() {
        return Err(CheckError::HandshakeRejected("empty response header".into()).into());
    }
    if header[0] != sealed.resp_auth {
        return Err(CheckError::HandshakeRejected(format!(
            "response auth mismatch: expected 0x{:02x}, got 0x{:02x}",
            sealed.resp_auth, header[0]
        ))
        .into());
    }

    Ok(())
}

fn kdf16(key: &[u8], paths: &[&[u8]]) -> [u8; 16] {
    let material = kdf(key, paths);
    let mut out = [0u8; 16];
    out.copy_from_slice(&material[..16]);
    out
}

fn kdf12(key: &[u8], paths: &[&[u8]]) -> [u8; 12] {
    let material = kdf(key, paths);
    let mut out = [0u8; 12];
    out.copy_from_slice(&material[..12]);
    out
}
