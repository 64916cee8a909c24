//! Shadowsocks AEAD 会话密码学。
//!
//! 首帧 = salt || seal(len) || seal(payload)。服务端若持有同一密码，
//! 会回自己的 salt 和至少一个长度块；长度块能解开即认证通过。

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use anyhow::{bail, Result};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::CheckError;

pub const TAG_LEN: usize = 16;

/// 单块明文上限（协议规定 0x3FFF）
pub const MAX_CHUNK: usize = 0x3FFF;

/// 支持的 AEAD 加密方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn from_method(s: &str) -> Result<Self> {
        match s {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => bail!("unsupported shadowsocks cipher: {}", other),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// salt 长度与 key 长度一致
    pub fn salt_len(self) -> usize {
        self.key_len()
    }
}

/// EVP_BytesToKey：密码到主密钥的 OpenSSL 兼容派生（迭代 MD5）
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref p) = prev {
            hasher.update(p);
        }
        hasher.update(password);
        let digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// HKDF-SHA1 会话子密钥，info 固定为 "ss-subkey"
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
    Ok(subkey)
}

/// 单方向的 AEAD 状态：nonce 是 12 字节 LE 计数器，每次 seal/open 递增
pub struct DirectionCipher {
    kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl DirectionCipher {
    pub fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            key: subkey,
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        nonce
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let mut buf = plaintext.to_vec();

        let tag = match self.kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                .map_err(|e| anyhow::anyhow!("AES-128-GCM encrypt failed: {}", e))?,
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                .map_err(|e| anyhow::anyhow!("AES-256-GCM encrypt failed: {}", e))?,
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
                    .map_err(|e| anyhow::anyhow!("ChaCha20-Poly1305 encrypt failed: {}", e))?
            }
        };
        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < TAG_LEN {
            bail!(
                "ciphertext too short: {} bytes, need at least {}",
                sealed.len(),
                TAG_LEN
            );
        }

        let nonce = self.next_nonce();
        let ct_len = sealed.len() - TAG_LEN;
        let mut buf = sealed[..ct_len].to_vec();
        let tag = GenericArray::from_slice(&sealed[ct_len..]);

        let result = match self.kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag),
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag)
            }
        };
        result.map_err(|e| anyhow::anyhow!("AEAD decrypt failed: {}", e))?;
        Ok(buf)
    }

    /// 把一段明文封装成 [len(2B)+tag][payload+tag] 帧
    pub fn seal_chunk(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_CHUNK {
            bail!("chunk exceeds protocol maximum: {} bytes", payload.len());
        }
        let len_frame = self.seal(&(payload.len() as u16).to_be_bytes())?;
        let body_frame = self.seal(payload)?;
        let mut out = Vec::with_capacity(len_frame.len() + body_frame.len());
        out.extend_from_slice(&len_frame);
        out.extend_from_slice(&body_frame);
        Ok(out)
    }
}

/// 客户端会话：发送方向的 salt 和已初始化的方向密码
pub struct ClientSession {
    pub kind: CipherKind,
    master_key: Vec<u8>,
    pub local_salt: Vec<u8>,
    pub send: DirectionCipher,
}

impl ClientSession {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let kind = CipherKind::from_method(method)?;
        let master_key = evp_bytes_to_key(password.as_bytes(), kind.key_len());

        let mut local_salt = vec![0u8; kind.salt_len()];
        rand::thread_rng().fill(&mut local_salt[..]);

        let subkey = derive_subkey(&master_key, &local_salt, kind.key_len())?;
        let send = DirectionCipher::new(kind, subkey);

        Ok(Self {
            kind,
            master_key,
            local_salt,
            send,
        })
    }

    /// 读服务端 salt 并解开第一个长度块。
    ///
    /// 长度块 AEAD 验证失败说明密码不匹配（或对端不是 shadowsocks），
    /// 归类为 [`CheckError::HandshakeRejected`]。
    pub async fn read_server_hello<S>(&mut self, stream: &mut S) -> Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        let mut server_salt = vec![0u8; self.kind.salt_len()];
        stream.read_exact(&mut server_salt).await?;

        let subkey = derive_subkey(&self.master_key, &server_salt, self.kind.key_len())?;
        let mut recv = DirectionCipher::new(self.kind, subkey);

        let mut sealed_len = vec![0u8; 2 + TAG_LEN];
        stream.read_exact(&mut sealed_len).await?;

        let len_plain = recv
            .open(&sealed_len)
            .map_err(|_| CheckError::HandshakeRejected("response length chunk failed AEAD".into()))?;
        let chunk_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
        if chunk_len == 0 || chunk_len > MAX_CHUNK {
            return Err(CheckError::HandshakeRejected(format!(
                "implausible chunk length {}",
                chunk_len
            ))
            .into());
        }
        Ok(chunk_len)
    }
}
