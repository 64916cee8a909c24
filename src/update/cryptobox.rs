//! 发布载荷的密封。
//!
//! AES-256-GCM，密钥是原始 32 字节。线格式：`[12B nonce][ciphertext || 16B tag]`。
//! 解封失败一律 [`IntegrityError`]，不区分篡改和错钥，也绝不降级为明文。

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::Rng;
use thiserror::Error;

pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 最短合法密文：nonce + tag（空明文）
const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

/// 密封数据无法验证
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("sealed blob too short: {0} bytes, minimum {MIN_BLOB_LEN}")]
    Truncated(usize),

    #[error("authentication failed: tampered data or wrong key")]
    AuthFailed,
}

/// 一段密封后的数据：nonce + 带认证标签的密文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_LEN],
    /// ciphertext || 16 字节 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < MIN_BLOB_LEN {
            return Err(IntegrityError::Truncated(bytes.len()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// 对称密封盒
pub struct CryptoBox {
    cipher: Aes256Gcm,
}

impl CryptoBox {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        // 32 字节定长，new_from_slice 不会失败
        let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256 key is exactly 32 bytes");
        Self { cipher }
    }

    /// 密封明文。nonce 每次随机，同一输入两次密封产物不同。
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedBlob, IntegrityError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| IntegrityError::AuthFailed)?;

        Ok(EncryptedBlob { nonce, ciphertext })
    }

    /// 解封。任何验证失败都是 [`IntegrityError`]，调用方必须向上抛。
    pub fn open(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, IntegrityError> {
        self.cipher
            .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
            .map_err(|_| IntegrityError::AuthFailed)
    }

    /// 密封并序列化为存储用的字节串
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, IntegrityError> {
        Ok(self.seal(plaintext)?.to_bytes())
    }

    /// 从字节串反序列化并解封
    pub fn open_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, IntegrityError> {
        self.open(&EncryptedBlob::from_bytes(bytes)?)
    }
}
