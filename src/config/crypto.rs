/// Token 加密/解密模块
///
/// 使用 AES-256-GCM 对持久化的 OAuth2 Token 进行加密存储
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use crate::utils::machine_id;

/// 加密前缀（用于识别加密数据）
const ENCRYPTED_PREFIX: &str = "encrypted:";

/// AES-GCM Nonce 长度（12 字节）
const NONCE_SIZE: usize = 12;

/// Token 加密器
///
/// 密钥由调用方注入；生产环境使用 [`TokenCipher::from_machine`]
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// 使用从机器标识派生的密钥
    ///
    /// # Errors
    /// - 无法读取机器标识
    /// - 密钥派生失败
    pub fn from_machine() -> Result<Self> {
        let key = machine_id::derive_encryption_key().context("无法派生加密密钥")?;
        Ok(Self::new(key))
    }

    /// 加密明文 Token
    ///
    /// # 数据格式
    /// 返回格式：`"encrypted:" + Base64(nonce[12 bytes] + ciphertext)`
    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key.into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| anyhow::anyhow!("AES-GCM 加密失败: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
    }

    /// 解密 `encrypted:` 前缀的 Token
    ///
    /// # Errors
    /// - 格式错误（缺少前缀）
    /// - Base64 解码失败
    /// - 数据长度不足
    /// - 解密失败（密钥错误或数据损坏）
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let base64_data = encrypted
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("加密数据格式错误：缺少 'encrypted:' 前缀"))?;

        let combined = BASE64.decode(base64_data).context("Base64 解码失败")?;

        if combined.len() < NONCE_SIZE {
            anyhow::bail!(
                "加密数据长度不足（需要至少 {} 字节，实际 {} 字节）",
                NONCE_SIZE,
                combined.len()
            );
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key.into());
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("AES-GCM 解密失败（可能密钥错误或数据损坏）: {}", e))?;

        String::from_utf8(plaintext).context("解密后的数据不是有效的 UTF-8 字符串")
    }
}

/// 检查字符串是否为加密格式
pub fn is_encrypted(s: &str) -> bool {
    s.starts_with(ENCRYPTED_PREFIX)
}
