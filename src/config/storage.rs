/// 会话文件存储模块
///
/// 负责将 Zoho Token 与账户信息持久化到 TOML 文件。
/// 每次写入都是整条记录的原子替换（临时文件 + rename）。
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::crypto::{self, TokenCipher};
use crate::mail::zoho::types::{AccountInfo, SessionRecord, TokenState};

/// 会话存储文件版本号
const STORAGE_VERSION: &str = "1.0";

/// 会话存储抽象
///
/// `replace` 必须整体替换记录：其他读者不能看到只更新了一半的字段
pub trait SessionStore: Send + Sync {
    /// 读取当前会话记录（不存在时返回空记录）
    fn load(&self) -> Result<SessionRecord>;

    /// 用新记录整体替换旧记录
    fn replace(&self, record: &SessionRecord) -> Result<()>;
}

/// 内存会话存储（测试与一次性会话使用）
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<SessionRecord> {
        let guard = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("会话记录锁已损坏"))?;
        Ok(guard.clone())
    }

    fn replace(&self, record: &SessionRecord) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("会话记录锁已损坏"))?;
        *guard = record.clone();
        Ok(())
    }
}

/// 会话文件格式
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    /// 文件格式版本
    version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<StoredTokens>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    account: Option<AccountInfo>,
}

/// 加密后的 Token 条目
#[derive(Debug, Serialize, Deserialize)]
struct StoredTokens {
    /// 格式：`"encrypted:BASE64..."`
    access_token: String,

    /// 格式：`"encrypted:BASE64..."`
    refresh_token: String,

    /// 过期时间（Unix 毫秒）
    expires_at: i64,
}

/// 文件会话存储（Token 加密落盘）
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    cipher: TokenCipher,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>, cipher: TokenCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    /// 默认位置：`<config_dir>/InfocoMail/session.toml`，密钥从机器标识派生
    pub fn open_default() -> Result<Self> {
        let path = session_path()?;
        let cipher = TokenCipher::from_machine()?;
        Ok(Self::new(path, cipher))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, record: &SessionRecord) -> Result<SessionFile> {
        let tokens = match &record.tokens {
            Some(tokens) => Some(StoredTokens {
                access_token: self
                    .cipher
                    .encrypt(&tokens.access_token)
                    .context("加密 Access Token 失败")?,
                refresh_token: self
                    .cipher
                    .encrypt(&tokens.refresh_token)
                    .context("加密 Refresh Token 失败")?,
                expires_at: tokens.expires_at.timestamp_millis(),
            }),
            None => None,
        };

        Ok(SessionFile {
            version: STORAGE_VERSION.to_string(),
            tokens,
            account: record.account.clone(),
        })
    }

    fn decode(&self, file: SessionFile) -> Result<SessionRecord> {
        if file.version != STORAGE_VERSION {
            tracing::warn!(
                "会话文件版本不匹配（期望: {}, 实际: {}），尝试兼容加载",
                STORAGE_VERSION,
                file.version
            );
        }

        let tokens = match file.tokens {
            Some(stored) => {
                if !crypto::is_encrypted(&stored.access_token)
                    || !crypto::is_encrypted(&stored.refresh_token)
                {
                    anyhow::bail!("Token 格式错误：应为加密格式（encrypted:...）");
                }

                Some(TokenState {
                    access_token: self
                        .cipher
                        .decrypt(&stored.access_token)
                        .context("解密 Access Token 失败")?,
                    refresh_token: self
                        .cipher
                        .decrypt(&stored.refresh_token)
                        .context("解密 Refresh Token 失败")?,
                    expires_at: millis_to_datetime(stored.expires_at)?,
                })
            }
            None => None,
        };

        Ok(SessionRecord {
            tokens,
            account: file.account,
        })
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<SessionRecord> {
        if !self.path.exists() {
            tracing::debug!("会话文件不存在，返回空会话");
            return Ok(SessionRecord::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("读取会话文件失败: {}", self.path.display()))?;

        let file: SessionFile =
            toml::from_str(&content).context("解析会话文件失败（文件可能损坏）")?;

        self.decode(file)
    }

    fn replace(&self, record: &SessionRecord) -> Result<()> {
        if record.is_empty() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("会话文件已删除: {}", self.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("删除会话文件失败: {}", self.path.display())
                    });
                }
            }
            return Ok(());
        }

        let content =
            toml::to_string_pretty(&self.encode(record)?).context("序列化会话数据失败")?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).context("创建配置目录失败")?;
        }

        // 先写临时文件再 rename，读者只会看到旧记录或新记录
        let tmp_path = self
            .path
            .with_extension(format!("toml.{:08x}.tmp", rand::random::<u32>()));
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("写入临时会话文件失败: {}", tmp_path.display()))?;

        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            std::fs::remove_file(&tmp_path).ok();
            return Err(e)
                .with_context(|| format!("替换会话文件失败: {}", self.path.display()));
        }

        tracing::debug!("会话已保存到: {}", self.path.display());
        Ok(())
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow::anyhow!("无效的过期时间戳: {}", ms))
}

/// 获取会话文件路径
///
/// 返回：`<config_dir>/InfocoMail/session.toml`
pub fn session_path() -> Result<PathBuf> {
    Ok(crate::config::config_dir()?.join("session.toml"))
}
