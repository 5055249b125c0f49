/// OAuth2 配置读取模块
///
/// 支持从环境变量、配置文件或默认值读取 Zoho OAuth2 客户端凭据
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::MailError;

/// 客户端凭据的环境变量名
pub const CLIENT_ID_ENV: &str = "ZOHO_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "ZOHO_CLIENT_SECRET";

const PLACEHOLDER_CLIENT_ID: &str = "YOUR_ZOHO_CLIENT_ID";
const PLACEHOLDER_CLIENT_SECRET: &str = "YOUR_ZOHO_CLIENT_SECRET";

/// OAuth2 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Zoho OAuth2 客户端 ID
    pub client_id: String,

    /// Zoho OAuth2 客户端密钥
    pub client_secret: String,

    /// 重定向 URI（应用地址，隐式流程从它的 fragment 中取 Token）
    pub redirect_uri: String,

    /// 请求的 API 权限范围
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// 账户服务器（不同数据中心：.com / .eu / .in ...）
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,

    /// Zoho Mail API 根地址
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_scopes() -> Vec<String> {
    vec![
        "ZohoMail.accounts.READ".to_string(),
        // READ, CREATE, UPDATE, DELETE
        "ZohoMail.messages.ALL".to_string(),
    ]
}

fn default_accounts_url() -> String {
    "https://accounts.zoho.com".to_string()
}

fn default_api_base_url() -> String {
    "https://mail.zoho.com/api".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: PLACEHOLDER_CLIENT_ID.to_string(),
            client_secret: PLACEHOLDER_CLIENT_SECRET.to_string(),
            redirect_uri: "http://localhost:5173".to_string(),
            scopes: default_scopes(),
            accounts_url: default_accounts_url(),
            api_base_url: default_api_base_url(),
        }
    }
}

impl OAuthConfig {
    /// 加载 OAuth2 配置
    ///
    /// 优先级（从高到低）：
    /// 1. 环境变量：`ZOHO_CLIENT_ID`, `ZOHO_CLIENT_SECRET`
    /// 2. 配置文件：`<config_dir>/InfocoMail/config.toml` 的 `[oauth]` 段
    /// 3. 默认占位符（用于开发/测试）
    ///
    /// 地址类变量（`ZOHO_REDIRECT_URI` / `VERCEL_URL` / `APP_URL`、
    /// `ZOHO_ACCOUNTS_URL`、`ZOHO_API_BASE_URL`）在任何来源之上覆盖
    pub fn load() -> Result<Self> {
        let base = match Self::load_from_file() {
            Ok(config) => {
                tracing::info!("✅ 从配置文件加载 OAuth2 配置");
                Some(config)
            }
            Err(e) => {
                tracing::debug!("未使用配置文件中的 OAuth2 配置: {}", e);
                None
            }
        };

        let config = Self::resolve(base, |key| std::env::var(key).ok());

        if config.is_placeholder() {
            tracing::warn!("⚠️ 未找到 OAuth2 配置，使用默认占位符");
            tracing::warn!(
                "请设置环境变量 {} / {} 或创建配置文件：{}",
                CLIENT_ID_ENV,
                CLIENT_SECRET_ENV,
                Self::config_file_path()?.display()
            );
        }

        Ok(config)
    }

    /// 在文件配置（或默认值）之上叠加环境变量
    pub fn resolve(base: Option<Self>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut cfg = base.unwrap_or_default();

        if let (Some(client_id), Some(client_secret)) =
            (var(CLIENT_ID_ENV), var(CLIENT_SECRET_ENV))
        {
            tracing::info!("✅ 从环境变量加载 OAuth2 凭据");
            cfg.client_id = client_id;
            cfg.client_secret = client_secret;
        }

        if let Some(uri) = var("ZOHO_REDIRECT_URI") {
            cfg.redirect_uri = uri;
        } else if let Some(host) = var("VERCEL_URL") {
            cfg.redirect_uri = format!("https://{}", host);
        } else if let Some(app_url) = var("APP_URL") {
            cfg.redirect_uri = app_url;
        }

        if let Some(url) = var("ZOHO_ACCOUNTS_URL") {
            cfg.accounts_url = url;
        }
        if let Some(url) = var("ZOHO_API_BASE_URL") {
            cfg.api_base_url = url;
        }

        cfg.accounts_url = cfg.accounts_url.trim_end_matches('/').to_string();
        cfg.api_base_url = cfg.api_base_url.trim_end_matches('/').to_string();
        cfg
    }

    /// 从配置文件加载
    fn load_from_file() -> Result<Self> {
        let path = Self::config_file_path()?;

        if !path.exists() {
            anyhow::bail!("配置文件不存在: {}", path.display());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    /// 解析完整配置文件中的 `[oauth]` 段
    fn from_toml(content: &str) -> Result<Self> {
        let config_toml: toml::Value = toml::from_str(content)?;

        let oauth_section = config_toml
            .get("oauth")
            .ok_or_else(|| anyhow::anyhow!("配置文件缺少 [oauth] 段"))?;

        Ok(oauth_section.clone().try_into()?)
    }

    fn config_file_path() -> Result<PathBuf> {
        crate::config::config_path()
    }

    /// 验证配置是否为默认占位符
    pub fn is_placeholder(&self) -> bool {
        !self.missing_credentials().is_empty()
    }

    /// 缺失的凭据（以环境变量名表示）
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.client_id.trim().is_empty() || self.client_id == PLACEHOLDER_CLIENT_ID {
            missing.push(CLIENT_ID_ENV);
        }
        if self.client_secret.trim().is_empty() || self.client_secret == PLACEHOLDER_CLIENT_SECRET
        {
            missing.push(CLIENT_SECRET_ENV);
        }
        missing
    }

    /// 检查凭据，缺失时列出所有缺失项
    pub fn check_credentials(&self) -> Result<(), MailError> {
        let missing = self.missing_credentials();
        if missing.is_empty() {
            return Ok(());
        }

        let message = format!(
            "无法初始化 Zoho Mail 集成，缺少以下凭据: {}。请设置对应的环境变量或在配置文件 [oauth] 段中填写",
            missing.join(", ")
        );
        tracing::error!("❌ {}", message);
        Err(MailError::Config(message))
    }

    /// Zoho 的 scope 以逗号分隔
    pub fn scope_string(&self) -> String {
        self.scopes.join(",")
    }

    pub fn auth_url(&self) -> String {
        format!("{}/oauth/v2/auth", self.accounts_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/v2/token", self.accounts_url)
    }
}
