use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod crypto;
pub mod oauth_config;
pub mod storage;

/// 配置目录名（位于系统配置目录下）
const APP_DIR_NAME: &str = "InfocoMail";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 收件箱轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// 每次列出的邮件数量
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,

    /// 刷新代理地址（设置后不直接访问 Zoho token 端点）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_proxy_url: Option<String>,
}

fn default_poll_interval() -> u64 {
    300
}

fn default_list_limit() -> u32 {
    50
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            list_limit: default_list_limit(),
            refresh_proxy_url: None,
        }
    }
}

/// 获取配置目录：`<config_dir>/InfocoMail`
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("无法获取配置目录"))?
        .join(APP_DIR_NAME);

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 获取配置文件路径
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// 加载配置
///
/// 文件不存在时写入默认配置；`[oauth]` 等其他段落由各自模块读取
pub fn load() -> Result<Config> {
    let path = config_path()?;

    if !path.exists() {
        let config = Config::default();
        save(&config)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// 保存配置
pub fn save(config: &Config) -> Result<()> {
    let path = config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = toml::from_str("[app]\nlist_limit = 20\n").unwrap();
        assert_eq!(config.app.list_limit, 20);
        assert_eq!(config.app.poll_interval, 300);
        assert!(config.app.refresh_proxy_url.is_none());
    }

    #[test]
    fn test_ignores_other_sections() {
        let config: Config =
            toml::from_str("[oauth]\nclient_id = \"x\"\n\n[app]\npoll_interval = 60\n").unwrap();
        assert_eq!(config.app.poll_interval, 60);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.app.list_limit, 50);
    }
}
