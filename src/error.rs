/// 邮件会话错误类型
///
/// 所有变体都可 `Clone`：并发刷新时同一个结果需要分发给每个等待者
use thiserror::Error;

/// Zoho Mail 会话相关的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    /// 本地没有任何 Token，调用方需要走授权流程
    #[error("未连接 Zoho Mail，请先完成授权")]
    NotAuthenticated,

    /// Refresh Token 交换失败，会话已被清空
    #[error("{0}")]
    RefreshFailed(String),

    /// 下游 API 调用失败（Token 本身有效，会话保持不变）
    #[error("{operation}失败: {message}")]
    UpstreamRequestFailed {
        operation: &'static str,
        message: String,
    },

    /// 授权回调中携带了错误码而不是 Token
    #[error("授权失败: {0}")]
    CallbackError(String),

    /// 调用参数不完整
    #[error("参数无效: {0}")]
    InvalidInput(String),

    /// OAuth2 / 应用配置问题
    #[error("配置错误: {0}")]
    Config(String),

    /// 会话持久化失败
    #[error("会话存储失败: {0}")]
    Storage(String),

    /// 网络层错误（请求未到达服务器或响应无法读取）
    #[error("网络请求失败: {0}")]
    Http(String),
}

impl MailError {
    /// 是否需要用户重新授权
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::RefreshFailed(_))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

pub type MailResult<T> = std::result::Result<T, MailError>;
