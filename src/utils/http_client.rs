/// 全局共享的 HTTP 客户端
///
/// Token 交换与 Zoho Mail API 调用共用同一个连接池。
/// 不设置整体请求超时：交换请求的超时由传输层默认值决定。
use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// 全局 HTTP 客户端实例（使用懒初始化）
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(concat!("InfocoMail/", env!("CARGO_PKG_VERSION"), " (Rust)"))
        .build()
        // 构建只会在 TLS 后端初始化失败时出错，此时退回默认客户端
        .unwrap_or_else(|e| {
            tracing::error!("构建全局 HTTP 客户端失败，使用默认配置: {}", e);
            Client::new()
        })
});

/// 获取全局 HTTP 客户端
pub fn get_client() -> &'static Client {
    &HTTP_CLIENT
}
