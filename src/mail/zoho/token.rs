/// Token 生命周期管理模块
///
/// 过期前主动刷新、刷新失败时整体清空会话、并发调用只发起一次刷新
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::SessionStore;
use crate::error::{MailError, MailResult};
use crate::mail::zoho::oauth::{CallbackParams, ImplicitFlow};
use crate::mail::zoho::types::{AccountInfo, SessionRecord, TokenGrant, TokenState};
use crate::utils::{http_client, mask_secret};

/// 正在进行中的刷新（所有等待者共享同一个结果）
type RefreshFuture = Shared<BoxFuture<'static, MailResult<String>>>;

/// Refresh Token 交换的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEndpoint {
    /// 直接访问 Zoho token 端点（表单提交，携带客户端凭据）
    Direct {
        token_url: String,
        client_id: String,
        client_secret: String,
    },

    /// 通过刷新代理（JSON `{refresh_token}`，凭据保存在代理一侧）
    Proxy { url: String },
}

/// 交换成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
struct RefreshedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Serialize)]
struct ProxyRefreshRequest<'a> {
    refresh_token: &'a str,
}

impl RefreshEndpoint {
    /// 根据配置选择刷新方式，设置了代理地址时走代理
    pub fn from_config(config: &OAuthConfig, proxy_url: Option<&str>) -> Self {
        match proxy_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => Self::Proxy {
                url: url.to_string(),
            },
            None => Self::Direct {
                token_url: config.token_url(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
        }
    }

    /// 执行一次交换
    ///
    /// 失败时返回用于展示给用户的错误详情（服务端 `error` 字段优先）
    async fn exchange(&self, refresh_token: &str) -> Result<RefreshedToken, String> {
        let client = http_client::get_client();

        let request = match self {
            Self::Direct {
                token_url,
                client_id,
                client_secret,
            } => client.post(token_url).form(&[
                ("refresh_token", refresh_token),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ]),
            Self::Proxy { url } => client.post(url).json(&ProxyRefreshRequest { refresh_token }),
        };

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        parse_token_response(status, &body)
    }
}

/// 解析 token 端点响应
///
/// Zoho 对无效的 refresh token 可能返回 HTTP 200 + `{"error": "invalid_code"}`，
/// 因此状态码和 `error` 字段都要检查
fn parse_token_response(status: reqwest::StatusCode, body: &str) -> Result<RefreshedToken, String> {
    let json: Option<serde_json::Value> = serde_json::from_str(body).ok();

    let error = json
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.as_str())
        .filter(|e| !e.is_empty());

    if let Some(error) = error {
        return Err(error.to_string());
    }

    if !status.is_success() {
        return Err(format!("HTTP {}", status));
    }

    let json = json.ok_or_else(|| "响应不是有效的 JSON".to_string())?;

    let access_token = json
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "响应中缺少 access_token".to_string())?;

    let expires_in = json
        .get("expires_in")
        .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
        .ok_or_else(|| "响应中缺少 expires_in".to_string())?;

    let refresh_token = json
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    Ok(RefreshedToken {
        access_token: access_token.to_string(),
        refresh_token,
        expires_in,
    })
}

/// Token 管理器
///
/// 克隆开销很小，所有克隆共享同一个会话与同一个进行中的刷新
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    endpoint: RefreshEndpoint,
    in_flight: Mutex<Option<RefreshFuture>>,
    /// 会话记录的读-改-写锁（只在同步的 load/replace 期间持有）
    record_lock: Mutex<()>,
}

impl TokenManager {
    /// 创建 Token 管理器
    ///
    /// # Arguments
    /// * `store` - 会话持久化（文件或内存）
    /// * `endpoint` - Refresh Token 交换目标
    pub fn new(store: Arc<dyn SessionStore>, endpoint: RefreshEndpoint) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                endpoint,
                in_flight: Mutex::new(None),
                record_lock: Mutex::new(()),
            }),
        }
    }

    /// 获取有效的 Access Token
    ///
    /// - 没有 Token：清空残留状态，返回 `NotAuthenticated`
    /// - 未过期：直接返回，不发起网络请求
    /// - 已过期：刷新；已有刷新在进行时等待同一个结果
    ///
    /// # Errors
    /// - `NotAuthenticated`：需要走授权流程
    /// - `RefreshFailed`：刷新失败，会话已被清空
    /// - `Storage`：读写会话失败
    pub async fn get_valid_access_token(&self) -> MailResult<String> {
        let refresh = {
            let mut in_flight = self.inner.lock_in_flight();

            if let Some(pending) = in_flight.as_ref() {
                tracing::debug!("Token 刷新已在进行中，等待其结果");
                pending.clone()
            } else {
                // 在持有锁的情况下读取：刷新完成时先落盘再释放槽位，
                // 这里读到的一定是最新记录
                let tokens = self.inner.modify(|record| {
                    if record.tokens.is_none() {
                        *record = SessionRecord::default();
                    }
                    Ok(record.tokens.clone())
                })?;

                let Some(tokens) = tokens else {
                    return Err(MailError::NotAuthenticated);
                };

                if !tokens.is_expired() {
                    return Ok(tokens.access_token);
                }

                let inner = Arc::clone(&self.inner);
                let pending = async move {
                    let result = inner.refresh(tokens).await;
                    inner.lock_in_flight().take();
                    result
                }
                .boxed()
                .shared();

                *in_flight = Some(pending.clone());
                pending
            }
        };

        refresh.await
    }

    /// 断开连接：清空 Token 与账户信息（幂等，无网络请求）
    pub fn disconnect(&self) -> MailResult<()> {
        self.inner.modify(|record| {
            *record = SessionRecord::default();
            Ok(())
        })?;
        tracing::info!("🔌 已断开 Zoho Mail 连接");
        Ok(())
    }

    /// 保存隐式授权回调中的 Token
    ///
    /// 回调中没有 `access_token`/`expires_in` 时返回 `CallbackError`，会话保持不变
    pub fn save_tokens_from_callback(&self, params: &CallbackParams) -> MailResult<()> {
        let grant = ImplicitFlow::grant_from_params(params)?;
        self.save_grant(grant)
    }

    /// 保存任意授权流程产出的 Token
    ///
    /// 回调没有带 Refresh Token 时保留之前的 Refresh Token
    pub fn save_grant(&self, grant: TokenGrant) -> MailResult<()> {
        self.inner.modify(|record| {
            let refresh_token = grant
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| record.tokens.as_ref().map(|t| t.refresh_token.clone()))
                .unwrap_or_default();

            if refresh_token.is_empty() {
                tracing::warn!("⚠️ 授权结果中没有 Refresh Token，Access Token 过期后需要重新授权");
            }

            let tokens =
                TokenState::issue(grant.access_token, refresh_token, grant.expires_in, Utc::now())
                    .ok_or_else(|| {
                        MailError::CallbackError(format!(
                            "授权结果中的有效期无效: {}",
                            grant.expires_in
                        ))
                    })?;

            tracing::info!("✅ Token 已保存（过期时间: {}）", tokens.expires_at);
            tracing::debug!("Access Token: {}", mask_secret(&tokens.access_token));

            record.tokens = Some(tokens);
            Ok(())
        })
    }

    /// 当前会话记录
    pub fn session(&self) -> MailResult<SessionRecord> {
        self.inner.load()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.inner.load(),
            Ok(SessionRecord { tokens: Some(ref t), .. }) if !t.access_token.is_empty()
        )
    }

    /// 已缓存的账户信息
    pub fn account(&self) -> MailResult<Option<AccountInfo>> {
        Ok(self.inner.load()?.account)
    }

    /// 缓存账户信息；会话已被清空时不写入
    pub(crate) fn cache_account(&self, account: AccountInfo) -> MailResult<()> {
        self.inner.modify(|record| {
            if record.tokens.is_none() {
                tracing::debug!("会话已清空，跳过缓存账户信息");
                return Ok(());
            }

            tracing::info!("📫 缓存 Zoho 账户: {}", account.primary_email_address);
            record.account = Some(account);
            Ok(())
        })
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<RefreshFuture>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> MailResult<SessionRecord> {
        self.store.load().map_err(MailError::storage)
    }

    /// 在记录锁内读取、修改并（有变化时）整体替换会话记录
    ///
    /// 闭包返回错误时不写入
    fn modify<R>(
        &self,
        f: impl FnOnce(&mut SessionRecord) -> MailResult<R>,
    ) -> MailResult<R> {
        let _guard = self.record_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let original = self.load()?;
        let mut record = original.clone();
        let result = f(&mut record)?;

        if record != original {
            self.store.replace(&record).map_err(MailError::storage)?;
        }
        Ok(result)
    }

    /// 用 Refresh Token 交换新的 Access Token
    ///
    /// 失败时清空整个会话（不自动重试）
    async fn refresh(&self, expired: TokenState) -> MailResult<String> {
        tracing::info!(
            "Access Token 已过期（{}），开始刷新",
            expired.expires_at
        );

        let outcome = if expired.has_refresh_token() {
            self.endpoint.exchange(&expired.refresh_token).await
        } else {
            Err("没有可用的 Refresh Token".to_string())
        };

        let issued = outcome.and_then(|refreshed| {
            let refresh_token = refreshed
                .refresh_token
                .unwrap_or_else(|| expired.refresh_token.clone());
            TokenState::issue(
                refreshed.access_token,
                refresh_token,
                refreshed.expires_in,
                Utc::now(),
            )
            .ok_or_else(|| format!("expires_in 超出范围: {}", refreshed.expires_in))
        });

        match issued {
            Ok(tokens) => self.store_refreshed(&expired, tokens),
            Err(detail) => self.discard_failed(&expired, detail),
        }
    }

    fn store_refreshed(&self, expired: &TokenState, tokens: TokenState) -> MailResult<String> {
        self.modify(|record| {
            // 刷新期间会话被断开或被新的授权替换：不覆盖
            if record.tokens.as_ref() != Some(expired) {
                tracing::warn!("⚠️ 刷新期间会话已变化，丢弃本次刷新结果");
                return match &record.tokens {
                    Some(current) => Ok(current.access_token.clone()),
                    None => Err(MailError::NotAuthenticated),
                };
            }

            tracing::info!("✅ Access Token 刷新成功（新的过期时间: {}）", tokens.expires_at);
            tracing::debug!("新 Token: {}", mask_secret(&tokens.access_token));

            let access_token = tokens.access_token.clone();
            record.tokens = Some(tokens);
            Ok(access_token)
        })
    }

    /// 刷新失败：会话仍是这次刷新的那一份时整体清空
    fn discard_failed(&self, expired: &TokenState, detail: String) -> MailResult<String> {
        let message = format!(
            "您的 Zoho 会话已过期，请重新连接。（错误: {}）",
            detail
        );
        tracing::error!("❌ Token 刷新失败: {}", detail);

        let current = self.modify(|record| {
            if record.tokens.as_ref() == Some(expired) {
                tracing::info!("🔌 刷新失败，断开连接");
                *record = SessionRecord::default();
            }
            Ok(record.tokens.clone())
        });

        match current {
            Ok(Some(current)) => {
                tracing::warn!("⚠️ 刷新期间会话已被重新授权，保留新的 Token");
                Ok(current.access_token)
            }
            Ok(None) => Err(MailError::RefreshFailed(message)),
            Err(e) => {
                tracing::error!("清空会话失败: {}", e);
                Err(MailError::RefreshFailed(message))
            }
        }
    }
}
