/// Zoho Mail API 调用模块
///
/// 每个操作：取有效 Token → 发起一次请求 → 失败时返回服务端的错误信息
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::{MailError, MailResult};
use crate::mail::zoho::token::TokenManager;
use crate::mail::zoho::types::{
    AccountInfo, Email, EmailListItem, Envelope, OutgoingEmail, RawMessage, SendPayload,
};
use crate::utils::http_client;

const OP_ACCOUNT: &str = "获取 Zoho 账户";
const OP_LIST: &str = "获取邮件列表";
const OP_DETAIL: &str = "获取邮件详情";
const OP_SEND: &str = "发送邮件";

/// 默认每次列出的邮件数量
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Zoho Mail API 客户端
#[derive(Clone)]
pub struct ZohoMailClient {
    tokens: TokenManager,
    api_base: String,
    list_limit: u32,
    http: reqwest::Client,
}

impl ZohoMailClient {
    /// 创建新的 Zoho Mail API 客户端
    ///
    /// # Arguments
    /// * `tokens` - 共享的 Token 管理器
    /// * `api_base` - API 根地址，例如 `https://mail.zoho.com/api`
    pub fn new(tokens: TokenManager, api_base: impl Into<String>) -> Self {
        Self {
            tokens,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            list_limit: DEFAULT_LIST_LIMIT,
            http: http_client::get_client().clone(),
        }
    }

    pub fn with_list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// 列出收件箱邮件（按时间倒序）
    ///
    /// 首次调用时解析并缓存账户信息
    pub async fn list_emails(&self) -> MailResult<Vec<EmailListItem>> {
        let access_token = self.tokens.get_valid_access_token().await?;
        let account = self.resolve_account(&access_token).await?;

        tracing::debug!("正在获取邮件列表（账户 {}）...", account.account_id);

        let mut url = self.endpoint(&["accounts", &account.account_id, "messages", "view"])?;
        url.query_pairs_mut()
            .append_pair("limit", &self.list_limit.to_string())
            .append_pair("sortorder", "desc")
            .append_pair("status", "all");

        let response = self.get(url, &access_token).await?;
        let messages: Vec<RawMessage> = read_data(OP_LIST, response).await?;

        let emails: Vec<EmailListItem> = messages
            .into_iter()
            .map(RawMessage::into_list_item)
            .collect();

        tracing::info!("📬 获取到 {} 封邮件", emails.len());
        Ok(emails)
    }

    /// 获取单封邮件详情
    pub async fn get_email(&self, message_id: &str) -> MailResult<Email> {
        if message_id.trim().is_empty() {
            return Err(MailError::InvalidInput("messageId 不能为空".into()));
        }

        let access_token = self.tokens.get_valid_access_token().await?;
        let account = self.resolve_account(&access_token).await?;

        let url = self.endpoint(&["accounts", &account.account_id, "messages", message_id])?;
        let response = self.get(url, &access_token).await?;
        let message: RawMessage = read_data(OP_DETAIL, response).await?;

        Ok(message.into_email())
    }

    /// 发送邮件
    ///
    /// 只有 HTTP 状态码和响应体中的 `status.code` 都为 200 才算成功
    pub async fn send_email(&self, email: &OutgoingEmail) -> MailResult<()> {
        let missing: Vec<&str> = [
            ("toAddress", &email.to),
            ("subject", &email.subject),
            ("content", &email.content),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(MailError::InvalidInput(format!(
                "缺少必填字段: {}",
                missing.join(", ")
            )));
        }

        let access_token = self.tokens.get_valid_access_token().await?;
        let account = self.resolve_account(&access_token).await?;

        let url = self.endpoint(&["accounts", &account.account_id, "messages"])?;
        let payload = SendPayload {
            from_address: &account.primary_email_address,
            to_address: &email.to,
            subject: &email.subject,
            content: &email.content,
            ask_receipt: "no",
        };

        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, auth_header(&access_token))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let json: Option<Value> = serde_json::from_str(&body).ok();
        let embedded_code = json
            .as_ref()
            .and_then(|v| v.pointer("/status/code"))
            .and_then(Value::as_i64);

        if status != StatusCode::OK || embedded_code != Some(200) {
            tracing::error!(
                "❌ 发送邮件失败 (HTTP {}, status.code {:?}): {}",
                status,
                embedded_code,
                body
            );
            return Err(MailError::UpstreamRequestFailed {
                operation: OP_SEND,
                message: json
                    .as_ref()
                    .and_then(provider_message)
                    .unwrap_or_else(|| generic_message(status)),
            });
        }

        tracing::info!("✉️ 邮件已发送至 {}", email.to);
        Ok(())
    }

    /// 未读邮件数量（基于当前列表）
    pub async fn unread_count(&self) -> MailResult<usize> {
        let emails = self.list_emails().await?;
        Ok(emails.iter().filter(|e| !e.is_read).count())
    }

    /// 获取账户信息：优先使用缓存，否则取 `/accounts` 的第一个账户
    async fn resolve_account(&self, access_token: &str) -> MailResult<AccountInfo> {
        if let Some(account) = self.tokens.account()? {
            return Ok(account);
        }

        tracing::debug!("账户信息未缓存，正在查询 Zoho 账户...");

        let url = self.endpoint(&["accounts"])?;
        let response = self.get(url, access_token).await?;
        let accounts: Vec<Value> = read_data(OP_ACCOUNT, response).await?;

        let account = accounts
            .first()
            .and_then(account_from_value)
            .ok_or_else(|| MailError::UpstreamRequestFailed {
                operation: OP_ACCOUNT,
                message: "响应中没有 accountId".into(),
            })?;

        self.tokens.cache_account(account.clone())?;
        Ok(account)
    }

    fn endpoint(&self, segments: &[&str]) -> MailResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| MailError::Config(format!("API 地址无效 {}: {}", self.api_base, e)))?;

        url.path_segments_mut()
            .map_err(|_| MailError::Config(format!("API 地址无效: {}", self.api_base)))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    async fn get(&self, url: Url, access_token: &str) -> MailResult<Response> {
        Ok(self
            .http
            .get(url)
            .header(AUTHORIZATION, auth_header(access_token))
            .send()
            .await?)
    }
}

fn auth_header(access_token: &str) -> String {
    format!("Zoho-oauthtoken {}", access_token)
}

/// 读取 `{ data: ... }`；非 2xx 时转换为 `UpstreamRequestFailed`
async fn read_data<T: DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> MailResult<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .as_ref()
            .and_then(provider_message)
            .unwrap_or_else(|| generic_message(status));

        tracing::warn!("⚠️ {}失败 (HTTP {}): {}", operation, status, message);
        return Err(MailError::UpstreamRequestFailed { operation, message });
    }

    let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
        tracing::error!("解析{}响应失败: {}", operation, e);
        MailError::UpstreamRequestFailed {
            operation,
            message: format!("响应格式错误: {}", e),
        }
    })?;

    if let Some(code) = envelope.status.as_ref().and_then(|s| s.code) {
        tracing::debug!("{} status.code = {}", operation, code);
    }

    envelope.data.ok_or_else(|| MailError::UpstreamRequestFailed {
        operation,
        message: "响应中缺少 data 字段".into(),
    })
}

/// 服务端嵌入的错误信息：`data.message` → `status.description` → `error`
fn provider_message(json: &Value) -> Option<String> {
    ["/data/message", "/status/description", "/error"]
        .iter()
        .find_map(|pointer| json.pointer(pointer).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn generic_message(status: StatusCode) -> String {
    format!("Zoho 未返回错误详情（HTTP {}）", status.as_u16())
}

fn account_from_value(value: &Value) -> Option<AccountInfo> {
    let account_id = match value.get("accountId")? {
        Value::String(id) if !id.is_empty() => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };

    let primary_email_address = value
        .get("primaryEmailAddress")
        .or_else(|| value.get("mailboxAddress"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(AccountInfo {
        account_id,
        primary_email_address,
    })
}
