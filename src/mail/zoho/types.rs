/// Zoho Mail 会话与邮件数据结构
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Token 安全边际（秒）
///
/// 在签发时从服务端返回的有效期中扣除，过期判断时不再额外提前
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// OAuth2 Token 状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    /// 访问令牌
    pub access_token: String,

    /// 刷新令牌（可能为空：隐式流程首次连接时不一定返回）
    pub refresh_token: String,

    /// 不可再使用 access_token 的时间点（已扣除安全边际）
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// 根据服务端返回的有效期创建 Token 状态
    ///
    /// `expires_at = issued_at + (expires_in - 300s)`；有效期超出时间范围时返回 `None`
    pub fn issue(
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
        issued_at: DateTime<Utc>,
    ) -> Option<Self> {
        Some(Self {
            access_token,
            refresh_token,
            expires_at: expires_at_for(expires_in_secs, issued_at)?,
        })
    }

    /// Token 是否已过期（`now >= expires_at`）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// 计算带安全边际的过期时间点
///
/// `expires_in` 来自服务端或回调，溢出时返回 `None`
pub fn expires_at_for(expires_in_secs: i64, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lifetime = expires_in_secs.checked_sub(EXPIRY_MARGIN_SECS)?;
    issued_at.checked_add_signed(Duration::try_seconds(lifetime)?)
}

/// Zoho 账户信息（首次解析后缓存）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "accountId")]
    pub account_id: String,

    #[serde(rename = "primaryEmailAddress", default)]
    pub primary_email_address: String,
}

/// 持久化的会话记录（整体替换，不做单字段修改）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub tokens: Option<TokenState>,
    pub account: Option<AccountInfo>,
}

impl SessionRecord {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.account.is_none()
    }
}

/// 授权流程的产出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// 邮件地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    pub email_address: String,
    #[serde(default)]
    pub name: String,
}

/// 收件箱列表项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailListItem {
    pub message_id: String,
    pub from: String,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub summary: String,
    pub received_time: DateTime<Utc>,
    pub is_read: bool,
}

/// 邮件详情
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    #[serde(flatten)]
    pub header: EmailListItem,
    pub content: String,
    pub attachments: Vec<serde_json::Value>,
}

/// 待发送的邮件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub content: String,
}

pub(crate) const NO_SUBJECT: &str = "(无主题)";
pub(crate) const NO_CONTENT: &str = "此邮件没有可显示的内容。";

/// Zoho API 返回的原始邮件
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMessage {
    pub message_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub to_address: RawRecipients,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub received_time: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

/// 收件人字段：列表或逗号分隔的字符串（`"&lt;a@x.com&gt;,b@y.com"`）
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawRecipients {
    List(Vec<RawRecipient>),
    Text(String),
}

impl Default for RawRecipients {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl RawRecipients {
    fn into_addresses(self) -> Vec<EmailAddress> {
        match self {
            Self::List(list) => list
                .into_iter()
                .map(|t| EmailAddress {
                    email_address: t.address,
                    name: t.name,
                })
                .collect(),
            Self::Text(text) => text
                .replace("&lt;", "<")
                .replace("&gt;", ">")
                .split(',')
                .map(|part| part.trim().trim_start_matches('<').trim_end_matches('>'))
                .filter(|addr| !addr.is_empty())
                .map(|addr| EmailAddress {
                    email_address: addr.to_string(),
                    name: String::new(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawRecipient {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
}

impl RawMessage {
    pub fn into_list_item(self) -> EmailListItem {
        self.split().0
    }

    pub fn into_email(self) -> Email {
        let (header, content, attachments) = self.split();
        Email {
            header,
            content: content
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| NO_CONTENT.to_string()),
            attachments,
        }
    }

    fn split(self) -> (EmailListItem, Option<String>, Vec<serde_json::Value>) {
        let received_time = self
            .received_time
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_default();

        let header = EmailListItem {
            message_id: self.message_id,
            from: self.from.or(self.from_address).unwrap_or_default(),
            to: self.to_address.into_addresses(),
            subject: self
                .subject
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
            summary: self.summary.unwrap_or_default(),
            received_time,
            is_read: self.is_read,
        };

        (header, self.content, self.attachments)
    }
}

/// Zoho API 通用响应外壳：`{ "status": {...}, "data": ... }`
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub status: Option<ApiStatus>,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiStatus {
    pub code: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 发送邮件请求体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendPayload<'a> {
    pub from_address: &'a str,
    pub to_address: &'a str,
    pub subject: &'a str,
    pub content: &'a str,
    pub ask_receipt: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_subtracts_margin() {
        let now = Utc::now();
        let state = TokenState::issue("a".into(), "r".into(), 3600, now).unwrap();
        assert_eq!(state.expires_at, now + Duration::seconds(3300));
        assert_eq!(
            state.expires_at.timestamp_millis() - now.timestamp_millis(),
            3_300_000
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let state = TokenState {
            access_token: "a".into(),
            refresh_token: String::new(),
            expires_at: now,
        };
        assert!(state.is_expired_at(now));
        assert!(!state.is_expired_at(now - Duration::milliseconds(1)));
        assert!(!state.has_refresh_token());
    }

    #[test]
    fn test_margin_applied_at_issuance_only() {
        // 服务端声明还剩 4 分钟：签发时扣除边际后已经过期
        let issued = Utc::now();
        let state = TokenState::issue("a".into(), "r".into(), 240, issued).unwrap();
        assert!(state.is_expired_at(issued));
    }

    #[test]
    fn test_out_of_range_lifetime_is_rejected() {
        let now = Utc::now();
        assert_eq!(expires_at_for(9_000_000_000_000_000, now), None);
        assert_eq!(expires_at_for(i64::MAX, now), None);
        assert_eq!(expires_at_for(i64::MIN, now), None);
        assert!(TokenState::issue("a".into(), "r".into(), 99_999_999_999_999, now).is_none());

        // 负数有效期仍然合法：立即过期
        let state = TokenState::issue("a".into(), "r".into(), -10, now).unwrap();
        assert!(state.is_expired_at(now));
    }

    #[test]
    fn test_raw_message_defaults() {
        let raw: RawMessage = serde_json::from_value(json!({
            "messageId": "177",
            "fromAddress": "prefeitura@example.gov",
            "toAddress": [{ "address": "tesouraria@example.gov", "name": "Tesouraria" }],
            "subject": "",
            "receivedTime": "1700000000000",
        }))
        .unwrap();

        let email = raw.into_email();
        assert_eq!(email.header.subject, NO_SUBJECT);
        assert_eq!(email.header.from, "prefeitura@example.gov");
        assert_eq!(email.header.to[0].email_address, "tesouraria@example.gov");
        assert_eq!(email.header.received_time.timestamp_millis(), 1_700_000_000_000);
        assert!(!email.header.is_read);
        assert_eq!(email.content, NO_CONTENT);
    }

    #[test]
    fn test_recipients_as_text() {
        let raw: RawMessage = serde_json::from_value(json!({
            "messageId": "178",
            "toAddress": "&lt;contabilidade@example.gov&gt;, juridico@example.gov",
        }))
        .unwrap();

        let item = raw.into_list_item();
        let addresses: Vec<_> = item.to.iter().map(|a| a.email_address.as_str()).collect();
        assert_eq!(addresses, ["contabilidade@example.gov", "juridico@example.gov"]);
        assert_eq!(item.received_time.timestamp_millis(), 0);
    }

    #[test]
    fn test_account_info_json_names() {
        let info = AccountInfo {
            account_id: "4000".into(),
            primary_email_address: "me@example.com".into(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value, json!({ "accountId": "4000", "primaryEmailAddress": "me@example.com" }));
    }
}
