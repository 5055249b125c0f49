/// 收件箱轮询引擎
///
/// 定期拉取收件箱并通过回调报告未读数；会话失效时自动停止
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::MailResult;
use crate::mail::zoho::types::{AccountInfo, EmailListItem};
use crate::mail::zoho::ZohoMailClient;

/// 默认轮询间隔（5 分钟）
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// 一次轮询的结果
#[derive(Debug, Clone, PartialEq)]
pub struct InboxSnapshot {
    pub account: Option<AccountInfo>,
    pub total: usize,
    pub unread: usize,
    /// 最新的一封邮件
    pub newest: Option<EmailListItem>,
}

impl InboxSnapshot {
    fn from_listing(account: Option<AccountInfo>, emails: Vec<EmailListItem>) -> Self {
        Self {
            account,
            total: emails.len(),
            unread: emails.iter().filter(|e| !e.is_read).count(),
            newest: emails.into_iter().next(),
        }
    }
}

/// 同步引擎
pub struct SyncEngine {
    client: ZohoMailClient,

    interval: Duration,

    /// 是否正在运行
    running: Arc<RwLock<bool>>,
}

impl SyncEngine {
    /// 创建新的同步引擎
    ///
    /// # Arguments
    /// * `client` - Zoho Mail 客户端（与其他调用方共享同一个会话）
    /// * `interval` - 轮询间隔
    pub fn new(client: ZohoMailClient, interval: Duration) -> Self {
        Self {
            client,
            interval: interval.max(Duration::from_millis(10)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 启动同步引擎
    ///
    /// 已在运行时返回 `None`。首次同步立即执行；回调返回
    /// `NotAuthenticated` / `RefreshFailed` 后引擎自行停止
    pub async fn start<F>(&self, sync_callback: F) -> Option<JoinHandle<()>>
    where
        F: Fn(MailResult<InboxSnapshot>) + Send + 'static,
    {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("同步引擎已在运行");
                return None;
            }
            *running = true;
        }

        tracing::info!("🚀 启动同步引擎（间隔: {:?}）", self.interval);

        let running = self.running.clone();
        let client = self.client.clone();
        let period = self.interval;

        Some(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                if !*running.read().await {
                    tracing::info!("同步循环检测到停止标志，退出任务");
                    break;
                }

                tracing::debug!("⏰ 开始定期同步...");

                let result = sync_inbox(&client).await;
                let needs_reauth = matches!(&result, Err(e) if e.needs_reauth());

                match &result {
                    Ok(snapshot) => {
                        tracing::info!("✅ 收件箱 {} 封，未读 {} 封", snapshot.total, snapshot.unread)
                    }
                    Err(e) => tracing::error!("❌ 同步失败: {}", e),
                }

                sync_callback(result);

                if needs_reauth {
                    tracing::warn!("⚠️ 会话已失效，停止同步引擎");
                    *running.write().await = false;
                    break;
                }
            }
        }))
    }

    /// 立即执行一次同步
    pub async fn sync_now(&self) -> MailResult<InboxSnapshot> {
        tracing::info!("🔄 立即同步收件箱...");
        sync_inbox(&self.client).await
    }

    /// 停止同步引擎（循环在下一次计时器触发时退出）
    pub async fn stop(&self) {
        *self.running.write().await = false;
        tracing::info!("🛑 同步引擎已停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn sync_inbox(client: &ZohoMailClient) -> MailResult<InboxSnapshot> {
    let emails = client.list_emails().await?;
    let account = client.tokens().account()?;
    Ok(InboxSnapshot::from_listing(account, emails))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::storage::{MemorySessionStore, SessionStore};
    use crate::error::MailError;
    use crate::mail::zoho::types::{SessionRecord, TokenState};
    use crate::mail::zoho::{RefreshEndpoint, TokenManager};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer, record: SessionRecord) -> (SyncEngine, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::with_record(record));
        let tokens = TokenManager::new(
            store.clone(),
            RefreshEndpoint::Direct {
                token_url: format!("{}/oauth/v2/token", server.uri()),
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
        );
        let client = ZohoMailClient::new(tokens, format!("{}/api", server.uri()));
        (SyncEngine::new(client, Duration::from_millis(50)), store)
    }

    fn signed_in(expires_in_mins: i64) -> SessionRecord {
        SessionRecord {
            tokens: Some(TokenState {
                access_token: "T1".into(),
                refresh_token: "R1".into(),
                expires_at: Utc::now() + ChronoDuration::minutes(expires_in_mins),
            }),
            account: Some(AccountInfo {
                account_id: "7".into(),
                primary_email_address: "contabil@example.gov".into(),
            }),
        }
    }

    async fn mount_inbox(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/accounts/7/messages/view"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": { "code": 200 },
                "data": [
                    { "messageId": "3", "fromAddress": "a@example.gov", "subject": "Empenho", "receivedTime": "1760000300000", "isRead": false },
                    { "messageId": "2", "fromAddress": "b@example.gov", "subject": "Liquidação", "receivedTime": "1760000200000", "isRead": false },
                    { "messageId": "1", "fromAddress": "c@example.gov", "subject": "Pagamento", "receivedTime": "1760000100000", "isRead": true }
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sync_now_snapshot() {
        let server = MockServer::start().await;
        mount_inbox(&server).await;
        let (engine, _) = engine(&server, signed_in(30));

        let snapshot = engine.sync_now().await.unwrap();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.unread, 2);
        assert_eq!(snapshot.newest.map(|e| e.message_id), Some("3".to_string()));
        assert_eq!(
            snapshot.account.map(|a| a.primary_email_address),
            Some("contabil@example.gov".to_string())
        );
    }

    #[tokio::test]
    async fn test_periodic_sync_reports_and_stops() {
        let server = MockServer::start().await;
        mount_inbox(&server).await;
        let (engine, _) = engine(&server, signed_in(30));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = engine
            .start(move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        assert!(engine.is_running().await);
        assert!(engine.start(|_| {}).await.is_none());

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.unread, 2);
        assert_eq!(first, second);

        engine.stop().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn test_stops_itself_when_not_authenticated() {
        let server = MockServer::start().await;
        let (engine, _) = engine(&server, SessionRecord::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = engine
            .start(move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), Err(MailError::NotAuthenticated));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!engine.is_running().await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_itself_when_refresh_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_code" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (engine, store) = engine(&server, signed_in(-1));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = engine
            .start(move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Err(MailError::RefreshFailed(message)) => assert!(message.contains("invalid_code")),
            other => panic!("unexpected result: {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let (engine, store) = engine(&server, signed_in(30));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = engine
            .start(move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        for _ in 0..2 {
            let result = rx.recv().await.unwrap();
            assert!(matches!(result, Err(MailError::UpstreamRequestFailed { .. })));
        }
        assert!(engine.is_running().await);
        assert!(store.load().unwrap().tokens.is_some());

        engine.stop().await;
        handle.abort();
    }
}
