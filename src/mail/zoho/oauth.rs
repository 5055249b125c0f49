/// Zoho OAuth2 授权流程
///
/// 两种可插拔的策略：
/// - 隐式流程：Token 直接出现在重定向地址的 fragment 中
/// - 授权码流程（带 PKCE）：本地回调服务器接收 code 后在后台交换 Token
use async_trait::async_trait;
use chrono::Utc;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RequestTokenError, Scope, TokenResponse, TokenUrl,
    basic::BasicClient,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiny_http::{Header, Response, Server, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::oauth_config::OAuthConfig;
use crate::error::{MailError, MailResult};
use crate::mail::zoho::types::{TokenGrant, expires_at_for};

/// OAuth2 回调超时时间（秒）
const CALLBACK_TIMEOUT_SECS: u64 = 120;

/// 本地服务器端口范围
const PORT_RANGE: std::ops::Range<u16> = 8080..8090;

/// 服务端没有返回 expires_in 时使用的有效期
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// 回调中没有 error 参数时的通用错误
const GENERIC_CALLBACK_ERROR: &str = "Zoho 授权失败";

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>授权成功 - Infoco Mail</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 80px;">
    <h1 style="color: #2e7d32;">✓ 授权成功</h1>
    <p>您的 Zoho Mail 账户已成功连接，现在可以关闭此页面。</p>
</body>
</html>"#;

const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>授权失败 - Infoco Mail</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 80px;">
    <h1 style="color: #c62828;">✗ 授权失败</h1>
    <p>Zoho Mail 账户连接失败，请返回应用后重试。</p>
</body>
</html>"#;

/// 重定向回调中携带的参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams(HashMap<String, String>);

impl CallbackParams {
    /// 解析回调参数
    ///
    /// 接受完整的重定向 URL、`#fragment`、`?query` 或裸的 `k=v&k=v`。
    /// URL 同时有 query 和 fragment 时，fragment 中的同名参数优先
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let mut params = HashMap::new();

        if let Ok(url) = Url::parse(input) {
            params.extend(url.query_pairs().into_owned());
            if let Some(fragment) = url.fragment() {
                params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
            }
        } else {
            // 相对路径（`/?code=...`）、`#fragment` 或裸参数
            let (head, fragment) = match input.split_once('#') {
                Some((head, fragment)) => (head, Some(fragment)),
                None => (input, None),
            };
            let query = head.split_once('?').map_or(head, |(_, query)| query);

            for raw in std::iter::once(query).chain(fragment) {
                params.extend(url::form_urlencoded::parse(raw.as_bytes()).into_owned());
            }
        }

        Self(params)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// 取参数值（空字符串视为不存在）
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// 回调是否携带了授权结果（而不是无关请求，例如 favicon）
    fn is_authorization_response(&self) -> bool {
        ["code", "error", "access_token"]
            .iter()
            .any(|key| self.get(key).is_some())
    }

    fn error_or_generic(&self) -> MailError {
        MailError::CallbackError(self.get("error").unwrap_or(GENERIC_CALLBACK_ERROR).to_string())
    }
}

/// 一次授权请求
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// 需要在浏览器中打开的授权地址
    pub url: Url,

    /// 回调时需要校验的 CSRF state（隐式流程为空）
    pub csrf_state: Option<String>,

    pkce_verifier: Option<String>,
}

/// 授权流程抽象
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    fn name(&self) -> &'static str;

    /// 生成授权地址
    fn authorization_request(&self) -> MailResult<AuthorizationRequest>;

    /// 处理重定向回调，得到 Token
    async fn complete(
        &self,
        request: &AuthorizationRequest,
        params: &CallbackParams,
    ) -> MailResult<TokenGrant>;
}

/// 隐式流程（`response_type=token`）
#[derive(Debug, Clone)]
pub struct ImplicitFlow {
    config: OAuthConfig,
}

impl ImplicitFlow {
    pub fn new(config: OAuthConfig) -> Self {
        Self { config }
    }

    /// 从 fragment 参数中取出 Token
    ///
    /// 需要同时有 `access_token` 和整数 `expires_in`，否则返回服务端的错误码
    pub fn grant_from_params(params: &CallbackParams) -> MailResult<TokenGrant> {
        let access_token = params.get("access_token");
        let expires_in = params
            .get("expires_in")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|secs| expires_at_for(*secs, Utc::now()).is_some());

        match (access_token, expires_in) {
            (Some(access_token), Some(expires_in)) => Ok(TokenGrant {
                access_token: access_token.to_string(),
                refresh_token: params.get("refresh_token").map(str::to_string),
                expires_in,
            }),
            _ => {
                let err = params.error_or_generic();
                tracing::error!("授权回调中没有 Token: {}", err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl AuthorizationFlow for ImplicitFlow {
    fn name(&self) -> &'static str {
        "implicit"
    }

    fn authorization_request(&self) -> MailResult<AuthorizationRequest> {
        self.config.check_credentials()?;

        let url = Url::parse_with_params(
            &self.config.auth_url(),
            &[
                ("scope", self.config.scope_string().as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "token"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("access_type", "offline"),
            ],
        )
        .map_err(|e| MailError::Config(format!("授权地址无效: {}", e)))?;

        Ok(AuthorizationRequest {
            url,
            csrf_state: None,
            pkce_verifier: None,
        })
    }

    async fn complete(
        &self,
        _request: &AuthorizationRequest,
        params: &CallbackParams,
    ) -> MailResult<TokenGrant> {
        Self::grant_from_params(params)
    }
}

/// 授权码流程（带 PKCE）
#[derive(Debug, Clone)]
pub struct CodeFlow {
    config: OAuthConfig,
    redirect_uri: String,
}

impl CodeFlow {
    pub fn new(config: OAuthConfig) -> Self {
        let redirect_uri = config.redirect_uri.clone();
        Self {
            config,
            redirect_uri,
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    fn client(&self) -> MailResult<BasicClient> {
        let invalid = |e: url::ParseError| MailError::Config(format!("OAuth2 地址无效: {}", e));

        Ok(BasicClient::new(
            ClientId::new(self.config.client_id.clone()),
            Some(ClientSecret::new(self.config.client_secret.clone())),
            AuthUrl::new(self.config.auth_url()).map_err(invalid)?,
            Some(TokenUrl::new(self.config.token_url()).map_err(invalid)?),
        )
        .set_redirect_uri(RedirectUrl::new(self.redirect_uri.clone()).map_err(invalid)?))
    }

    /// 执行完整的交互式授权
    ///
    /// 1. 启动本地回调服务器
    /// 2. 生成授权 URL 并打开浏览器
    /// 3. 等待回调（带超时）
    /// 4. 验证 CSRF state 并交换 Token
    ///
    /// # Errors
    /// - 凭据缺失
    /// - 端口全部被占用
    /// - 用户拒绝授权或超时
    /// - Token 交换失败
    pub async fn authenticate(&self) -> MailResult<TokenGrant> {
        tracing::info!("🔐 开始 Zoho OAuth2 授权码流程");
        self.config.check_credentials()?;

        let (server, port) = bind_local_server()?;
        let flow = self
            .clone()
            .with_redirect_uri(format!("http://localhost:{}", port));
        let request = flow.authorization_request()?;
        tracing::info!("✅ 本地服务器启动成功: http://localhost:{}", port);

        let (handle, params_rx) = spawn_callback_listener(Arc::clone(&server));

        if let Err(e) = webbrowser::open(request.url.as_str()) {
            tracing::warn!("无法打开浏览器（{}），请手动访问: {}", e, request.url);
        } else {
            tracing::info!("✅ 浏览器已打开，等待用户授权...");
        }

        let received =
            tokio::time::timeout(Duration::from_secs(CALLBACK_TIMEOUT_SECS), params_rx).await;

        let params = match received {
            Ok(Ok(params)) => params,
            Ok(Err(_)) => {
                return Err(MailError::CallbackError("本地服务器接收回调失败".into()));
            }
            Err(_) => {
                server.unblock();
                return Err(MailError::CallbackError(
                    "授权超时：用户未在规定时间内完成授权".into(),
                ));
            }
        };

        if handle.await.is_err() {
            tracing::warn!("本地回调服务器线程异常退出");
        }

        tracing::info!("✅ 收到授权回调");
        flow.complete(&request, &params).await
    }
}

#[async_trait]
impl AuthorizationFlow for CodeFlow {
    fn name(&self) -> &'static str {
        "code"
    }

    fn authorization_request(&self) -> MailResult<AuthorizationRequest> {
        self.config.check_credentials()?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (url, csrf_state) = self
            .client()?
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(self.config.scope_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        Ok(AuthorizationRequest {
            url,
            csrf_state: Some(csrf_state.secret().clone()),
            pkce_verifier: Some(pkce_verifier.secret().clone()),
        })
    }

    async fn complete(
        &self,
        request: &AuthorizationRequest,
        params: &CallbackParams,
    ) -> MailResult<TokenGrant> {
        if params.get("error").is_some() {
            return Err(params.error_or_generic());
        }

        let code = params
            .get("code")
            .ok_or_else(|| MailError::CallbackError("回调缺少 code 参数".into()))?;

        if params.get("state") != request.csrf_state.as_deref() {
            return Err(MailError::CallbackError("CSRF 验证失败：state 不匹配".into()));
        }
        tracing::info!("✅ CSRF 验证通过");

        let client = self.client()?;
        let mut exchange = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(verifier) = &request.pkce_verifier {
            exchange = exchange.set_pkce_verifier(PkceCodeVerifier::new(verifier.clone()));
        }

        let token = exchange
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| {
                let detail = match &e {
                    RequestTokenError::ServerResponse(resp) => resp.to_string(),
                    RequestTokenError::Parse(_, body) => String::from_utf8_lossy(body).into_owned(),
                    other => other.to_string(),
                };
                tracing::error!("❌ Token 交换失败: {}", detail);
                MailError::CallbackError(format!("Token 交换失败: {}", detail))
            })?;

        let expires_in = token
            .expires_in()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        tracing::info!("✅ Token 交换成功（有效期: {} 秒）", expires_in);

        Ok(TokenGrant {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_in,
        })
    }
}

/// 在端口范围内找到第一个可用端口并启动服务器
fn bind_local_server() -> MailResult<(Arc<Server>, u16)> {
    let mut last_error = None;

    for port in PORT_RANGE {
        match Server::http(("127.0.0.1", port)) {
            Ok(server) => return Ok((Arc::new(server), port)),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(MailError::CallbackError(format!(
        "无法启动本地服务器（端口 {}..{} 均被占用）: {}",
        PORT_RANGE.start,
        PORT_RANGE.end,
        last_error.unwrap_or_default()
    )))
}

/// 在阻塞线程池中运行回调服务器，不占用异步工作线程
fn spawn_callback_listener(
    server: Arc<Server>,
) -> (JoinHandle<()>, oneshot::Receiver<CallbackParams>) {
    let (params_tx, params_rx) = oneshot::channel();
    let handle = tokio::task::spawn_blocking(move || serve_callback(&server, params_tx));
    (handle, params_rx)
}

/// 接收 OAuth2 回调，收到授权结果后返回
fn serve_callback(server: &Server, params_tx: oneshot::Sender<CallbackParams>) {
    for request in server.incoming_requests() {
        let params = CallbackParams::parse(request.url());

        if !params.is_authorization_response() {
            tracing::debug!("忽略无关请求: {}", request.url());
            request.respond(Response::empty(StatusCode(404))).ok();
            continue;
        }

        let html = if params.get("error").is_some() {
            tracing::error!("用户拒绝授权: {:?}", params.get("error"));
            ERROR_HTML
        } else {
            SUCCESS_HTML
        };

        let mut response = Response::from_string(html);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
            response = response.with_header(header);
        }
        request.respond(response).ok();

        params_tx.send(params).ok();
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> OAuthConfig {
        OAuthConfig {
            client_id: "1000.CLIENT".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://infoco.example.app".into(),
            ..OAuthConfig::default()
        }
    }

    #[test]
    fn test_port_range() {
        assert!(PORT_RANGE.contains(&8080));
        assert!(PORT_RANGE.contains(&8089));
        assert!(!PORT_RANGE.contains(&8090));
    }

    #[tokio::test]
    async fn test_callback_listener_receives_code() {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let (handle, params_rx) = spawn_callback_listener(Arc::clone(&server));

        let base = format!("http://127.0.0.1:{}", port);
        let favicon = reqwest::get(format!("{}/favicon.ico", base)).await.unwrap();
        assert_eq!(favicon.status(), 404);

        let page = reqwest::get(format!("{}/?code=1000.xyz&state=abc", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("授权成功"));

        let params = params_rx.await.unwrap();
        assert_eq!(params.get("code"), Some("1000.xyz"));
        assert_eq!(params.get("state"), Some("abc"));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_html_contains_charset() {
        assert!(SUCCESS_HTML.contains("utf-8"));
        assert!(ERROR_HTML.contains("utf-8"));
    }

    #[test]
    fn test_parse_fragment_forms() {
        let from_url = CallbackParams::parse(
            "https://infoco.example.app/#access_token=1000.abc&expires_in=3600&api_domain=x",
        );
        let from_fragment = CallbackParams::parse("#access_token=1000.abc&expires_in=3600");
        let bare = CallbackParams::parse("access_token=1000.abc&expires_in=3600");

        for params in [&from_url, &from_fragment, &bare] {
            assert_eq!(params.get("access_token"), Some("1000.abc"));
            assert_eq!(params.get("expires_in"), Some("3600"));
        }
    }

    #[test]
    fn test_fragment_overrides_query() {
        let params = CallbackParams::parse("http://localhost/?error=stale#access_token=T&error=");
        assert_eq!(params.get("access_token"), Some("T"));
        // 空值视为不存在
        assert_eq!(params.get("error"), None);
    }

    #[test]
    fn test_loopback_request_path_is_parsed() {
        let params = CallbackParams::parse("/?code=1000.xyz&state=abc&location=us");
        assert_eq!(params.get("code"), Some("1000.xyz"));
        assert!(params.is_authorization_response());
        assert!(!CallbackParams::parse("/favicon.ico").is_authorization_response());
    }

    #[test]
    fn test_implicit_grant() {
        let grant = ImplicitFlow::grant_from_params(&CallbackParams::from_pairs([
            ("access_token", "X"),
            ("refresh_token", "R"),
            ("expires_in", "3600"),
        ]))
        .unwrap();
        assert_eq!(grant.access_token, "X");
        assert_eq!(grant.refresh_token.as_deref(), Some("R"));
        assert_eq!(grant.expires_in, 3600);
    }

    #[test]
    fn test_implicit_grant_errors() {
        let denied = ImplicitFlow::grant_from_params(&CallbackParams::parse("error=access_denied"));
        assert_eq!(denied.unwrap_err(), MailError::CallbackError("access_denied".into()));

        let no_lifetime = ImplicitFlow::grant_from_params(&CallbackParams::parse("access_token=X"));
        assert_eq!(
            no_lifetime.unwrap_err(),
            MailError::CallbackError(GENERIC_CALLBACK_ERROR.into())
        );

        let bad_lifetime =
            ImplicitFlow::grant_from_params(&CallbackParams::parse("access_token=X&expires_in=soon"));
        assert!(bad_lifetime.is_err());

        let overflowing = ImplicitFlow::grant_from_params(&CallbackParams::parse(
            "access_token=X&expires_in=99999999999999",
        ));
        assert!(matches!(overflowing, Err(MailError::CallbackError(_))));
    }

    #[test]
    fn test_implicit_authorization_url() {
        let request = ImplicitFlow::new(config()).authorization_request().unwrap();
        let pairs: HashMap<String, String> = request.url.query_pairs().into_owned().collect();

        assert!(request.url.as_str().starts_with("https://accounts.zoho.com/oauth/v2/auth?"));
        assert_eq!(pairs["response_type"], "token");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["client_id"], "1000.CLIENT");
        assert_eq!(pairs["redirect_uri"], "https://infoco.example.app");
        assert_eq!(pairs["scope"], "ZohoMail.accounts.READ,ZohoMail.messages.ALL");
        assert!(request.csrf_state.is_none());
    }

    #[test]
    fn test_authorization_url_requires_credentials() {
        let err = ImplicitFlow::new(OAuthConfig::default())
            .authorization_request()
            .unwrap_err();
        assert!(matches!(err, MailError::Config(_)));
    }

    #[test]
    fn test_code_authorization_url() {
        let flow = CodeFlow::new(config()).with_redirect_uri("http://localhost:8081");
        let request = flow.authorization_request().unwrap();
        let pairs: HashMap<String, String> = request.url.query_pairs().into_owned().collect();

        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["redirect_uri"], "http://localhost:8081");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(Some(&pairs["state"]), request.csrf_state.as_ref());
    }

    #[tokio::test]
    async fn test_code_flow_rejects_state_mismatch() {
        let flow = CodeFlow::new(config());
        let request = flow.authorization_request().unwrap();
        let params = CallbackParams::from_pairs([("code", "1000.c"), ("state", "forged")]);

        let err = flow.complete(&request, &params).await.unwrap_err();
        assert!(err.to_string().contains("CSRF"));
    }

    #[tokio::test]
    async fn test_code_flow_exchanges_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "1000.access",
                "refresh_token": "1000.refresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let flow = CodeFlow::new(OAuthConfig {
            accounts_url: server.uri(),
            ..config()
        });
        let request = flow.authorization_request().unwrap();
        let params = CallbackParams::from_pairs([
            ("code", "1000.code".to_string()),
            ("state", request.csrf_state.clone().unwrap()),
        ]);

        let grant = flow.complete(&request, &params).await.unwrap();
        assert_eq!(grant.access_token, "1000.access");
        assert_eq!(grant.refresh_token.as_deref(), Some("1000.refresh"));
        assert_eq!(grant.expires_in, 3600);
    }

    #[tokio::test]
    async fn test_code_flow_surfaces_denial() {
        let flow = CodeFlow::new(config());
        let request = flow.authorization_request().unwrap();
        let params = CallbackParams::parse("error=access_denied");

        let err = flow.complete(&request, &params).await.unwrap_err();
        assert_eq!(err, MailError::CallbackError("access_denied".into()));
    }
}
