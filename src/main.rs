use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use infoco_mail::config::{self, oauth_config::OAuthConfig, storage::FileSessionStore};
use infoco_mail::mail::zoho::{
    AuthorizationFlow, CallbackParams, CodeFlow, ImplicitFlow, OutgoingEmail, RefreshEndpoint,
    TokenManager, ZohoMailClient,
};
use infoco_mail::sync::{InboxSnapshot, SyncEngine};
use infoco_mail::MailResult;

#[derive(Parser)]
#[command(name = "infoco-mail", version, about = "Zoho Mail 会话客户端")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 打印隐式授权地址（在浏览器中打开，完成后用 `callback` 保存结果）
    AuthUrl,

    /// 交互式授权（授权码 + PKCE，本地回调服务器）
    Connect,

    /// 保存隐式授权回调（完整重定向地址或 `#access_token=...` 片段）
    Callback { input: String },

    /// 显示当前会话状态
    Status,

    /// 列出收件箱
    List,

    /// 显示一封邮件
    Show { message_id: String },

    /// 发送邮件
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        content: String,
    },

    /// 定期轮询收件箱（Ctrl+C 退出）
    Watch {
        /// 轮询间隔（秒），默认读取配置
        #[arg(long)]
        interval: Option<u64>,
    },

    /// 断开连接并清除本地会话
    Disconnect,
}

fn main() -> Result<()> {
    // 1. 初始化日志
    init_logger()?;

    let cli = Cli::parse();

    // 2. 创建 Tokio 运行时
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    // 3. 加载配置
    let app = config::load().context("加载应用配置失败")?.app;
    let oauth = OAuthConfig::load().context("加载 OAuth2 配置失败")?;

    // 4. 组装会话：文件存储 + 刷新端点
    let store = FileSessionStore::open_default().context("打开会话存储失败")?;
    tracing::debug!("会话文件: {}", store.path().display());

    let endpoint = RefreshEndpoint::from_config(&oauth, app.refresh_proxy_url.as_deref());
    let tokens = TokenManager::new(Arc::new(store), endpoint);
    let client =
        ZohoMailClient::new(tokens.clone(), &oauth.api_base_url).with_list_limit(app.list_limit);

    match command {
        Command::AuthUrl => {
            let flow = ImplicitFlow::new(oauth);
            let request = flow.authorization_request()?;
            tracing::debug!("授权方式: {}", flow.name());
            println!("{}", request.url);
        }

        Command::Connect => {
            let flow = CodeFlow::new(oauth);
            tracing::debug!("授权方式: {}", flow.name());
            let grant = flow.authenticate().await?;
            tokens.save_grant(grant)?;

            // 顺便解析并缓存账户信息
            let count = client.unread_count().await?;
            let email = tokens
                .account()?
                .map(|a| a.primary_email_address)
                .unwrap_or_default();
            println!("✅ 已连接 {}（未读 {} 封）", email, count);
        }

        Command::Callback { input } => {
            tokens.save_tokens_from_callback(&CallbackParams::parse(&input))?;
            println!("✅ Token 已保存");
        }

        Command::Status => print_status(&tokens)?,

        Command::List => {
            let emails = client.list_emails().await?;
            if emails.is_empty() {
                println!("📭 收件箱为空");
            }
            for email in emails {
                println!(
                    "{} {:<20} {} | {} | {}",
                    if email.is_read { " " } else { "●" },
                    email.message_id,
                    email.received_time.format("%Y-%m-%d %H:%M"),
                    email.from,
                    email.subject
                );
            }
        }

        Command::Show { message_id } => {
            let email = client.get_email(&message_id).await?;
            let to: Vec<&str> = email
                .header
                .to
                .iter()
                .map(|a| a.email_address.as_str())
                .collect();

            println!("发件人: {}", email.header.from);
            println!("收件人: {}", to.join(", "));
            println!("时间:   {}", email.header.received_time.to_rfc3339());
            println!("主题:   {}", email.header.subject);
            if !email.attachments.is_empty() {
                println!("附件:   {} 个", email.attachments.len());
            }
            println!();
            println!("{}", email.content);
        }

        Command::Send {
            to,
            subject,
            content,
        } => {
            client
                .send_email(&OutgoingEmail {
                    to,
                    subject,
                    content,
                })
                .await?;
            println!("✅ 邮件已发送");
        }

        Command::Watch { interval } => {
            let secs = interval.unwrap_or(app.poll_interval);
            watch(client, Duration::from_secs(secs)).await?;
        }

        Command::Disconnect => {
            tokens.disconnect()?;
            println!("👋 已断开 Zoho Mail 连接");
        }
    }

    Ok(())
}

fn print_status(tokens: &TokenManager) -> Result<()> {
    let record = tokens.session()?;

    let Some(state) = record.tokens else {
        println!("未连接（运行 `infoco-mail connect` 进行授权）");
        return Ok(());
    };

    println!("已连接");
    println!(
        "Access Token 过期时间: {}{}",
        state.expires_at.to_rfc3339(),
        if state.is_expired() { "（已过期，下次调用时刷新）" } else { "" }
    );
    if !state.has_refresh_token() {
        println!("⚠️ 没有 Refresh Token，过期后需要重新授权");
    }
    if let Some(account) = record.account {
        println!("账户: {} ({})", account.primary_email_address, account.account_id);
    }
    Ok(())
}

async fn watch(client: ZohoMailClient, interval: Duration) -> Result<()> {
    let engine = SyncEngine::new(client, interval);

    let report = |result: MailResult<InboxSnapshot>| match result {
        Ok(snapshot) => {
            let newest = snapshot
                .newest
                .map(|e| format!(" | 最新: {} - {}", e.from, e.subject))
                .unwrap_or_default();
            println!("📫 未读 {} / 共 {}{}", snapshot.unread, snapshot.total, newest);
        }
        Err(e) if e.needs_reauth() => eprintln!("❌ {}", e),
        Err(e) => eprintln!("⚠️ {}", e),
    };

    let Some(mut handle) = engine.start(report).await else {
        return Ok(());
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到 Ctrl+C，停止轮询");
            engine.stop().await;
            handle.abort();
        }
        joined = &mut handle => {
            joined.context("同步任务异常退出")?;
        }
    }

    Ok(())
}

fn init_logger() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infoco_mail=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
