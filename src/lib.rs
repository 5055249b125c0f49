//! Zoho Mail 会话客户端
//!
//! 维护 Zoho OAuth2 会话（到期前刷新、失败即断开、并发刷新只发起一次），
//! 并在其上提供收件箱列表、邮件详情与发送功能。

pub mod config;
pub mod error;
pub mod mail;
pub mod sync;
pub mod utils;

pub use error::{MailError, MailResult};
pub use mail::zoho::{RefreshEndpoint, TokenManager, ZohoMailClient};
pub use sync::{InboxSnapshot, SyncEngine};
