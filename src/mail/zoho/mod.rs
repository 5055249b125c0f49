/// Zoho 模块 - OAuth2 认证、Token 生命周期与 Mail API 调用
pub mod api;
pub mod oauth;
pub mod token;
pub mod types;

// 重新导出常用类型
pub use api::ZohoMailClient;
pub use oauth::{AuthorizationFlow, AuthorizationRequest, CallbackParams, CodeFlow, ImplicitFlow};
pub use token::{RefreshEndpoint, TokenManager};
pub use types::{
    AccountInfo, Email, EmailAddress, EmailListItem, OutgoingEmail, SessionRecord, TokenGrant,
    TokenState,
};
