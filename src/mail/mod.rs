/// 邮件服务模块
pub mod zoho;
