/// 机器指纹与加密密钥派生模块
///
/// 读取机器唯一标识（Windows 注册表 MachineGuid / Linux machine-id），
/// 使用 Argon2 派生 Token 加密密钥
use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHasher, SaltString},
};

/// 固定盐值（编译时确定，用于密钥派生的一致性）
///
/// 注意：这个盐值对所有用户相同，真正的唯一性来自机器标识
const FIXED_SALT: &[u8] = b"InfocoMail.v1.26";

/// 覆盖机器标识的环境变量（容器、CI 等没有稳定 machine-id 的环境）
pub const MACHINE_ID_ENV: &str = "INFOCO_MAIL_MACHINE_ID";

/// 从 Windows 注册表获取机器 GUID
///
/// 读取路径：`HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Cryptography\MachineGuid`
#[cfg(windows)]
fn read_platform_machine_id() -> Result<String> {
    use winreg::RegKey;
    use winreg::enums::HKEY_LOCAL_MACHINE;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let crypto_key = hklm
        .open_subkey("SOFTWARE\\Microsoft\\Cryptography")
        .context("无法打开注册表键：HKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Cryptography")?;

    let guid: String = crypto_key
        .get_value("MachineGuid")
        .context("无法读取 MachineGuid 值（可能需要管理员权限）")?;

    Ok(guid)
}

/// 从 systemd / dbus 的 machine-id 文件获取机器标识
#[cfg(not(windows))]
fn read_platform_machine_id() -> Result<String> {
    const CANDIDATES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

    for path in CANDIDATES {
        if let Ok(content) = std::fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }

    anyhow::bail!(
        "无法读取机器标识（{}），可通过环境变量 {} 指定",
        CANDIDATES.join(", "),
        MACHINE_ID_ENV
    )
}

/// 获取机器标识（环境变量优先）
pub fn get_machine_id() -> Result<String> {
    if let Ok(id) = std::env::var(MACHINE_ID_ENV) {
        if !id.trim().is_empty() {
            tracing::debug!("使用环境变量 {} 提供的机器标识", MACHINE_ID_ENV);
            return Ok(id.trim().to_string());
        }
    }

    let id = read_platform_machine_id()?;
    tracing::debug!("机器标识读取成功: {}", crate::utils::mask_secret(&id));
    Ok(id)
}

/// 从任意种子派生 256-bit 加密密钥
///
/// 相同种子总是得到相同的密钥（固定盐值）
pub fn derive_key_from(seed: &str) -> Result<[u8; 32]> {
    let salt =
        SaltString::encode_b64(FIXED_SALT).map_err(|e| anyhow::anyhow!("盐值编码失败: {}", e))?;

    let password_hash = Argon2::default()
        .hash_password(seed.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Argon2 哈希失败: {}", e))?;

    let hash_bytes = password_hash
        .hash
        .ok_or_else(|| anyhow::anyhow!("哈希值为空"))?;

    let hash_slice = hash_bytes.as_bytes();
    if hash_slice.len() < 32 {
        anyhow::bail!("哈希长度不足 32 字节（实际: {}）", hash_slice.len());
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&hash_slice[..32]);
    Ok(key)
}

/// 从机器标识派生 256-bit 加密密钥
///
/// # Errors
/// - 无法读取机器标识
/// - Argon2 哈希失败
pub fn derive_encryption_key() -> Result<[u8; 32]> {
    let id = get_machine_id()?;
    let key = derive_key_from(&id).context("派生加密密钥失败")?;
    tracing::debug!("加密密钥派生成功（256-bit）");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let key1 = derive_key_from("0123456789abcdef0123456789abcdef").unwrap();
        let key2 = derive_key_from("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_different_seeds_give_different_keys() {
        let key1 = derive_key_from("machine-a").unwrap();
        let key2 = derive_key_from("machine-b").unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_fixed_salt_consistency() {
        // 盐值变化会导致已保存的 Token 全部无法解密
        assert_eq!(FIXED_SALT, b"InfocoMail.v1.26");
        assert_eq!(FIXED_SALT.len(), 16);
    }
}
