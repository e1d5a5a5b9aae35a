use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// プロバイダ参照として許可する形式
static PROVIDER_REF_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,128}$").expect("不正な正規表現"));

/// 決済台帳のエントリ
///
/// 作成後は変更・削除されない（追記専用）。
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub uid: String,
    pub subscription_id: i64,
    pub amount: f64,
    pub currency: String,
    pub provider_ref: String, // プロバイダ側の決済参照（一意）
    pub paid_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// 決済記録用DTO（プロバイダの確認ペイロード）
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPaymentDto {
    pub subscription_id: i64,
    pub amount: f64,
    pub currency: Option<String>,
    pub provider_ref: String,
    /// プロバイダ側の決済成立日時（省略時は受信時刻）
    pub paid_at: Option<DateTime<Utc>>,
}

/// プロバイダ参照の形式を検証する
///
/// # 引数
/// * `value` - 検証する参照文字列
///
/// # 戻り値
/// 成功時はOk(())、不正な形式の場合はバリデーションエラー
pub fn validate_provider_ref(value: &str) -> AppResult<()> {
    if PROVIDER_REF_PATTERN.is_match(value) {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "プロバイダ参照の形式が不正です: {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_provider_ref() {
        assert!(validate_provider_ref("pi_3MtwBwLkdIwHu7ix28a3tqPa").is_ok());
        assert!(validate_provider_ref("ch-001_A").is_ok());

        // 空文字・記号・長すぎる参照は拒否
        assert!(validate_provider_ref("").is_err());
        assert!(validate_provider_ref("pi 123").is_err());
        assert!(validate_provider_ref("pi@123").is_err());
        assert!(validate_provider_ref(&"a".repeat(129)).is_err());
    }
}
