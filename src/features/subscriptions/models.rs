use crate::features::plans::models::Interval;
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 契約のステータス
///
/// 遷移: pending → active → {cancelled, expired}
/// cancelled と expired は終端で、以降の遷移は許可されない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// データベース格納用の文字列表現を取得する
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// 文字列からステータスを解析する
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(AppError::Database(format!("不正な契約ステータスです: {other}"))),
        }
    }

    /// 終端状態（解約済み・期限切れ）かどうかを判定する
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }
}

/// 契約のデータモデル
///
/// 1企業（テナント）は同時に1件までの非終端契約を持つ。
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub uid: String,
    pub company_id: i64,
    pub plan_id: i64,
    pub interval: Interval,
    pub status: SubscriptionStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub renewal_date: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>, // 期限切れ通知の重複抑止用
    pub provider_ref: Option<String>,            // 決済プロバイダ側の契約参照
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 契約作成用DTO
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionDto {
    pub company_id: i64,
    pub plan_id: i64,
    pub interval: Interval,
}

/// プラン変更用DTO
#[derive(Debug, Clone, Deserialize)]
pub struct ChangePlanDto {
    pub plan_id: i64,
}

/// 期限切れスキャンの実行結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// スキャン対象となった契約数
    pub scanned: usize,
    /// 更新日接近の通知を発行した件数
    pub notified: usize,
    /// 期限切れへ遷移させた件数
    pub expired: usize,
}
