use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 課金間隔
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Month,
    Semester,
    Year,
}

impl Interval {
    /// データベース格納用の文字列表現を取得する
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Month => "month",
            Interval::Semester => "semester",
            Interval::Year => "year",
        }
    }

    /// 文字列から課金間隔を解析する
    ///
    /// # 引数
    /// * `value` - "month" / "semester" / "year" のいずれか
    ///
    /// # 戻り値
    /// 課金間隔、または不正な値の場合はバリデーションエラー
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "month" => Ok(Interval::Month),
            "semester" => Ok(Interval::Semester),
            "year" => Ok(Interval::Year),
            other => Err(AppError::validation(format!(
                "課金間隔は month / semester / year のいずれかです: {other}"
            ))),
        }
    }

    /// 1課金期間の日数を取得する
    pub fn days(self) -> i64 {
        match self {
            Interval::Month => 30,
            Interval::Semester => 180,
            Interval::Year => 365,
        }
    }
}

/// プランの機能フラグ（表示順つき）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFeature {
    pub position: i64,
    pub name: String,
    pub description: Option<String>,
}

/// プランの価格（課金間隔ごと）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPricing {
    pub interval: Interval,
    pub price: f64,
    pub currency: String,
}

/// サブスクリプションプランのデータモデル
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub pos_limit: i64,          // 契約あたりのPOS数上限
    pub is_free_trial: bool,     // 無料トライアルプランかどうか
    pub trial_days: i64,         // トライアル期間（日数）
    pub features: Vec<PlanFeature>,
    pub pricings: Vec<PlanPricing>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// 指定した課金間隔の価格を取得する
    ///
    /// # 引数
    /// * `interval` - 課金間隔
    ///
    /// # 戻り値
    /// 価格、または価格が未定義の場合はNone
    pub fn pricing_for(&self, interval: Interval) -> Option<&PlanPricing> {
        self.pricings.iter().find(|p| p.interval == interval)
    }
}

/// プラン作成用DTO（管理操作・初期投入用）
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanDto {
    pub name: String,
    pub description: Option<String>,
    pub pos_limit: i64,
    pub is_free_trial: bool,
    pub trial_days: i64,
    pub features: Vec<CreatePlanFeatureDto>,
    pub pricings: Vec<CreatePlanPricingDto>,
}

/// プラン機能の作成用DTO
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanFeatureDto {
    pub name: String,
    pub description: Option<String>,
}

/// プラン価格の作成用DTO
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanPricingDto {
    pub interval: Interval,
    pub price: f64,
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for Interval {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[Interval::Month, Interval::Semester, Interval::Year])
                .unwrap()
        }
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!(Interval::parse("month").unwrap(), Interval::Month);
        assert_eq!(Interval::parse("semester").unwrap(), Interval::Semester);
        assert_eq!(Interval::parse("year").unwrap(), Interval::Year);

        // 不正な値はバリデーションエラー
        assert!(Interval::parse("weekly").is_err());
        assert!(Interval::parse("").is_err());
    }

    #[test]
    fn test_interval_days() {
        assert_eq!(Interval::Month.days(), 30);
        assert_eq!(Interval::Semester.days(), 180);
        assert_eq!(Interval::Year.days(), 365);
    }

    #[quickcheck]
    fn prop_interval_roundtrip(interval: Interval) -> bool {
        // as_str と parse が往復することをテスト
        Interval::parse(interval.as_str()).unwrap() == interval
    }

    #[quickcheck]
    fn prop_interval_days_positive(interval: Interval) -> bool {
        interval.days() > 0
    }

    #[test]
    fn test_pricing_for() {
        let plan = Plan {
            id: 1,
            uid: "u".to_string(),
            name: "Starter".to_string(),
            description: None,
            active: true,
            pos_limit: 1,
            is_free_trial: false,
            trial_days: 30,
            features: vec![],
            pricings: vec![PlanPricing {
                interval: Interval::Month,
                price: 19.90,
                currency: "eur".to_string(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(plan.pricing_for(Interval::Month).is_some());
        assert!(plan.pricing_for(Interval::Year).is_none());
    }
}
