use super::models::{CreatePlanDto, Interval, Plan, PlanFeature, PlanPricing};
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// プランカタログのリポジトリ
///
/// ストレージ実装を差し替えられるよう、エンティティごとの
/// リポジトリ能力をトレイトとして定義する。
pub trait PlanRepository: Send + Sync {
    /// アクティブなプランの一覧をID順で取得する
    fn find_all_active(&self) -> AppResult<Vec<Plan>>;

    /// IDでプランを取得する（非アクティブも含む）
    fn find_by_id(&self, id: i64) -> AppResult<Plan>;

    /// 名前でプランを検索する
    fn find_by_name(&self, name: &str) -> AppResult<Option<Plan>>;

    /// 無料トライアルプランを検索する
    fn find_free_trial(&self) -> AppResult<Option<Plan>>;

    /// プランを作成する（管理操作）
    fn create(&self, dto: &CreatePlanDto) -> AppResult<Plan>;

    /// プランをソフト無効化する（物理削除はしない）
    fn deactivate(&self, id: i64) -> AppResult<Plan>;
}

/// SQLiteによるプランリポジトリ実装
pub struct SqlitePlanRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePlanRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// データベース接続をロックする
    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::concurrency("データベースロックの取得に失敗しました"))
    }
}

impl PlanRepository for SqlitePlanRepository {
    fn find_all_active(&self) -> AppResult<Vec<Plan>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, uid, name, description, active, pos_limit, is_free_trial, trial_days,
                    created_at, updated_at
             FROM plans WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_plan_head)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|head| attach_details(&conn, head))
            .collect()
    }

    fn find_by_id(&self, id: i64) -> AppResult<Plan> {
        let conn = self.lock()?;
        find_by_id_locked(&conn, id)
    }

    fn find_by_name(&self, name: &str) -> AppResult<Option<Plan>> {
        let conn = self.lock()?;

        let head = conn
            .query_row(
                "SELECT id, uid, name, description, active, pos_limit, is_free_trial, trial_days,
                        created_at, updated_at
                 FROM plans WHERE name = ?1",
                params![name],
                row_to_plan_head,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                _ => Err(AppError::Database(e.to_string())),
            })?;

        head.map(|head| attach_details(&conn, head)).transpose()
    }

    fn find_free_trial(&self) -> AppResult<Option<Plan>> {
        let conn = self.lock()?;

        let head = conn
            .query_row(
                "SELECT id, uid, name, description, active, pos_limit, is_free_trial, trial_days,
                        created_at, updated_at
                 FROM plans WHERE is_free_trial = 1 ORDER BY id LIMIT 1",
                [],
                row_to_plan_head,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                _ => Err(AppError::Database(e.to_string())),
            })?;

        head.map(|head| attach_details(&conn, head)).transpose()
    }

    fn create(&self, dto: &CreatePlanDto) -> AppResult<Plan> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO plans (uid, name, description, active, pos_limit, is_free_trial, trial_days, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                dto.name,
                dto.description,
                dto.pos_limit,
                dto.is_free_trial,
                dto.trial_days,
                now,
                now
            ],
        )?;

        let plan_id = tx.last_insert_rowid();

        for (position, feature) in dto.features.iter().enumerate() {
            tx.execute(
                "INSERT INTO plan_features (plan_id, position, name, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![plan_id, position as i64, feature.name, feature.description],
            )?;
        }

        for pricing in dto.pricings.iter() {
            tx.execute(
                "INSERT INTO plan_pricings (plan_id, interval, price, currency)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    plan_id,
                    pricing.interval.as_str(),
                    pricing.price,
                    pricing.currency.as_deref().unwrap_or("eur")
                ],
            )?;
        }

        tx.commit()?;

        log::info!("プランを作成しました: id={plan_id}, name={}", dto.name);

        find_by_id_locked(&conn, plan_id)
    }

    fn deactivate(&self, id: i64) -> AppResult<Plan> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE plans SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        if affected == 0 {
            return Err(AppError::not_found(format!("ID {id} のプラン")));
        }

        find_by_id_locked(&conn, id)
    }
}

/// 機能・価格を含まないプラン本体
struct PlanHead {
    id: i64,
    uid: String,
    name: String,
    description: Option<String>,
    active: bool,
    pos_limit: i64,
    is_free_trial: bool,
    trial_days: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// 行からプラン本体を組み立てる
fn row_to_plan_head(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanHead> {
    Ok(PlanHead {
        id: row.get(0)?,
        uid: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        pos_limit: row.get(5)?,
        is_free_trial: row.get::<_, i64>(6)? != 0,
        trial_days: row.get(7)?,
        created_at: parse_datetime_column(row, 8)?,
        updated_at: parse_datetime_column(row, 9)?,
    })
}

/// RFC3339カラムをDateTime<Utc>として読み取る
fn parse_datetime_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// プラン本体に機能・価格を付加する
fn attach_details(conn: &Connection, head: PlanHead) -> AppResult<Plan> {
    let mut stmt = conn.prepare(
        "SELECT position, name, description FROM plan_features
         WHERE plan_id = ?1 ORDER BY position",
    )?;
    let features = stmt
        .query_map(params![head.id], |row| {
            Ok(PlanFeature {
                position: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT interval, price, currency FROM plan_pricings
         WHERE plan_id = ?1 ORDER BY interval",
    )?;
    let pricings = stmt
        .query_map(params![head.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?
        .into_iter()
        .map(|(interval, price, currency)| {
            Ok(PlanPricing {
                interval: Interval::parse(&interval)
                    .map_err(|_| AppError::Database(format!("不正な課金間隔です: {interval}")))?,
                price,
                currency,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(Plan {
        id: head.id,
        uid: head.uid,
        name: head.name,
        description: head.description,
        active: head.active,
        pos_limit: head.pos_limit,
        is_free_trial: head.is_free_trial,
        trial_days: head.trial_days,
        features,
        pricings,
        created_at: head.created_at,
        updated_at: head.updated_at,
    })
}

/// ロック済みの接続でIDからプランを取得する
fn find_by_id_locked(conn: &Connection, id: i64) -> AppResult<Plan> {
    let head = conn
        .query_row(
            "SELECT id, uid, name, description, active, pos_limit, is_free_trial, trial_days,
                    created_at, updated_at
             FROM plans WHERE id = ?1",
            params![id],
            row_to_plan_head,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                AppError::not_found(format!("ID {id} のプラン"))
            }
            _ => AppError::Database(e.to_string()),
        })?;

    attach_details(conn, head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::plans::models::{CreatePlanFeatureDto, CreatePlanPricingDto};
    use crate::shared::database;

    /// テスト用のインメモリリポジトリを構築する
    fn test_repository() -> SqlitePlanRepository {
        let conn = Connection::open_in_memory().unwrap();
        database::create_tables(&conn).unwrap();
        SqlitePlanRepository::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_find_all_active_returns_seeded_catalog() {
        let repo = test_repository();

        let plans = repo.find_all_active().unwrap();
        assert_eq!(plans.len(), 3);

        // ID順に並んでいることを確認
        assert!(plans.windows(2).all(|w| w[0].id < w[1].id));

        // 機能と価格が読み込まれていることを確認
        let starter = &plans[0];
        assert_eq!(starter.name, "Starter");
        assert!(!starter.features.is_empty());
        assert_eq!(starter.pricings.len(), 3);
    }

    #[test]
    fn test_find_by_id_not_found() {
        let repo = test_repository();

        let result = repo.find_by_id(999);
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_deactivate_hides_plan_from_catalog() {
        let repo = test_repository();

        let plans = repo.find_all_active().unwrap();
        let target = plans[0].id;

        let deactivated = repo.deactivate(target).unwrap();
        assert!(!deactivated.active);

        // 一覧からは消えるが、IDでの取得は引き続き可能
        let remaining = repo.find_all_active().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(repo.find_by_id(target).is_ok());
    }

    #[test]
    fn test_create_plan_with_features_and_pricings() {
        let repo = test_repository();

        let dto = CreatePlanDto {
            name: "Free Trial".to_string(),
            description: Some("30日間の無料トライアル".to_string()),
            pos_limit: 1,
            is_free_trial: true,
            trial_days: 30,
            features: vec![
                CreatePlanFeatureDto {
                    name: "在庫管理（基本）".to_string(),
                    description: None,
                },
                CreatePlanFeatureDto {
                    name: "単一POS".to_string(),
                    description: None,
                },
            ],
            pricings: vec![CreatePlanPricingDto {
                interval: Interval::Month,
                price: 0.0,
                currency: None,
            }],
        };

        let plan = repo.create(&dto).unwrap();
        assert!(plan.is_free_trial);
        assert_eq!(plan.features.len(), 2);
        assert_eq!(plan.features[0].position, 0);
        assert_eq!(plan.pricing_for(Interval::Month).unwrap().price, 0.0);
        assert_eq!(plan.pricing_for(Interval::Month).unwrap().currency, "eur");

        // 名前・トライアルフラグでの検索も確認
        assert!(repo.find_by_name("Free Trial").unwrap().is_some());
        assert!(repo.find_free_trial().unwrap().is_some());
    }

    #[test]
    fn test_create_duplicate_name_conflicts() {
        let repo = test_repository();

        let dto = CreatePlanDto {
            name: "Starter".to_string(),
            description: None,
            pos_limit: 1,
            is_free_trial: false,
            trial_days: 30,
            features: vec![],
            pricings: vec![],
        };

        // 既存プランと同名の作成はUNIQUE制約で拒否される
        let result = repo.create(&dto);
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }
}
