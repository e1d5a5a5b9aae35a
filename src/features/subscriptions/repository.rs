use super::models::{CreateSubscriptionDto, Subscription, SubscriptionStatus};
use crate::features::plans::models::Interval;
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// 契約のリポジトリ
///
/// 各状態遷移は「現在のステータス」を条件に含む単文のUPDATEとして実装され、
/// 同時実行下でも失われた更新が起きないようにする。戻り値の件数が0の場合、
/// 呼び出し側は競合（別の遷移が先行した）として扱う。
pub trait SubscriptionRepository: Send + Sync {
    /// 契約を作成する（ステータスはpending、日付は未設定）
    fn create(&self, dto: &CreateSubscriptionDto) -> AppResult<Subscription>;

    /// IDで契約を取得する
    fn find_by_id(&self, id: i64) -> AppResult<Subscription>;

    /// 企業の非終端（pending/active）契約を取得する
    fn find_open_by_company(&self, company_id: i64) -> AppResult<Option<Subscription>>;

    /// pending→activeの遷移（開始日・終了日・更新日を設定）
    fn activate(
        &self,
        id: i64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        renewal_date: DateTime<Utc>,
    ) -> AppResult<usize>;

    /// 非終端→cancelledの遷移（終了日を設定）
    fn cancel(&self, id: i64, end_date: DateTime<Utc>) -> AppResult<usize>;

    /// active契約のプラン参照を差し替え、更新日を再計算する
    fn change_plan(
        &self,
        id: i64,
        plan_id: i64,
        end_date: DateTime<Utc>,
        renewal_date: DateTime<Utc>,
    ) -> AppResult<usize>;

    /// active→expiredの遷移
    fn expire(&self, id: i64) -> AppResult<usize>;

    /// 更新日が基準日時以前のactive契約を取得する
    fn find_expiring(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Subscription>>;

    /// 通知済み日時を記録する（activeのまま変わっていない場合のみ）
    fn mark_notified(&self, id: i64, at: DateTime<Utc>) -> AppResult<usize>;

    /// 決済プロバイダ側の契約参照を保存する
    fn set_provider_ref(&self, id: i64, provider_ref: &str) -> AppResult<()>;
}

/// SQLiteによる契約リポジトリ実装
pub struct SqliteSubscriptionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSubscriptionRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::concurrency("データベースロックの取得に失敗しました"))
    }
}

/// SELECT句のカラム一覧（行の組み立てと対で管理する）
const SUBSCRIPTION_COLUMNS: &str =
    "id, uid, company_id, plan_id, interval, status, start_date, end_date, renewal_date,
     last_notified_at, provider_ref, created_at, updated_at";

impl SubscriptionRepository for SqliteSubscriptionRepository {
    fn create(&self, dto: &CreateSubscriptionDto) -> AppResult<Subscription> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        // 同一企業の非終端契約は部分UNIQUEインデックスが拒否する
        conn.execute(
            "INSERT INTO subscriptions (uid, company_id, plan_id, interval, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                dto.company_id,
                dto.plan_id,
                dto.interval.as_str(),
                now,
                now
            ],
        )
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::conflict(format!(
                "企業ID {} には既に有効な契約があります",
                dto.company_id
            )),
            other => other,
        })?;

        let id = conn.last_insert_rowid();
        find_by_id_locked(&conn, id)
    }

    fn find_by_id(&self, id: i64) -> AppResult<Subscription> {
        let conn = self.lock()?;
        find_by_id_locked(&conn, id)
    }

    fn find_open_by_company(&self, company_id: i64) -> AppResult<Option<Subscription>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                 WHERE company_id = ?1 AND status IN ('pending', 'active')"
            ),
            params![company_id],
            row_to_subscription,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            _ => Err(AppError::Database(e.to_string())),
        })
    }

    fn activate(
        &self,
        id: i64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        renewal_date: DateTime<Utc>,
    ) -> AppResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE subscriptions
             SET status = 'active', start_date = ?1, end_date = ?2, renewal_date = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![
                start_date.to_rfc3339(),
                end_date.to_rfc3339(),
                renewal_date.to_rfc3339(),
                now,
                id
            ],
        )?;

        Ok(affected)
    }

    fn cancel(&self, id: i64, end_date: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE subscriptions
             SET status = 'cancelled', end_date = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'active')",
            params![end_date.to_rfc3339(), now, id],
        )?;

        Ok(affected)
    }

    fn change_plan(
        &self,
        id: i64,
        plan_id: i64,
        end_date: DateTime<Utc>,
        renewal_date: DateTime<Utc>,
    ) -> AppResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE subscriptions
             SET plan_id = ?1, end_date = ?2, renewal_date = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'active'",
            params![
                plan_id,
                end_date.to_rfc3339(),
                renewal_date.to_rfc3339(),
                now,
                id
            ],
        )?;

        Ok(affected)
    }

    fn expire(&self, id: i64) -> AppResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE subscriptions
             SET status = 'expired', updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![now, id],
        )?;

        Ok(affected)
    }

    fn find_expiring(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Subscription>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE status = 'active' AND renewal_date IS NOT NULL AND renewal_date <= ?1
             ORDER BY renewal_date"
        ))?;

        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], row_to_subscription)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(rows)
    }

    fn mark_notified(&self, id: i64, at: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.lock()?;

        let affected = conn.execute(
            "UPDATE subscriptions SET last_notified_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![at.to_rfc3339(), id],
        )?;

        Ok(affected)
    }

    fn set_provider_ref(&self, id: i64, provider_ref: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let affected = conn.execute(
            "UPDATE subscriptions SET provider_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![provider_ref, now, id],
        )?;

        if affected == 0 {
            return Err(AppError::not_found(format!("ID {id} の契約")));
        }

        Ok(())
    }
}

/// ロック済みの接続でIDから契約を取得する
fn find_by_id_locked(conn: &Connection, id: i64) -> AppResult<Subscription> {
    conn.query_row(
        &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
        params![id],
        row_to_subscription,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::not_found(format!("ID {id} の契約")),
        _ => AppError::Database(e.to_string()),
    })
}

/// 行から契約を組み立てる
fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let interval: String = row.get(4)?;
    let status: String = row.get(5)?;

    Ok(Subscription {
        id: row.get(0)?,
        uid: row.get(1)?,
        company_id: row.get(2)?,
        plan_id: row.get(3)?,
        interval: Interval::parse(&interval).map_err(|e| conversion_error(4, e))?,
        status: SubscriptionStatus::parse(&status).map_err(|e| conversion_error(5, e))?,
        start_date: parse_optional_datetime(row, 6)?,
        end_date: parse_optional_datetime(row, 7)?,
        renewal_date: parse_optional_datetime(row, 8)?,
        last_notified_at: parse_optional_datetime(row, 9)?,
        provider_ref: row.get(10)?,
        created_at: parse_datetime(row, 11)?,
        updated_at: parse_datetime(row, 12)?,
    })
}

/// NULL許容のRFC3339カラムを読み取る
fn parse_optional_datetime(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(index)?;
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        index,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        })
        .transpose()
}

/// RFC3339カラムを読み取る
fn parse_datetime(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// ドメインエラーをrusqliteの変換エラーとして包む
fn conversion_error(index: usize, error: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::shared::database;

    /// テスト用のインメモリリポジトリを構築する
    fn test_repository() -> SqliteSubscriptionRepository {
        let conn = Connection::open_in_memory().unwrap();
        database::create_tables(&conn).unwrap();
        SqliteSubscriptionRepository::new(Arc::new(Mutex::new(conn)))
    }

    fn create_dto(company_id: i64) -> CreateSubscriptionDto {
        CreateSubscriptionDto {
            company_id,
            plan_id: 1,
            interval: Interval::Month,
        }
    }

    #[test]
    fn test_create_and_find() {
        let repo = test_repository();

        let subscription = repo.create(&create_dto(1)).unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Pending);
        assert!(subscription.start_date.is_none());
        assert!(subscription.renewal_date.is_none());

        let found = repo.find_by_id(subscription.id).unwrap();
        assert_eq!(found.uid, subscription.uid);
        assert_eq!(found.company_id, 1);
    }

    #[test]
    fn test_duplicate_open_subscription_conflicts() {
        let repo = test_repository();

        repo.create(&create_dto(1)).unwrap();
        let second = repo.create(&create_dto(1));
        assert!(matches!(second, Err(AppError::Conflict(_))));

        // 別の企業の契約は作成できる
        assert!(repo.create(&create_dto(2)).is_ok());
    }

    #[test]
    fn test_activate_is_guarded_by_status() {
        let repo = test_repository();
        let subscription = repo.create(&create_dto(1)).unwrap();

        let now = Utc::now();
        let renewal = now + Duration::days(30);

        // pendingからは1回だけ遷移できる
        assert_eq!(repo.activate(subscription.id, now, renewal, renewal).unwrap(), 1);
        assert_eq!(repo.activate(subscription.id, now, renewal, renewal).unwrap(), 0);

        let activated = repo.find_by_id(subscription.id).unwrap();
        assert_eq!(activated.status, SubscriptionStatus::Active);
        assert_eq!(activated.renewal_date.unwrap(), renewal);
    }

    #[test]
    fn test_cancel_from_terminal_is_noop() {
        let repo = test_repository();
        let subscription = repo.create(&create_dto(1)).unwrap();

        let now = Utc::now();
        assert_eq!(repo.cancel(subscription.id, now).unwrap(), 1);

        // 解約済みの契約への再解約・有効化は0件更新になる
        assert_eq!(repo.cancel(subscription.id, now).unwrap(), 0);
        assert_eq!(repo.activate(subscription.id, now, now, now).unwrap(), 0);
    }

    #[test]
    fn test_find_open_by_company() {
        let repo = test_repository();

        assert!(repo.find_open_by_company(1).unwrap().is_none());

        let subscription = repo.create(&create_dto(1)).unwrap();
        assert!(repo.find_open_by_company(1).unwrap().is_some());

        // 解約すると非終端契約はなくなる
        repo.cancel(subscription.id, Utc::now()).unwrap();
        assert!(repo.find_open_by_company(1).unwrap().is_none());
    }

    #[test]
    fn test_find_expiring_window() {
        let repo = test_repository();
        let now = Utc::now();

        // 契約A: 更新日が2日後（対象）
        let a = repo.create(&create_dto(1)).unwrap();
        repo.activate(a.id, now - Duration::days(28), now + Duration::days(2), now + Duration::days(2))
            .unwrap();

        // 契約B: 更新日が10日後（対象外）
        let b = repo.create(&create_dto(2)).unwrap();
        repo.activate(b.id, now, now + Duration::days(10), now + Duration::days(10))
            .unwrap();

        // 契約C: 更新日超過だが解約済み（対象外）
        let c = repo.create(&create_dto(3)).unwrap();
        repo.activate(c.id, now - Duration::days(40), now - Duration::days(10), now - Duration::days(10))
            .unwrap();
        repo.cancel(c.id, now).unwrap();

        let expiring = repo.find_expiring(now + Duration::days(3)).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, a.id);
    }

    #[test]
    fn test_expire_requires_active() {
        let repo = test_repository();
        let subscription = repo.create(&create_dto(1)).unwrap();

        // pendingの契約は期限切れにできない
        assert_eq!(repo.expire(subscription.id).unwrap(), 0);

        let now = Utc::now();
        repo.activate(subscription.id, now, now, now).unwrap();
        assert_eq!(repo.expire(subscription.id).unwrap(), 1);

        // 2回目の期限切れ遷移は0件更新
        assert_eq!(repo.expire(subscription.id).unwrap(), 0);
    }

    #[test]
    fn test_mark_notified_and_provider_ref() {
        let repo = test_repository();
        let subscription = repo.create(&create_dto(1)).unwrap();
        let now = Utc::now();

        // pendingの契約には通知記録が付かない（activeのみ）
        assert_eq!(repo.mark_notified(subscription.id, now).unwrap(), 0);

        repo.activate(subscription.id, now, now + Duration::days(30), now + Duration::days(30))
            .unwrap();
        assert_eq!(repo.mark_notified(subscription.id, now).unwrap(), 1);

        repo.set_provider_ref(subscription.id, "sub_prov_01").unwrap();
        let found = repo.find_by_id(subscription.id).unwrap();
        assert!(found.last_notified_at.is_some());
        assert_eq!(found.provider_ref.as_deref(), Some("sub_prov_01"));
    }
}
