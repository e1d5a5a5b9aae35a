use super::models::{PaymentRecord, RecordPaymentDto};
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// 決済台帳のリポジトリ
///
/// 台帳は追記専用で、更新・削除の操作は定義しない。
pub trait PaymentRecordRepository: Send + Sync {
    /// 決済を台帳に追記する
    ///
    /// 同じプロバイダ参照が既に記録されている場合は競合エラーを返し、
    /// 新しい行は作成しない（冪等な台帳）。
    fn insert(&self, dto: &RecordPaymentDto, paid_at: DateTime<Utc>) -> AppResult<PaymentRecord>;

    /// 契約の決済履歴を決済日時の昇順で取得する
    fn find_by_subscription(&self, subscription_id: i64) -> AppResult<Vec<PaymentRecord>>;
}

/// SQLiteによる決済台帳リポジトリ実装
pub struct SqlitePaymentRecordRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePaymentRecordRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::concurrency("データベースロックの取得に失敗しました"))
    }
}

impl PaymentRecordRepository for SqlitePaymentRecordRepository {
    fn insert(&self, dto: &RecordPaymentDto, paid_at: DateTime<Utc>) -> AppResult<PaymentRecord> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO payment_records (uid, subscription_id, amount, currency, provider_ref, paid_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                dto.subscription_id,
                dto.amount,
                dto.currency.as_deref().unwrap_or("eur"),
                dto.provider_ref,
                paid_at.to_rfc3339(),
                now
            ],
        )
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::conflict(format!(
                "プロバイダ参照 {} は既に記録されています",
                dto.provider_ref
            )),
            other => other,
        })?;

        let id = conn.last_insert_rowid();
        find_by_id_locked(&conn, id)
    }

    fn find_by_subscription(&self, subscription_id: i64) -> AppResult<Vec<PaymentRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, uid, subscription_id, amount, currency, provider_ref, paid_at, created_at
             FROM payment_records WHERE subscription_id = ?1 ORDER BY paid_at",
        )?;

        let records = stmt
            .query_map(params![subscription_id], row_to_payment_record)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(records)
    }
}

/// ロック済みの接続でIDから決済記録を取得する
fn find_by_id_locked(conn: &Connection, id: i64) -> AppResult<PaymentRecord> {
    conn.query_row(
        "SELECT id, uid, subscription_id, amount, currency, provider_ref, paid_at, created_at
         FROM payment_records WHERE id = ?1",
        params![id],
        row_to_payment_record,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::not_found(format!("ID {id} の決済記録")),
        _ => AppError::Database(e.to_string()),
    })
}

/// 行から決済記録を組み立てる
fn row_to_payment_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    Ok(PaymentRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        subscription_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        provider_ref: row.get(5)?,
        paid_at: parse_datetime(row, 6)?,
        created_at: parse_datetime(row, 7)?,
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::shared::database;

    /// テスト用のリポジトリと契約IDを構築する
    fn test_repository() -> (SqlitePaymentRecordRepository, i64) {
        let conn = Connection::open_in_memory().unwrap();
        database::create_tables(&conn).unwrap();

        conn.execute(
            "INSERT INTO subscriptions (uid, company_id, plan_id, interval, status, created_at, updated_at)
             VALUES ('s1', 1, 1, 'month', 'active', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        let subscription_id = conn.last_insert_rowid();

        (
            SqlitePaymentRecordRepository::new(Arc::new(Mutex::new(conn))),
            subscription_id,
        )
    }

    fn record_dto(subscription_id: i64, provider_ref: &str) -> RecordPaymentDto {
        RecordPaymentDto {
            subscription_id,
            amount: 19.90,
            currency: None,
            provider_ref: provider_ref.to_string(),
            paid_at: None,
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let (repo, subscription_id) = test_repository();

        let record = repo
            .insert(&record_dto(subscription_id, "pi_001"), Utc::now())
            .unwrap();
        assert_eq!(record.subscription_id, subscription_id);
        assert_eq!(record.currency, "eur");
        assert_eq!(record.provider_ref, "pi_001");
    }

    #[test]
    fn test_duplicate_provider_ref_conflicts_without_new_row() {
        let (repo, subscription_id) = test_repository();

        repo.insert(&record_dto(subscription_id, "pi_001"), Utc::now())
            .unwrap();

        // 同じ参照の2件目は競合になり、台帳は増えない
        let second = repo.insert(&record_dto(subscription_id, "pi_001"), Utc::now());
        assert!(matches!(second, Err(AppError::Conflict(_))));

        let history = repo.find_by_subscription(subscription_id).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_history_ordered_by_paid_at_ascending() {
        let (repo, subscription_id) = test_repository();
        let base = Utc::now();

        // 決済日時を逆順で挿入しても、履歴は昇順で返る
        repo.insert(&record_dto(subscription_id, "pi_march"), base + Duration::days(60))
            .unwrap();
        repo.insert(&record_dto(subscription_id, "pi_january"), base)
            .unwrap();
        repo.insert(&record_dto(subscription_id, "pi_february"), base + Duration::days(30))
            .unwrap();

        let history = repo.find_by_subscription(subscription_id).unwrap();
        let refs: Vec<_> = history.iter().map(|r| r.provider_ref.as_str()).collect();
        assert_eq!(refs, vec!["pi_january", "pi_february", "pi_march"]);
    }

    #[test]
    fn test_history_for_unknown_subscription_is_empty() {
        let (repo, _) = test_repository();
        assert!(repo.find_by_subscription(999).unwrap().is_empty());
    }
}
