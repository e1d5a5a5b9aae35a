use crate::shared::errors::{AppError, AppResult};
use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;

/// データベース接続を初期化し、スキーマを作成する
///
/// # 引数
/// * `database_path` - データベースファイルのパス
///
/// # 戻り値
/// データベース接続、または失敗時はエラー
///
/// # 処理内容
/// 1. 親ディレクトリの確保
/// 2. データベース接続の開設（外部キー制約を有効化）
/// 3. テーブル・インデックス作成とプランカタログの初期投入
pub fn initialize_database(database_path: &Path) -> AppResult<Connection> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = database_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::configuration(format!("データディレクトリの作成に失敗: {e}"))
            })?;
        }
    }

    let conn = Connection::open(database_path)
        .map_err(|e| AppError::Database(e.to_string()))?;

    // 外部キー制約を有効化
    conn.execute_batch("PRAGMA foreign_keys = ON")
        .map_err(|e| AppError::Database(e.to_string()))?;

    create_tables(&conn)?;

    log::info!("データベースを初期化しました: {:?}", database_path);

    Ok(conn)
}

/// データベーステーブルを作成する
///
/// # 引数
/// * `conn` - データベース接続
///
/// # 戻り値
/// 成功時はOk(())、失敗時はエラー
pub fn create_tables(conn: &Connection) -> AppResult<()> {
    create_plans_table(conn)?;
    create_subscriptions_table(conn)?;
    create_payment_records_table(conn)?;
    create_indexes(conn)?;

    // プランカタログが空の場合、デフォルトのカタログを投入
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM plans", [], |row| row.get(0))
        .map_err(|e| AppError::Database(e.to_string()))?;

    if count == 0 {
        insert_default_plans(conn)?;
    }

    Ok(())
}

/// プラン関連テーブルを作成する
fn create_plans_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            pos_limit INTEGER NOT NULL DEFAULT 3,
            is_free_trial INTEGER NOT NULL DEFAULT 0,
            trial_days INTEGER NOT NULL DEFAULT 30,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plan_features (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id INTEGER NOT NULL REFERENCES plans(id),
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            UNIQUE(plan_id, position)
        )",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plan_pricings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id INTEGER NOT NULL REFERENCES plans(id),
            interval TEXT NOT NULL CHECK(interval IN ('month', 'semester', 'year')),
            price REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'eur',
            UNIQUE(plan_id, interval)
        )",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(())
}

/// 契約テーブルを作成する
fn create_subscriptions_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            company_id INTEGER NOT NULL,
            plan_id INTEGER NOT NULL REFERENCES plans(id),
            interval TEXT NOT NULL CHECK(interval IN ('month', 'semester', 'year')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'active', 'cancelled', 'expired')),
            start_date TEXT,
            end_date TEXT,
            renewal_date TEXT,
            last_notified_at TEXT,
            provider_ref TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(())
}

/// 決済台帳テーブルを作成する
fn create_payment_records_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL UNIQUE,
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id),
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'eur',
            provider_ref TEXT NOT NULL UNIQUE,
            paid_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(())
}

/// インデックスを作成する
fn create_indexes(conn: &Connection) -> AppResult<()> {
    // 1社につき非終端（pending/active）の契約は1件まで。
    // 同時作成の競合はこの部分UNIQUEインデックスで決着する。
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_company_open
         ON subscriptions(company_id) WHERE status IN ('pending', 'active')",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subscriptions_status_renewal
         ON subscriptions(status, renewal_date)",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payment_records_subscription
         ON payment_records(subscription_id, paid_at)",
        [],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(())
}

/// デフォルトのプランカタログを投入する
fn insert_default_plans(conn: &Connection) -> AppResult<()> {
    // (名前, 説明, POS上限, 月額, 半期額, 年額, 機能一覧)
    let plans: [(&str, &str, i64, f64, f64, f64, &[&str]); 3] = [
        (
            "Starter",
            "小規模事業者向けの基本プラン",
            1,
            19.90,
            107.40,
            190.80,
            &["在庫管理", "商品カタログ"],
        ),
        (
            "Standard",
            "成長中の事業者向けの標準プラン",
            3,
            49.90,
            269.40,
            478.80,
            &["在庫管理", "商品カタログ", "売上レポート"],
        ),
        (
            "Premium",
            "複数店舗を運営する事業者向けの上位プラン",
            10,
            99.90,
            539.40,
            958.80,
            &["在庫管理", "商品カタログ", "売上レポート", "優先サポート"],
        ),
    ];

    let now = Utc::now().to_rfc3339();

    for (name, description, pos_limit, monthly, semester, yearly, features) in plans.iter() {
        conn.execute(
            "INSERT INTO plans (uid, name, description, active, pos_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                name,
                description,
                pos_limit,
                now,
                now
            ],
        )
        .map_err(|e| AppError::Database(e.to_string()))?;

        let plan_id = conn.last_insert_rowid();

        for (position, feature) in features.iter().enumerate() {
            conn.execute(
                "INSERT INTO plan_features (plan_id, position, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![plan_id, position as i64, feature],
            )
            .map_err(|e| AppError::Database(e.to_string()))?;
        }

        for (interval, price) in [("month", monthly), ("semester", semester), ("year", yearly)] {
            conn.execute(
                "INSERT INTO plan_pricings (plan_id, interval, price, currency)
                 VALUES (?1, ?2, ?3, 'eur')",
                rusqlite::params![plan_id, interval, price],
            )
            .map_err(|e| AppError::Database(e.to_string()))?;
        }
    }

    log::info!("デフォルトのプランカタログを投入しました");

    Ok(())
}
