pub mod config;
pub mod features;
pub mod server;
pub mod shared;

use config::AppConfig;
use features::payments::provider::{DisabledPaymentProvider, HttpPaymentProvider, PaymentProvider};
use features::payments::repository::{PaymentRecordRepository, SqlitePaymentRecordRepository};
use features::payments::service::PaymentService;
use features::plans::repository::{PlanRepository, SqlitePlanRepository};
use features::subscriptions::repository::{SqliteSubscriptionRepository, SubscriptionRepository};
use features::subscriptions::service::SubscriptionService;
use log::warn;
use shared::errors::AppResult;
use shared::events::DomainEvent;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// アプリケーションコンテキスト
///
/// データベース接続・サービス・設定を束ね、インターフェース層
/// （HTTPサーバー・スケジュールコマンド）から共有される。
pub struct AppContext {
    pub config: AppConfig,
    pub plans: Arc<dyn PlanRepository>,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentService,
}

/// アプリケーションコンテキストを構築する
///
/// # 引数
/// * `config` - 検証済みのアプリケーション設定
///
/// # 戻り値
/// コンテキストと、イベントワーカーへ渡すイベント受信側のペア
///
/// # 処理内容
/// 1. データベースの初期化（スキーマ作成・カタログ投入）
/// 2. リポジトリとサービスの組み立て
/// 3. 決済プロバイダクライアントの構築（設定がなければ無効化）
pub fn build_context(
    config: AppConfig,
) -> AppResult<(AppContext, UnboundedReceiver<DomainEvent>)> {
    let conn = shared::database::initialize_database(&config.database_path)?;
    let conn = Arc::new(Mutex::new(conn));

    let plans: Arc<dyn PlanRepository> = Arc::new(SqlitePlanRepository::new(Arc::clone(&conn)));
    let subscription_repo: Arc<dyn SubscriptionRepository> =
        Arc::new(SqliteSubscriptionRepository::new(Arc::clone(&conn)));
    let payment_repo: Arc<dyn PaymentRecordRepository> =
        Arc::new(SqlitePaymentRecordRepository::new(Arc::clone(&conn)));

    let provider: Arc<dyn PaymentProvider> =
        match HttpPaymentProvider::from_config(&config.provider)? {
            Some(provider) => Arc::new(provider),
            None => {
                warn!("決済プロバイダが未設定のため、プロバイダ連携なしで動作します");
                Arc::new(DisabledPaymentProvider)
            }
        };

    let (events, receiver) = shared::events::channel();

    let subscriptions = SubscriptionService::new(
        Arc::clone(&subscription_repo),
        Arc::clone(&plans),
        provider,
        events.clone(),
        config.expiry.clone(),
    );
    let payments = PaymentService::new(payment_repo, subscription_repo, events);

    Ok((
        AppContext {
            config,
            plans,
            subscriptions,
            payments,
        },
        receiver,
    ))
}
