use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use stockplus::config::AppConfig;
use stockplus::features::notifications::service::Notifier;
use stockplus::features::plans::models::{
    CreatePlanDto, CreatePlanFeatureDto, CreatePlanPricingDto, Interval,
};
use stockplus::shared::errors::AppResult;
use stockplus::shared::events;
use stockplus::{build_context, server};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // 環境変数を読み込み（.envファイルがない場合は無視。
    // 本番環境では環境変数が直接設定される）
    let _ = dotenv::dotenv();

    initialize_logging_system();

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    let result = match command.as_str() {
        "serve" => run_server().await,
        "check-expiring-subscriptions" => run_expiry_scan().await,
        "create-free-trial-plan" => run_create_free_trial_plan().await,
        other => {
            error!("不明なコマンドです: {other}");
            eprintln!("使い方: stockplus [serve|check-expiring-subscriptions|create-free-trial-plan]");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        error!("コマンドの実行に失敗しました: {e}");
        std::process::exit(1);
    }
}

/// HTTPサーバーを実行する
async fn run_server() -> AppResult<()> {
    info!("アプリケーション初期化を開始します...");

    let config = AppConfig::from_env()?;
    let notifier = Notifier::new(&config.notification);
    let (ctx, receiver) = build_context(config)?;

    // イベントワーカーを起動（ライフサイクルイベント→通知）
    let worker = tokio::spawn(events::run_event_worker(receiver, notifier));

    info!("アプリケーション初期化が完了しました");

    // ctrl-cでグレースフルシャットダウン
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("割り込みシグナルを受信しました");
            shutdown_trigger.cancel();
        }
    });

    let result = server::run(Arc::new(ctx), shutdown).await;

    // コンテキストのドロップで発行側が閉じ、ワーカーはキューを飲み干して
    // 終了する。接続が残っている場合に備えて待機時間は有限にする
    if tokio::time::timeout(std::time::Duration::from_secs(5), worker)
        .await
        .is_err()
    {
        warn!("イベントワーカーの終了待ちがタイムアウトしました");
    }

    result
}

/// 期限切れスキャンを実行する（外部スケジューラから起動される）
///
/// 成功時は終了コード0、回復不能な失敗時は非0で終了する。
async fn run_expiry_scan() -> AppResult<()> {
    info!("期限切れスキャンを開始します...");

    let config = AppConfig::from_env()?;
    let notifier = Notifier::new(&config.notification);
    let (ctx, receiver) = build_context(config)?;

    let worker = tokio::spawn(events::run_event_worker(receiver, notifier));

    let report = ctx.subscriptions.scan_expiring(Utc::now())?;

    info!(
        "期限切れスキャンが終了しました: scanned={}, notified={}, expired={}",
        report.scanned, report.notified, report.expired
    );

    // 発行側をすべて閉じてから、通知の配送完了を待つ
    drop(ctx);
    if let Err(e) = worker.await {
        warn!("イベントワーカーの終了に失敗しました: {e}");
    }

    Ok(())
}

/// 無料トライアルプランを作成する（管理コマンド）
async fn run_create_free_trial_plan() -> AppResult<()> {
    let config = AppConfig::from_env()?;
    let (ctx, _receiver) = build_context(config)?;

    // 既に無料トライアルプランがある場合は何もしない
    if let Some(existing) = ctx.plans.find_free_trial()? {
        info!("無料トライアルプランは既に存在します: {}", existing.name);
        return Ok(());
    }

    let dto = CreatePlanDto {
        name: "Free Trial".to_string(),
        description: Some("基本機能が使える30日間の無料トライアル".to_string()),
        pos_limit: 1,
        is_free_trial: true,
        trial_days: 30,
        features: vec![
            CreatePlanFeatureDto {
                name: "在庫管理（基本）".to_string(),
                description: Some("基本機能での在庫管理".to_string()),
            },
            CreatePlanFeatureDto {
                name: "単一POS".to_string(),
                description: Some("1つのPOSの作成と管理".to_string()),
            },
            CreatePlanFeatureDto {
                name: "基本レポート".to_string(),
                description: Some("売上・在庫の基本レポート".to_string()),
            },
        ],
        pricings: vec![CreatePlanPricingDto {
            interval: Interval::Month,
            price: 0.0,
            currency: None,
        }],
    };

    let plan = ctx.plans.create(&dto)?;
    info!("無料トライアルプランを作成しました: {}", plan.name);

    Ok(())
}

/// ログシステムを初期化
fn initialize_logging_system() {
    // 設定読み込み前でもログを出せるよう、レベルは環境変数から直接決める
    let log_level = match std::env::var("STOCKPLUS_LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_secs()
        .format_module_path(false)
        .format_target(false)
        .init();
}
