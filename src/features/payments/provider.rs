// 決済プロバイダ連携モジュール

use crate::config::settings::ProviderConfig;
use crate::features::plans::models::{Interval, Plan};
use crate::features::subscriptions::models::Subscription;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// 決済プロバイダとの連携境界
///
/// 決済の成立（settlement）の真実はプロバイダ側にあり、
/// このトレイトは契約の登録・解約・プラン変更の同期だけを担う。
/// 按分（プロレーション）の計算はプロバイダの責務。
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// 契約をプロバイダへ登録し、プロバイダ側の契約参照を返す
    ///
    /// # 戻り値
    /// プロバイダ側の契約参照。連携が無効な場合はNone
    async fn register_subscription(
        &self,
        subscription: &Subscription,
        plan: &Plan,
    ) -> AppResult<Option<String>>;

    /// プロバイダ側の契約を解約する
    async fn cancel_subscription(&self, provider_ref: &str) -> AppResult<()>;

    /// プロバイダ側の契約プランを変更する
    async fn change_subscription_plan(
        &self,
        provider_ref: &str,
        plan: &Plan,
        interval: Interval,
    ) -> AppResult<()>;
}

/// プロバイダの契約作成レスポンス
#[derive(Debug, Deserialize)]
struct ProviderSubscriptionResponse {
    id: String,
}

/// HTTP REST APIで外部プロバイダと通信する実装
///
/// すべてのリクエストに有限のタイムアウトを設定し、一時的な障害
/// （接続失敗・タイムアウト・5xx）のみ指数バックオフ付きでリトライする。
/// プロバイダによる拒否（4xx）は即座に終端エラーとなる。
pub struct HttpPaymentProvider {
    http: reqwest::Client,
    base_url: Url,
    secret_key: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpPaymentProvider {
    /// 設定からプロバイダクライアントを構築する
    ///
    /// # 引数
    /// * `config` - プロバイダ連携設定
    ///
    /// # 戻り値
    /// base_urlとsecret_keyが両方設定されている場合のみSome
    pub fn from_config(config: &ProviderConfig) -> AppResult<Option<Self>> {
        let (base_url, secret_key) = match (&config.base_url, &config.secret_key) {
            (Some(url), Some(key)) => (url.clone(), key.clone()),
            _ => return Ok(None),
        };

        let base_url = Url::parse(&base_url)
            .map_err(|e| AppError::configuration(format!("プロバイダURLが不正です: {e}")))?;

        info!("決済プロバイダ連携を有効化しました: {base_url}");

        Ok(Some(Self {
            http: reqwest::Client::new(),
            base_url,
            secret_key,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: config.retry.clone(),
        }))
    }

    /// Basic認証ヘッダーの値を構築する
    fn auth_header(&self) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:", self.secret_key));
        format!("Basic {encoded}")
    }

    /// ベースURLにパスを連結する
    fn endpoint(&self, path: &str) -> AppResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::configuration(format!("プロバイダURLの連結に失敗: {e}")))
    }

    /// リクエストを送信し、一時的な障害をリトライする
    ///
    /// # 引数
    /// * `operation_name` - ログ用の操作名
    /// * `build` - リクエストを構築するクロージャ（試行ごとに呼ばれる）
    async fn send_with_retry<F>(
        &self,
        operation_name: &str,
        build: F,
    ) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let response = retry_with_backoff(
            &self.retry,
            operation_name,
            |e| matches!(e, AppError::Provider(_)),
            || async {
                let response = build()
                    .header("Authorization", self.auth_header())
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| AppError::provider(format!("リクエスト送信に失敗: {e}")))?;

                // 5xxは一時的な障害としてリトライ対象にする
                if response.status().is_server_error() {
                    return Err(AppError::provider(format!(
                        "プロバイダが一時的なエラーを返しました: {}",
                        response.status()
                    )));
                }

                Ok(response)
            },
        )
        .await
        .map_err(|e| {
            // リトライを使い切った場合は手動照合のためにログを残す
            error!("{operation_name}: リトライ上限に達しました（要手動照合）: {e}");
            e
        })?;

        // 4xxはプロバイダによる拒否であり、リトライしても解決しない
        if !response.status().is_success() {
            return Err(AppError::provider(format!(
                "プロバイダがリクエストを拒否しました: {}",
                response.status()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn register_subscription(
        &self,
        subscription: &Subscription,
        plan: &Plan,
    ) -> AppResult<Option<String>> {
        let endpoint = self.endpoint("v1/subscriptions")?;
        let body = serde_json::json!({
            "subscription": subscription.uid,
            "company_id": subscription.company_id,
            "plan": plan.uid,
            "interval": subscription.interval.as_str(),
        });

        let response = self
            .send_with_retry("契約のプロバイダ登録", || {
                self.http.post(endpoint.clone()).json(&body)
            })
            .await?;

        let parsed: ProviderSubscriptionResponse = response
            .json()
            .await
            .map_err(|e| AppError::provider(format!("レスポンスの解析に失敗: {e}")))?;

        debug!(
            "契約をプロバイダへ登録しました: subscription={}, provider_ref={}",
            subscription.uid, parsed.id
        );

        Ok(Some(parsed.id))
    }

    async fn cancel_subscription(&self, provider_ref: &str) -> AppResult<()> {
        let endpoint = self.endpoint(&format!("v1/subscriptions/{provider_ref}"))?;

        self.send_with_retry("契約のプロバイダ解約", || {
            self.http.delete(endpoint.clone())
        })
        .await?;

        debug!("プロバイダ側の契約を解約しました: provider_ref={provider_ref}");

        Ok(())
    }

    async fn change_subscription_plan(
        &self,
        provider_ref: &str,
        plan: &Plan,
        interval: Interval,
    ) -> AppResult<()> {
        let endpoint = self.endpoint(&format!("v1/subscriptions/{provider_ref}"))?;
        let body = serde_json::json!({
            "plan": plan.uid,
            "interval": interval.as_str(),
        });

        self.send_with_retry("契約のプロバイダプラン変更", || {
            self.http.post(endpoint.clone()).json(&body)
        })
        .await?;

        debug!(
            "プロバイダ側の契約プランを変更しました: provider_ref={provider_ref}, plan={}",
            plan.name
        );

        Ok(())
    }
}

/// 連携が無効な場合のプロバイダ実装
///
/// 設定が不足している環境（開発・テスト）では全操作がノーオペになる。
pub struct DisabledPaymentProvider;

#[async_trait]
impl PaymentProvider for DisabledPaymentProvider {
    async fn register_subscription(
        &self,
        subscription: &Subscription,
        _plan: &Plan,
    ) -> AppResult<Option<String>> {
        warn!(
            "決済プロバイダ連携が無効のため、契約登録をスキップします: subscription={}",
            subscription.uid
        );
        Ok(None)
    }

    async fn cancel_subscription(&self, provider_ref: &str) -> AppResult<()> {
        warn!("決済プロバイダ連携が無効のため、解約連携をスキップします: provider_ref={provider_ref}");
        Ok(())
    }

    async fn change_subscription_plan(
        &self,
        provider_ref: &str,
        _plan: &Plan,
        _interval: Interval,
    ) -> AppResult<()> {
        warn!("決済プロバイダ連携が無効のため、プラン変更連携をスキップします: provider_ref={provider_ref}");
        Ok(())
    }
}
