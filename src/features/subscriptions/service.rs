use super::models::{CreateSubscriptionDto, ScanReport, Subscription, SubscriptionStatus};
use super::repository::SubscriptionRepository;
use crate::config::settings::ExpiryConfig;
use crate::features::payments::provider::PaymentProvider;
use crate::features::plans::repository::PlanRepository;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::events::{DomainEvent, EventPublisher};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

/// 契約ライフサイクルの管理サービス
///
/// 状態遷移はすべてリポジトリのガード付きUPDATE（現在ステータスを条件に含む
/// 単文の更新）で確定させるため、同時リクエストが重なっても二重遷移は起きない。
/// プロバイダ連携を伴う操作（解約・プラン変更）は、プロバイダ側の同期が
/// 成功した後にローカルの遷移をコミットする。
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanRepository>,
    provider: Arc<dyn PaymentProvider>,
    events: EventPublisher,
    expiry: ExpiryConfig,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanRepository>,
        provider: Arc<dyn PaymentProvider>,
        events: EventPublisher,
        expiry: ExpiryConfig,
    ) -> Self {
        Self {
            subscriptions,
            plans,
            provider,
            events,
            expiry,
        }
    }

    /// IDで契約を取得する
    pub fn get(&self, id: i64) -> AppResult<Subscription> {
        self.subscriptions.find_by_id(id)
    }

    /// 企業の非終端契約を取得する
    pub fn get_company_subscription(&self, company_id: i64) -> AppResult<Option<Subscription>> {
        self.subscriptions.find_open_by_company(company_id)
    }

    /// 契約を作成する（ステータスはpending）
    ///
    /// # 引数
    /// * `dto` - 契約作成用DTO
    ///
    /// # 戻り値
    /// 作成された契約。既に非終端契約がある企業の場合は競合エラー
    pub fn create(&self, dto: &CreateSubscriptionDto) -> AppResult<Subscription> {
        let plan = self.plans.find_by_id(dto.plan_id)?;

        if !plan.active {
            return Err(AppError::conflict(format!(
                "プラン {} は現在提供されていません",
                plan.name
            )));
        }

        if plan.pricing_for(dto.interval).is_none() {
            return Err(AppError::validation(format!(
                "プラン {} には課金間隔 {} の価格が定義されていません",
                plan.name,
                dto.interval.as_str()
            )));
        }

        // 事前チェック（わかりやすいエラーメッセージのため）。
        // 同時作成の競合はリポジトリ側の部分UNIQUEインデックスが最終的に決着する。
        if self
            .subscriptions
            .find_open_by_company(dto.company_id)?
            .is_some()
        {
            return Err(AppError::conflict(format!(
                "企業ID {} には既に有効な契約があります",
                dto.company_id
            )));
        }

        let subscription = self.subscriptions.create(dto)?;

        info!(
            "契約を作成しました: id={}, company={}, plan={}",
            subscription.id, subscription.company_id, plan.name
        );

        self.events.publish(DomainEvent::SubscriptionCreated {
            subscription_id: subscription.id,
            company_id: subscription.company_id,
            plan_name: plan.name.clone(),
        });

        Ok(subscription)
    }

    /// 契約を有効化する（pending→active）
    ///
    /// 開始日を現在時刻、終了日・更新日を開始日+課金間隔に設定する。
    /// 既にactiveの契約に対しては現在の状態を返すだけのノーオペとなり、
    /// プロバイダのWebhook再送に対して安全になっている。
    ///
    /// # 引数
    /// * `id` - 契約ID
    pub async fn activate(&self, id: i64) -> AppResult<Subscription> {
        let subscription = self.subscriptions.find_by_id(id)?;

        match subscription.status {
            // 冪等: 有効化済みならそのまま返す（イベントも発行しない）
            SubscriptionStatus::Active => {
                debug!("契約 {id} は有効化済みのためスキップします");
                return Ok(subscription);
            }
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                return Err(AppError::invalid_state(
                    subscription.status.as_str(),
                    "active",
                ));
            }
            SubscriptionStatus::Pending => {}
        }

        let start_date = Utc::now();
        let period_end = start_date + Duration::days(subscription.interval.days());

        let affected = self
            .subscriptions
            .activate(id, start_date, period_end, period_end)?;

        if affected == 0 {
            // 別のリクエストが先に遷移させた場合。activeになっていれば冪等に成功扱い
            let current = self.subscriptions.find_by_id(id)?;
            if current.status == SubscriptionStatus::Active {
                return Ok(current);
            }
            return Err(AppError::invalid_state(current.status.as_str(), "active"));
        }

        let activated = self.subscriptions.find_by_id(id)?;

        // プロバイダへの契約登録はベストエフォート。失敗しても有効化は維持し、
        // 照合ログを残して運用で回復する。
        let plan = self.plans.find_by_id(activated.plan_id)?;
        match self.provider.register_subscription(&activated, &plan).await {
            Ok(Some(provider_ref)) => {
                self.subscriptions.set_provider_ref(id, &provider_ref)?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("契約 {id} のプロバイダ登録に失敗しました（要手動照合）: {e}");
            }
        }

        info!(
            "契約を有効化しました: id={}, renewal_date={:?}",
            id, activated.renewal_date
        );

        self.events.publish(DomainEvent::SubscriptionActivated {
            subscription_id: activated.id,
            company_id: activated.company_id,
        });

        self.subscriptions.find_by_id(id)
    }

    /// 契約を解約する（即時解約）
    ///
    /// 解約は即時に有効となり、終了日に現在時刻を設定する。
    /// プロバイダ側の解約が成功した後にローカルの遷移をコミットする。
    ///
    /// # 引数
    /// * `id` - 契約ID
    pub async fn cancel(&self, id: i64) -> AppResult<Subscription> {
        let subscription = self.subscriptions.find_by_id(id)?;

        if subscription.status.is_terminal() {
            return Err(AppError::invalid_state(
                subscription.status.as_str(),
                "cancelled",
            ));
        }

        // プロバイダ側を先に解約する。リトライを使い切った場合はエラーを返し、
        // ローカルの契約は変更しない。
        if let Some(provider_ref) = &subscription.provider_ref {
            self.provider.cancel_subscription(provider_ref).await?;
        }

        let end_date = Utc::now();
        let affected = self.subscriptions.cancel(id, end_date)?;

        if affected == 0 {
            // プロバイダ解約後にローカルの遷移が競合で負けたケース
            let current = self.subscriptions.find_by_id(id)?;
            warn!(
                "契約 {id} の解約が競合しました（現在: {}、プロバイダ側は解約済み、要手動照合）",
                current.status.as_str()
            );
            return Err(AppError::invalid_state(
                current.status.as_str(),
                "cancelled",
            ));
        }

        info!("契約を解約しました: id={id}");

        self.events.publish(DomainEvent::SubscriptionCancelled {
            subscription_id: subscription.id,
            company_id: subscription.company_id,
        });

        self.subscriptions.find_by_id(id)
    }

    /// 契約のプランを変更する（active→active、同一レコード）
    ///
    /// プラン参照を差し替え、更新日の基準を現在時刻+課金間隔へ再計算する。
    /// 按分調整はプロバイダの責務であり、プロバイダ側の変更が成功した後に
    /// ローカルの変更をコミットする。
    ///
    /// # 引数
    /// * `id` - 契約ID
    /// * `new_plan_id` - 変更先プランのID
    pub async fn change_plan(&self, id: i64, new_plan_id: i64) -> AppResult<Subscription> {
        let subscription = self.subscriptions.find_by_id(id)?;

        if subscription.status != SubscriptionStatus::Active {
            return Err(AppError::invalid_state(
                subscription.status.as_str(),
                "active",
            ));
        }

        let new_plan = self.plans.find_by_id(new_plan_id)?;

        if !new_plan.active {
            return Err(AppError::conflict(format!(
                "プラン {} は現在提供されていません",
                new_plan.name
            )));
        }

        if new_plan.pricing_for(subscription.interval).is_none() {
            return Err(AppError::validation(format!(
                "プラン {} には課金間隔 {} の価格が定義されていません",
                new_plan.name,
                subscription.interval.as_str()
            )));
        }

        // 同一プランへの変更はノーオペ
        if subscription.plan_id == new_plan_id {
            debug!("契約 {id} は既にプラン {} です", new_plan.name);
            return Ok(subscription);
        }

        let old_plan = self.plans.find_by_id(subscription.plan_id)?;

        // プロバイダ側のプラン変更（按分調整を含む）を先に行う
        if let Some(provider_ref) = &subscription.provider_ref {
            self.provider
                .change_subscription_plan(provider_ref, &new_plan, subscription.interval)
                .await?;
        }

        let renewal_date = Utc::now() + Duration::days(subscription.interval.days());
        let affected = self
            .subscriptions
            .change_plan(id, new_plan_id, renewal_date, renewal_date)?;

        if affected == 0 {
            let current = self.subscriptions.find_by_id(id)?;
            warn!(
                "契約 {id} のプラン変更が競合しました（現在: {}、プロバイダ側は変更済み、要手動照合）",
                current.status.as_str()
            );
            return Err(AppError::invalid_state(current.status.as_str(), "active"));
        }

        info!(
            "契約のプランを変更しました: id={}, {} -> {}",
            id, old_plan.name, new_plan.name
        );

        self.events.publish(DomainEvent::SubscriptionPlanChanged {
            subscription_id: subscription.id,
            company_id: subscription.company_id,
            old_plan_name: old_plan.name,
            new_plan_name: new_plan.name,
        });

        self.subscriptions.find_by_id(id)
    }

    /// 契約を期限切れにする（active→expired）
    ///
    /// # 引数
    /// * `id` - 契約ID
    pub fn expire(&self, id: i64) -> AppResult<Subscription> {
        let subscription = self.subscriptions.find_by_id(id)?;

        if subscription.status != SubscriptionStatus::Active {
            return Err(AppError::invalid_state(
                subscription.status.as_str(),
                "expired",
            ));
        }

        let affected = self.subscriptions.expire(id)?;
        if affected == 0 {
            let current = self.subscriptions.find_by_id(id)?;
            return Err(AppError::invalid_state(current.status.as_str(), "expired"));
        }

        info!("契約を期限切れにしました: id={id}");

        self.events.publish(DomainEvent::SubscriptionExpired {
            subscription_id: subscription.id,
            company_id: subscription.company_id,
        });

        self.subscriptions.find_by_id(id)
    }

    /// 更新日が近い契約をスキャンする（外部スケジューラから定期実行）
    ///
    /// 更新日が先読みウィンドウ内のactive契約について、
    /// - 更新日を過ぎたものはexpiredへ遷移させ、
    /// - まだ更新日前のものには更新日接近の通知イベントを発行する。
    ///
    /// 各遷移・通知記録はガード付きUPDATEで確定させるため、スケジュールが
    /// 重なって同時実行されても二重の期限切れ・二重通知は起きない。
    /// 通知は契約の last_notified_at により課金期間ごとに最大1回に抑止される。
    ///
    /// # 引数
    /// * `now` - スキャンの基準時刻
    ///
    /// # 戻り値
    /// スキャン結果のレポート
    pub fn scan_expiring(&self, now: DateTime<Utc>) -> AppResult<ScanReport> {
        let lookahead = Duration::days(self.expiry.lookahead_days);
        let cutoff = now + lookahead;

        let candidates = self.subscriptions.find_expiring(cutoff)?;
        let mut report = ScanReport {
            scanned: candidates.len(),
            ..ScanReport::default()
        };

        for subscription in candidates {
            let renewal_date = match subscription.renewal_date {
                Some(date) => date,
                None => continue,
            };

            if renewal_date < now {
                // 更新されないまま更新日を過ぎた契約を期限切れへ。
                // ガード付きUPDATEが0件なら別のスキャンが先に処理している
                if self.subscriptions.expire(subscription.id)? == 1 {
                    report.expired += 1;
                    self.events.publish(DomainEvent::SubscriptionExpired {
                        subscription_id: subscription.id,
                        company_id: subscription.company_id,
                    });
                }
                continue;
            }

            // 今回の更新期限に対する通知済みかどうかを判定する。
            // 通知済み日時が通知ウィンドウ開始以降なら既に通知している
            let window_start = renewal_date - lookahead;
            let already_notified = subscription
                .last_notified_at
                .map(|at| at >= window_start)
                .unwrap_or(false);

            if already_notified {
                continue;
            }

            if self.subscriptions.mark_notified(subscription.id, now)? == 1 {
                report.notified += 1;
                self.events.publish(DomainEvent::RenewalApproaching {
                    subscription_id: subscription.id,
                    company_id: subscription.company_id,
                    renewal_date,
                });
            }
        }

        info!(
            "期限切れスキャンが完了しました: scanned={}, notified={}, expired={}",
            report.scanned, report.notified, report.expired
        );

        Ok(report)
    }
}
