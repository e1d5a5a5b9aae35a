use super::models::{validate_provider_ref, PaymentRecord, RecordPaymentDto};
use super::repository::PaymentRecordRepository;
use crate::features::subscriptions::repository::SubscriptionRepository;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::events::{DomainEvent, EventPublisher};
use chrono::Utc;
use log::info;
use std::sync::Arc;

/// 決済台帳サービス
///
/// プロバイダからの決済確認を追記専用の台帳へ記録し、履歴を提供する。
/// 決済の成立自体は外部プロバイダが真実を持ち、ここでは記録のみを行う。
pub struct PaymentService {
    payments: Arc<dyn PaymentRecordRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    events: EventPublisher,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentRecordRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        events: EventPublisher,
    ) -> Self {
        Self {
            payments,
            subscriptions,
            events,
        }
    }

    /// 決済を台帳に記録する
    ///
    /// # 引数
    /// * `dto` - プロバイダの決済確認ペイロード
    ///
    /// # 戻り値
    /// 作成された決済記録。重複参照の場合は競合エラー
    pub fn record_payment(&self, dto: &RecordPaymentDto) -> AppResult<PaymentRecord> {
        if dto.amount <= 0.0 {
            return Err(AppError::validation("決済金額は正の数値である必要があります"));
        }
        validate_provider_ref(&dto.provider_ref)?;

        // 契約の存在確認（不在ならNotFound）
        let subscription = self.subscriptions.find_by_id(dto.subscription_id)?;

        let paid_at = dto.paid_at.unwrap_or_else(Utc::now);
        let record = self.payments.insert(dto, paid_at)?;

        info!(
            "決済を記録しました: subscription={}, amount={} {}, provider_ref={}",
            subscription.uid, record.amount, record.currency, record.provider_ref
        );

        self.events.publish(DomainEvent::PaymentRecorded {
            subscription_id: subscription.id,
            amount: record.amount,
            provider_ref: record.provider_ref.clone(),
        });

        Ok(record)
    }

    /// 契約の決済履歴を取得する
    ///
    /// # 引数
    /// * `subscription_id` - 契約ID
    ///
    /// # 戻り値
    /// 決済日時の昇順の履歴。契約が存在しない場合はNotFound
    pub fn payment_history(&self, subscription_id: i64) -> AppResult<Vec<PaymentRecord>> {
        self.subscriptions.find_by_id(subscription_id)?;
        self.payments.find_by_subscription(subscription_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::payments::repository::SqlitePaymentRecordRepository;
    use crate::features::plans::models::Interval;
    use crate::features::subscriptions::models::CreateSubscriptionDto;
    use crate::features::subscriptions::repository::SqliteSubscriptionRepository;
    use crate::shared::database;
    use crate::shared::events;
    use rusqlite::Connection;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// テスト用のサービス一式を構築する
    fn test_service() -> (PaymentService, i64, UnboundedReceiver<DomainEvent>) {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        database::create_tables(&conn.lock().unwrap()).unwrap();

        let subscriptions = Arc::new(SqliteSubscriptionRepository::new(Arc::clone(&conn)));
        let subscription = subscriptions
            .create(&CreateSubscriptionDto {
                company_id: 1,
                plan_id: 1,
                interval: Interval::Month,
            })
            .unwrap();

        let (publisher, receiver) = events::channel();
        let service = PaymentService::new(
            Arc::new(SqlitePaymentRecordRepository::new(Arc::clone(&conn))),
            subscriptions,
            publisher,
        );

        (service, subscription.id, receiver)
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
    fn test_record_payment_and_history() {
        let (service, subscription_id, mut receiver) = test_service();

        let record = service
            .record_payment(&record_dto(subscription_id, "pi_001"))
            .unwrap();
        assert_eq!(record.provider_ref, "pi_001");

        let history = service.payment_history(subscription_id).unwrap();
        assert_eq!(history.len(), 1);

        // 記録イベントが発行されていることを確認
        let event = receiver.try_recv().unwrap();
        assert!(matches!(event, DomainEvent::PaymentRecorded { .. }));
    }

    #[test]
    fn test_record_payment_rejects_invalid_input() {
        let (service, subscription_id, _receiver) = test_service();

        // 金額が0以下はバリデーションエラー
        let mut dto = record_dto(subscription_id, "pi_001");
        dto.amount = 0.0;
        assert!(matches!(
            service.record_payment(&dto),
            Err(AppError::Validation(_))
        ));

        // 不正な参照形式もバリデーションエラー
        let dto = record_dto(subscription_id, "pi 001");
        assert!(matches!(
            service.record_payment(&dto),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_record_payment_unknown_subscription() {
        let (service, _, _receiver) = test_service();

        let result = service.record_payment(&record_dto(999, "pi_001"));
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_provider_ref_conflicts_and_emits_once() {
        let (service, subscription_id, mut receiver) = test_service();

        service
            .record_payment(&record_dto(subscription_id, "pi_001"))
            .unwrap();
        let second = service.record_payment(&record_dto(subscription_id, "pi_001"));
        assert!(matches!(second, Err(AppError::Conflict(_))));

        // 台帳は1件のまま、イベントも1件だけ
        assert_eq!(service.payment_history(subscription_id).unwrap().len(), 1);
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_history_for_unknown_subscription_is_not_found() {
        let (service, _, _receiver) = test_service();

        assert!(matches!(
            service.payment_history(999),
            Err(AppError::NotFound(_))
        ));
    }
}
