use crate::features::notifications::service::Notifier;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// ライフサイクル遷移・台帳追記が発行するドメインイベント
///
/// フレームワークのシグナルフックの代わりに、明示的なメッセージパッシングで
/// 通知・課金連携へ伝搬する。発行側はブロックしない。
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// 契約が作成された（pending）
    SubscriptionCreated {
        subscription_id: i64,
        company_id: i64,
        plan_name: String,
    },
    /// 契約が有効化された
    SubscriptionActivated {
        subscription_id: i64,
        company_id: i64,
    },
    /// 契約が解約された
    SubscriptionCancelled {
        subscription_id: i64,
        company_id: i64,
    },
    /// 契約のプランが変更された
    SubscriptionPlanChanged {
        subscription_id: i64,
        company_id: i64,
        old_plan_name: String,
        new_plan_name: String,
    },
    /// 契約が期限切れになった
    SubscriptionExpired {
        subscription_id: i64,
        company_id: i64,
    },
    /// 更新日が近づいている（期限切れスキャナーが発行）
    RenewalApproaching {
        subscription_id: i64,
        company_id: i64,
        renewal_date: DateTime<Utc>,
    },
    /// 決済が台帳に記録された
    PaymentRecorded {
        subscription_id: i64,
        amount: f64,
        provider_ref: String,
    },
}

/// ドメインイベントの発行側
///
/// クローン可能で、各サービスが保持する。キューが閉じている場合は
/// 警告ログに落とすだけでエラーにはしない。
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<DomainEvent>,
}

impl EventPublisher {
    /// イベントを発行する
    pub fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("イベントキューが閉じているため配送をスキップします: {e}");
        }
    }
}

/// イベントチャンネルを作成する
///
/// # 戻り値
/// (発行側, 消費側) のペア
pub fn channel() -> (EventPublisher, mpsc::UnboundedReceiver<DomainEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventPublisher { sender }, receiver)
}

/// イベントワーカーを実行する
///
/// キューからイベントを取り出し、通知サービスへ順に引き渡す。
/// すべての発行側がドロップされると自然に終了するため、
/// コマンド実行後のドレインは await するだけでよい。
pub async fn run_event_worker(mut receiver: mpsc::UnboundedReceiver<DomainEvent>, notifier: Notifier) {
    while let Some(event) = receiver.recv().await {
        log::debug!("ドメインイベントを受信: {event:?}");
        notifier.dispatch(&event).await;
    }
    log::debug!("イベントキューが空になったためワーカーを終了します");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        // 発行したイベントが同じ順序で届くことをテスト
        let (publisher, mut receiver) = channel();

        publisher.publish(DomainEvent::SubscriptionCreated {
            subscription_id: 1,
            company_id: 10,
            plan_name: "Starter".to_string(),
        });
        publisher.publish(DomainEvent::SubscriptionActivated {
            subscription_id: 1,
            company_id: 10,
        });
        drop(publisher);

        let first = receiver.recv().await.unwrap();
        assert!(matches!(first, DomainEvent::SubscriptionCreated { .. }));
        let second = receiver.recv().await.unwrap();
        assert!(matches!(second, DomainEvent::SubscriptionActivated { .. }));
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn test_publish_after_receiver_dropped_does_not_panic() {
        // 消費側が先に終了していても発行はエラーにならない
        let (publisher, receiver) = channel();
        drop(receiver);

        publisher.publish(DomainEvent::SubscriptionExpired {
            subscription_id: 2,
            company_id: 20,
        });
    }
}
