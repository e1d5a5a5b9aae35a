// 通知サービスモジュール
//
// ドメインイベントを利用者向けのメッセージへ整形し、設定されたチャンネル
// （メール・SMS）で外部メッセンジャーゲートウェイへ引き渡す。
// 宛先の解決と実際の配送はゲートウェイ側の責務。

use crate::config::settings::{NotificationChannel, NotificationConfig};
use crate::shared::events::DomainEvent;
use log::{debug, error, info};
use std::time::Duration;

/// 通知メッセージ
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NotificationMessage {
    pub company_id: i64,
    pub subject: String,
    pub body: String,
}

/// 通知サービス
#[derive(Debug, Clone)]
pub struct Notifier {
    channel: NotificationChannel,
    gateway_url: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    /// 設定から通知サービスを構築する
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            channel: config.channel,
            gateway_url: config.gateway_url.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// ドメインイベントを通知として配送する
    ///
    /// 利用者向けでないイベントは何もしない。配送の失敗は呼び出し元の
    /// 処理を妨げないよう、エラーログに記録するだけに留める。
    pub async fn dispatch(&self, event: &DomainEvent) {
        let message = match render(event) {
            Some(message) => message,
            None => return,
        };

        if self.channel == NotificationChannel::None {
            debug!(
                "通知チャンネルが無効のためログのみ: company={}, subject={}",
                message.company_id, message.subject
            );
            return;
        }

        let gateway_url = match &self.gateway_url {
            Some(url) => url,
            None => {
                info!(
                    "メッセンジャーゲートウェイ未設定のためログのみ: company={}, subject={}",
                    message.company_id, message.subject
                );
                return;
            }
        };

        let payload = serde_json::json!({
            "channel": self.channel.as_str(),
            "company_id": message.company_id,
            "subject": message.subject,
            "message": message.body,
        });

        let result = self
            .http
            .post(gateway_url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(
                    "通知を送信しました: company={}, subject={}",
                    message.company_id, message.subject
                );
            }
            Ok(response) => {
                error!(
                    "通知の送信がゲートウェイに拒否されました: status={}, company={}",
                    response.status(),
                    message.company_id
                );
            }
            Err(e) => {
                error!(
                    "通知の送信に失敗しました: company={}, error={}",
                    message.company_id, e
                );
            }
        }
    }
}

/// イベントを利用者向けメッセージへ整形する
///
/// # 戻り値
/// 利用者向けの通知が不要なイベントの場合はNone
fn render(event: &DomainEvent) -> Option<NotificationMessage> {
    match event {
        DomainEvent::SubscriptionCreated {
            company_id,
            plan_name,
            ..
        } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "契約を受け付けました".to_string(),
            body: format!(
                "{plan_name} プランの契約を受け付けました。決済の確認後に有効化されます。"
            ),
        }),
        DomainEvent::SubscriptionActivated { company_id, .. } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "契約が有効になりました".to_string(),
            body: "契約が有効になりました。すべての機能をご利用いただけます。".to_string(),
        }),
        DomainEvent::SubscriptionCancelled { company_id, .. } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "契約を解約しました".to_string(),
            body: "契約の解約を受け付けました。ご利用ありがとうございました。".to_string(),
        }),
        DomainEvent::SubscriptionPlanChanged {
            company_id,
            new_plan_name,
            ..
        } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "プランを変更しました".to_string(),
            body: format!("契約プランを {new_plan_name} に変更しました。"),
        }),
        DomainEvent::SubscriptionExpired { company_id, .. } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "契約が期限切れになりました".to_string(),
            body: "契約が更新されなかったため期限切れになりました。継続利用には再契約が必要です。"
                .to_string(),
        }),
        DomainEvent::RenewalApproaching {
            company_id,
            renewal_date,
            ..
        } => Some(NotificationMessage {
            company_id: *company_id,
            subject: "契約の更新日が近づいています".to_string(),
            body: format!(
                "契約の更新日（{}）が近づいています。継続利用には更新手続きが必要です。",
                renewal_date.format("%Y-%m-%d")
            ),
        }),
        // 決済記録は内部イベントであり、利用者への通知は行わない
        DomainEvent::PaymentRecorded { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_render_renewal_approaching_includes_date() {
        let renewal_date = Utc::now();
        let message = render(&DomainEvent::RenewalApproaching {
            subscription_id: 1,
            company_id: 42,
            renewal_date,
        })
        .unwrap();

        assert_eq!(message.company_id, 42);
        assert!(message
            .body
            .contains(&renewal_date.format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn test_render_payment_recorded_is_silent() {
        // 決済記録イベントは利用者向け通知を生成しない
        let message = render(&DomainEvent::PaymentRecorded {
            subscription_id: 1,
            amount: 19.90,
            provider_ref: "pi_001".to_string(),
        });
        assert!(message.is_none());
    }

    #[test]
    fn test_render_created_mentions_plan() {
        let message = render(&DomainEvent::SubscriptionCreated {
            subscription_id: 1,
            company_id: 7,
            plan_name: "Premium".to_string(),
        })
        .unwrap();
        assert!(message.body.contains("Premium"));
    }

    #[tokio::test]
    async fn test_dispatch_without_gateway_is_noop() {
        // ゲートウェイ未設定でもエラーにならない
        let notifier = Notifier::new(&NotificationConfig {
            channel: NotificationChannel::Email,
            gateway_url: None,
        });

        notifier
            .dispatch(&DomainEvent::SubscriptionActivated {
                subscription_id: 1,
                company_id: 1,
            })
            .await;
    }
}
