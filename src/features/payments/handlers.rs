use super::models::RecordPaymentDto;
use crate::features::subscriptions::models::SubscriptionStatus;
use crate::shared::errors::AppResult;
use crate::AppContext;
use hyper::StatusCode;
use log::warn;
use serde_json::{json, Value};

/// プロバイダの決済確認を台帳へ記録する
///
/// POST /payments
///
/// 決済の成立が有効化のトリガーとなるため、記録後に契約がまだpendingで
/// あれば有効化する。有効化は冪等なので、プロバイダのWebhook再送で
/// このエンドポイントが複数回呼ばれても安全（2回目以降は台帳が競合を返す）。
pub async fn record_payment(ctx: &AppContext, body: &[u8]) -> AppResult<(StatusCode, Value)> {
    let dto: RecordPaymentDto = serde_json::from_slice(body)?;
    let record = ctx.payments.record_payment(&dto)?;

    let subscription = ctx.subscriptions.get(record.subscription_id)?;
    if subscription.status == SubscriptionStatus::Pending {
        if let Err(e) = ctx.subscriptions.activate(subscription.id).await {
            // 記録自体は成功しているため、有効化の失敗は照合ログに残すだけにする
            warn!(
                "決済記録後の契約有効化に失敗しました: subscription={}, error={e}",
                subscription.id
            );
        }
    }

    Ok((StatusCode::CREATED, serde_json::to_value(record)?))
}

/// 契約の決済履歴を返す
///
/// GET /subscriptions/{id}/payments
pub fn payment_history(ctx: &AppContext, subscription_id: i64) -> AppResult<(StatusCode, Value)> {
    let records = ctx.payments.payment_history(subscription_id)?;
    Ok((StatusCode::OK, json!({ "payments": records })))
}
