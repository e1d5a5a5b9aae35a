use super::models::{ChangePlanDto, CreateSubscriptionDto, Subscription};
use crate::shared::errors::{AppError, AppResult};
use crate::AppContext;
use hyper::StatusCode;
use serde_json::{json, Value};

/// 契約を作成する
///
/// POST /subscriptions
pub fn create_subscription(ctx: &AppContext, body: &[u8]) -> AppResult<(StatusCode, Value)> {
    let dto: CreateSubscriptionDto = serde_json::from_slice(body)?;
    let subscription = ctx.subscriptions.create(&dto)?;
    Ok((StatusCode::CREATED, subscription_payload(ctx, &subscription)?))
}

/// 契約を1件返す
///
/// GET /subscriptions/{id}
pub fn get_subscription(ctx: &AppContext, id: i64) -> AppResult<(StatusCode, Value)> {
    let subscription = ctx.subscriptions.get(id)?;
    Ok((StatusCode::OK, subscription_payload(ctx, &subscription)?))
}

/// 企業の非終端契約を返す
///
/// GET /companies/{company_id}/subscription
pub fn get_company_subscription(
    ctx: &AppContext,
    company_id: i64,
) -> AppResult<(StatusCode, Value)> {
    let subscription = ctx
        .subscriptions
        .get_company_subscription(company_id)?
        .ok_or_else(|| AppError::not_found(format!("企業ID {company_id} の契約")))?;
    Ok((StatusCode::OK, subscription_payload(ctx, &subscription)?))
}

/// 契約を有効化する（冪等）
///
/// POST /subscriptions/{id}/activate
pub async fn activate_subscription(ctx: &AppContext, id: i64) -> AppResult<(StatusCode, Value)> {
    let subscription = ctx.subscriptions.activate(id).await?;
    Ok((StatusCode::OK, subscription_payload(ctx, &subscription)?))
}

/// 契約を解約する
///
/// POST /subscriptions/{id}/cancel
pub async fn cancel_subscription(ctx: &AppContext, id: i64) -> AppResult<(StatusCode, Value)> {
    let subscription = ctx.subscriptions.cancel(id).await?;
    Ok((StatusCode::OK, subscription_payload(ctx, &subscription)?))
}

/// 契約のプランを変更する
///
/// POST /subscriptions/{id}/change-plan
pub async fn change_subscription_plan(
    ctx: &AppContext,
    id: i64,
    body: &[u8],
) -> AppResult<(StatusCode, Value)> {
    let dto: ChangePlanDto = serde_json::from_slice(body)?;
    let subscription = ctx.subscriptions.change_plan(id, dto.plan_id).await?;
    Ok((StatusCode::OK, subscription_payload(ctx, &subscription)?))
}

/// 契約にプラン概要を添えたレスポンスを組み立てる
fn subscription_payload(ctx: &AppContext, subscription: &Subscription) -> AppResult<Value> {
    let plan = ctx.plans.find_by_id(subscription.plan_id)?;

    let mut payload = serde_json::to_value(subscription)?;
    payload["plan"] = json!({
        "id": plan.id,
        "name": plan.name,
        "description": plan.description,
    });

    Ok(payload)
}
