use crate::shared::errors::AppResult;
use crate::AppContext;
use hyper::StatusCode;
use serde_json::{json, Value};

/// アクティブなプラン一覧を返す
///
/// GET /plans
pub fn list_plans(ctx: &AppContext) -> AppResult<(StatusCode, Value)> {
    let plans = ctx.plans.find_all_active()?;
    Ok((StatusCode::OK, json!({ "plans": plans })))
}

/// プランを1件返す
///
/// GET /plans/{id}
pub fn get_plan(ctx: &AppContext, id: i64) -> AppResult<(StatusCode, Value)> {
    let plan = ctx.plans.find_by_id(id)?;
    Ok((StatusCode::OK, serde_json::to_value(plan)?))
}
