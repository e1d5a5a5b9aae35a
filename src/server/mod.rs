// HTTPインターフェースモジュール
//
// 各操作を1:1でRESTスタイルのルートへ対応付ける。ドメインエラーは
// 安定したエラーコード付きのJSONへ変換し、内部表現は公開しない。

use crate::features::{payments, plans, subscriptions};
use crate::shared::errors::{AppError, AppResult, ErrorSeverity};
use crate::AppContext;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// HTTPサーバーを起動し、シャットダウンが要求されるまでリクエストを処理する
///
/// # 引数
/// * `ctx` - アプリケーションコンテキスト
/// * `shutdown` - シャットダウン用のキャンセルトークン
pub async fn run(ctx: Arc<AppContext>, shutdown: CancellationToken) -> AppResult<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .map_err(|e| AppError::configuration(format!("待ち受けアドレスが不正です: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTPサーバーを開始しました: http://{addr}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("シャットダウン要求を受信したため、サーバーを停止します");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx).await {
                                log::error!("接続処理エラー: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("接続受け入れエラー: {e}");
                    }
                }
            }
        }
    }
}

/// TCP接続を処理する
async fn handle_connection(
    stream: tokio::net::TcpStream,
    ctx: Arc<AppContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| handle_request(req, Arc::clone(&ctx)));

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        log::error!("HTTP接続処理エラー: {err}");
    }

    Ok(())
}

/// HTTPリクエストを処理する
async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<AppContext>,
) -> Result<Response<String>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    log::debug!("リクエストを受信: {method} {path}");

    let response = match route(req, &ctx).await {
        Ok((status, body)) => json_response(status, &body),
        Err(e) => {
            // 重大なエラーのみ詳細をログへ（レスポンスには内部表現を載せない）
            if e.severity() == ErrorSeverity::High {
                log::error!("{method} {path} の処理に失敗しました: {e}");
            } else {
                log::debug!("{method} {path} がエラーを返しました: {e}");
            }

            let body = json!({
                "code": e.error_code(),
                "message": e.user_message(),
            });
            json_response(status_for(&e), &body)
        }
    };

    Ok(response)
}

/// リクエストを各操作へ振り分ける
async fn route(req: Request<Incoming>, ctx: &AppContext) -> AppResult<(StatusCode, Value)> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments = path_segments(&path);

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok((StatusCode::OK, json!({ "status": "ok" }))),

        // プランカタログ
        (&Method::GET, ["plans"]) => plans::handlers::list_plans(ctx),
        (&Method::GET, ["plans", id]) => plans::handlers::get_plan(ctx, parse_id(id)?),

        // 契約ライフサイクル
        (&Method::POST, ["subscriptions"]) => {
            let body = read_body(req).await?;
            subscriptions::handlers::create_subscription(ctx, &body)
        }
        (&Method::GET, ["subscriptions", id]) => {
            subscriptions::handlers::get_subscription(ctx, parse_id(id)?)
        }
        (&Method::POST, ["subscriptions", id, "activate"]) => {
            subscriptions::handlers::activate_subscription(ctx, parse_id(id)?).await
        }
        (&Method::POST, ["subscriptions", id, "cancel"]) => {
            subscriptions::handlers::cancel_subscription(ctx, parse_id(id)?).await
        }
        (&Method::POST, ["subscriptions", id, "change-plan"]) => {
            let id = parse_id(id)?;
            let body = read_body(req).await?;
            subscriptions::handlers::change_subscription_plan(ctx, id, &body).await
        }
        (&Method::GET, ["companies", company_id, "subscription"]) => {
            subscriptions::handlers::get_company_subscription(ctx, parse_id(company_id)?)
        }

        // 決済台帳
        (&Method::POST, ["payments"]) => {
            let body = read_body(req).await?;
            payments::handlers::record_payment(ctx, &body).await
        }
        (&Method::GET, ["subscriptions", id, "payments"]) => {
            payments::handlers::payment_history(ctx, parse_id(id)?)
        }

        _ => Err(AppError::NotFound("リクエストされたパスは存在しません".to_string())),
    }
}

/// パスをセグメントに分割する
fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// パスセグメントをIDとして解析する
fn parse_id(value: &str) -> AppResult<i64> {
    value
        .parse()
        .map_err(|_| AppError::validation(format!("IDの形式が不正です: {value}")))
}

/// リクエストボディを読み取る
async fn read_body(req: Request<Incoming>) -> AppResult<Vec<u8>> {
    let collected = req
        .into_body()
        .collect()
        .await
        .map_err(|e| AppError::validation(format!("リクエストボディの読み取りに失敗: {e}")))?;

    Ok(collected.to_bytes().to_vec())
}

/// JSONレスポンスを構築する
fn json_response(status: StatusCode, body: &Value) -> Response<String> {
    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// エラーをHTTPステータスへ対応付ける
fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::InvalidState(_) => StatusCode::CONFLICT,
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Json(_) => StatusCode::BAD_REQUEST,
        AppError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("/plans"), vec!["plans"]);
        assert_eq!(
            path_segments("/subscriptions/42/activate"),
            vec!["subscriptions", "42", "activate"]
        );
        assert_eq!(path_segments("/"), Vec::<&str>::new());
        // 末尾スラッシュは無視される
        assert_eq!(path_segments("/plans/"), vec!["plans"]);
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("42").unwrap(), 42);
        assert!(matches!(parse_id("abc"), Err(AppError::Validation(_))));
        assert!(matches!(parse_id(""), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_status_for_error_mapping() {
        assert_eq!(
            status_for(&AppError::not_found("契約")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AppError::conflict("重複")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AppError::invalid_state("expired", "active")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AppError::validation("不正")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AppError::provider("接続失敗")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&AppError::Database("詳細".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_response_sets_content_type() {
        let response = json_response(StatusCode::OK, &json!({ "status": "ok" }));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "application/json"
        );
        assert!(response.body().contains("ok"));
    }
}
