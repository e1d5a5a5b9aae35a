use crate::shared::errors::{AppError, AppResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// 外部プロバイダ呼び出しのリトライポリシー
///
/// 遅延は試行ごとに指数的に増加し、`max_delay_ms` で頭打ちになる。
/// 同時リトライの集中を避けるため、各遅延にジッターを加える。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
    /// 初回リトライまでの遅延（ミリ秒）
    pub base_delay_ms: u64,
    /// 遅延の上限（ミリ秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// 指定した試行回数に対する遅延を計算する
    ///
    /// # 引数
    /// * `attempt` - 失敗した試行の番号（1始まり）
    ///
    /// # 戻り値
    /// ジッターを含む待機時間
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay_ms);

        // 0〜25%のジッターを加算（上限は超えない）
        let jitter = rand::thread_rng().gen_range(0..=exponential / 4);
        Duration::from_millis(exponential.saturating_add(jitter).min(self.max_delay_ms))
    }
}

/// 操作を指数バックオフ付きでリトライする
///
/// `retryable` が true を返すエラーのみリトライ対象となり、
/// それ以外のエラーは即座に返される。試行回数を使い切った場合は
/// 最後のエラーをそのまま返す（呼び出し側で照合ログを残すこと）。
///
/// # 引数
/// * `policy` - リトライポリシー
/// * `operation_name` - ログ用の操作名
/// * `retryable` - リトライ対象かどうかの判定関数
/// * `operation` - 実行する操作
pub async fn retry_with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: R,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
    R: Fn(&AppError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{operation_name}: {attempt}回目の試行で成功しました");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = policy.delay_for_attempt(attempt);
                log::warn!(
                    "{operation_name}: 試行{attempt}/{max_attempts}が失敗しました（{delay:?}後に再試行）: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("リトライループは必ずOkかErrで抜ける");
}
