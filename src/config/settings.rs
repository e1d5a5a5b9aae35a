// アプリケーション設定管理モジュール

use super::environment::{self, Environment};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::retry::RetryPolicy;
use log::{info, warn};
use std::env;
use std::path::PathBuf;

/// HTTPサーバー設定
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 期限切れスキャナー設定
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// 更新日の何日前から通知対象にするか
    pub lookahead_days: i64,
}

/// 決済プロバイダ連携設定
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// プロバイダAPIのベースURL（未設定の場合は連携無効）
    pub base_url: Option<String>,
    /// API認証用のシークレットキー
    pub secret_key: Option<String>,
    /// リクエストタイムアウト（秒）
    pub timeout_secs: u64,
    /// リトライポリシー
    pub retry: RetryPolicy,
}

/// 通知チャンネルの選択肢
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    /// メール通知（メッセンジャーゲートウェイ経由）
    Email,
    /// SMS通知（メッセンジャーゲートウェイ経由）
    Sms,
    /// 通知なし（ログのみ）
    None,
}

impl NotificationChannel {
    /// 設定値の文字列からチャンネルを解析する
    ///
    /// # 引数
    /// * `value` - "email" / "sms" / "none" のいずれか
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "email" => Ok(NotificationChannel::Email),
            "sms" => Ok(NotificationChannel::Sms),
            "none" => Ok(NotificationChannel::None),
            other => Err(AppError::configuration(format!(
                "通知チャンネルは email / sms / none のいずれかです: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::None => "none",
        }
    }
}

/// 通知設定
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub channel: NotificationChannel,
    /// 外部メッセンジャーゲートウェイのURL（未設定の場合はログのみ）
    pub gateway_url: Option<String>,
}

/// アプリケーション全体の設定
///
/// グローバルな設定オブジェクトの代わりに、起動時に構築して
/// 各コンポーネントへ明示的に引き渡す。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub database_path: PathBuf,
    pub log_level: String,
    pub server: ServerConfig,
    pub expiry: ExpiryConfig,
    pub provider: ProviderConfig,
    pub notification: NotificationConfig,
}

impl AppConfig {
    /// 環境変数から設定を読み込む
    ///
    /// # 戻り値
    /// 構築済みの設定、または失敗時はエラー
    pub fn from_env() -> AppResult<Self> {
        let environment = environment::get_environment();

        let database_path = match env::var("STOCKPLUS_DATABASE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_database_path(environment)?,
        };

        let log_level = env::var("STOCKPLUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let server = ServerConfig {
            host: env::var("STOCKPLUS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("STOCKPLUS_PORT", 8080)?,
        };

        let expiry = ExpiryConfig {
            lookahead_days: parse_env("STOCKPLUS_EXPIRY_LOOKAHEAD_DAYS", 3)?,
        };

        let provider = ProviderConfig {
            base_url: env::var("STOCKPLUS_PROVIDER_URL").ok(),
            secret_key: env::var("STOCKPLUS_PROVIDER_SECRET_KEY").ok(),
            timeout_secs: parse_env("STOCKPLUS_PROVIDER_TIMEOUT_SECS", 30)?,
            retry: RetryPolicy {
                max_attempts: parse_env("STOCKPLUS_PROVIDER_MAX_ATTEMPTS", 3)?,
                base_delay_ms: parse_env("STOCKPLUS_PROVIDER_RETRY_BASE_MS", 500)?,
                max_delay_ms: parse_env("STOCKPLUS_PROVIDER_RETRY_MAX_MS", 5_000)?,
            },
        };

        let channel = match env::var("STOCKPLUS_NOTIFICATION_CHANNEL") {
            Ok(value) => NotificationChannel::parse(&value)?,
            Err(_) => NotificationChannel::Email,
        };
        let notification = NotificationConfig {
            channel,
            gateway_url: env::var("STOCKPLUS_MESSENGER_URL").ok(),
        };

        let config = Self {
            environment,
            database_path,
            log_level,
            server,
            expiry,
            provider,
            notification,
        };
        config.validate()?;

        info!(
            "設定を読み込みました: environment={:?}, database={:?}, port={}",
            config.environment, config.database_path, config.server.port
        );

        Ok(config)
    }

    /// 設定の検証
    ///
    /// # 戻り値
    /// 成功時はOk(())、失敗時はエラー
    pub fn validate(&self) -> AppResult<()> {
        if self.expiry.lookahead_days < 0 {
            return Err(AppError::configuration(
                "期限切れ通知の先読み日数は0以上である必要があります",
            ));
        }

        if self.provider.timeout_secs == 0 {
            return Err(AppError::configuration(
                "プロバイダのタイムアウトは1秒以上である必要があります",
            ));
        }

        if self.provider.retry.max_attempts == 0 {
            return Err(AppError::configuration(
                "プロバイダの最大試行回数は1以上である必要があります",
            ));
        }

        // プロバイダURLだけ設定されてキーがない場合は警告（連携は無効になる）
        if self.provider.base_url.is_some() && self.provider.secret_key.is_none() {
            warn!("STOCKPLUS_PROVIDER_SECRET_KEY が未設定のため、決済プロバイダ連携は無効になります");
        }

        if self.notification.channel != NotificationChannel::None
            && self.notification.gateway_url.is_none()
        {
            warn!("STOCKPLUS_MESSENGER_URL が未設定のため、通知はログ出力のみになります");
        }

        Ok(())
    }
}

/// 環境変数を解析するヘルパー関数
///
/// # 引数
/// * `name` - 環境変数名
/// * `default` - 未設定時のデフォルト値
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| AppError::configuration(format!("{name} の値が不正です: {value}"))),
        Err(_) => Ok(default),
    }
}

/// デフォルトのデータベースパスを取得する
///
/// # 引数
/// * `env` - 実行環境
///
/// # 戻り値
/// アプリデータディレクトリ配下のデータベースファイルパス
fn default_database_path(env: Environment) -> AppResult<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| AppError::configuration("アプリデータディレクトリを取得できません"))?;

    Ok(data_dir
        .join("stockplus")
        .join(environment::get_database_filename(env)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_channel_parse() {
        assert_eq!(
            NotificationChannel::parse("email").unwrap(),
            NotificationChannel::Email
        );
        assert_eq!(
            NotificationChannel::parse("sms").unwrap(),
            NotificationChannel::Sms
        );
        assert_eq!(
            NotificationChannel::parse("none").unwrap(),
            NotificationChannel::None
        );

        // 不正な値はエラー
        assert!(NotificationChannel::parse("slack").is_err());
    }

    #[test]
    fn test_validate_rejects_negative_lookahead() {
        let mut config = test_config();
        config.expiry.lookahead_days = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = test_config();
        config.provider.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    /// テスト用の設定を構築する
    fn test_config() -> AppConfig {
        AppConfig {
            environment: Environment::Development,
            database_path: PathBuf::from(":memory:"),
            log_level: "info".to_string(),
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            expiry: ExpiryConfig { lookahead_days: 3 },
            provider: ProviderConfig {
                base_url: None,
                secret_key: None,
                timeout_secs: 30,
                retry: RetryPolicy::default(),
            },
            notification: NotificationConfig {
                channel: NotificationChannel::None,
                gateway_url: None,
            },
        }
    }
}
