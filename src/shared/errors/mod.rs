use thiserror::Error;

/// アプリケーション全体で使用される統一エラー型
#[derive(Debug, Error)]
pub enum AppError {
    /// リソースが見つからない場合のエラー
    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    /// リソースの重複・競合エラー（契約の二重作成、決済参照の重複など）
    #[error("競合エラー: {0}")]
    Conflict(String),

    /// 現在のステータスから許可されない遷移
    #[error("状態遷移エラー: {0}")]
    InvalidState(String),

    /// バリデーション関連のエラー
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    /// 決済プロバイダ連携でのエラー
    #[error("決済プロバイダエラー: {0}")]
    Provider(String),

    /// データベース関連のエラー
    #[error("データベースエラー: {0}")]
    Database(String),

    /// 設定関連のエラー
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// 並行処理関連のエラー
    #[error("並行処理エラー: {0}")]
    Concurrency(String),

    /// I/O関連のエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    /// JSON解析エラー
    #[error("JSON解析エラー: {0}")]
    Json(#[from] serde_json::Error),
}

/// エラーの重要度を表す列挙型
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    /// 低重要度（ユーザー入力エラーなど）
    Low,
    /// 中重要度（外部サービス一時的エラーなど）
    Medium,
    /// 高重要度（データベースエラーなど）
    High,
}

impl AppError {
    /// APIレスポンスに載せる安定したエラーコードを取得
    ///
    /// # 戻り値
    /// インターフェース層がそのまま公開できるコード文字列
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Validation(_) => "validation_error",
            AppError::Provider(_) => "provider_error",
            AppError::Database(_) => "internal_error",
            AppError::Configuration(_) => "internal_error",
            AppError::Concurrency(_) => "internal_error",
            AppError::Io(_) => "internal_error",
            AppError::Json(_) => "validation_error",
        }
    }

    /// ユーザーに表示するためのメッセージを取得
    ///
    /// # 戻り値
    /// 内部表現を含まない、ユーザーに表示可能なエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            AppError::NotFound(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::InvalidState(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Provider(_) => "決済プロバイダとの通信でエラーが発生しました".to_string(),
            AppError::Database(_) => "データベース操作でエラーが発生しました".to_string(),
            AppError::Configuration(_) => "設定エラーが発生しました".to_string(),
            AppError::Concurrency(_) => "並行処理でエラーが発生しました".to_string(),
            AppError::Io(_) => "ファイル操作でエラーが発生しました".to_string(),
            AppError::Json(_) => "データ形式の解析でエラーが発生しました".to_string(),
        }
    }

    /// エラーの重要度を取得
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::NotFound(_) => ErrorSeverity::Low,
            AppError::Conflict(_) => ErrorSeverity::Low,
            AppError::InvalidState(_) => ErrorSeverity::Low,
            AppError::Validation(_) => ErrorSeverity::Low,
            AppError::Provider(_) => ErrorSeverity::Medium,
            AppError::Database(_) => ErrorSeverity::High,
            AppError::Configuration(_) => ErrorSeverity::High,
            AppError::Concurrency(_) => ErrorSeverity::High,
            AppError::Io(_) => ErrorSeverity::Medium,
            AppError::Json(_) => ErrorSeverity::Medium,
        }
    }

    /// リソース未発見エラーを作成するヘルパー関数
    ///
    /// # 引数
    /// * `resource` - 見つからなかったリソース名
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        AppError::NotFound(format!("{}が見つかりません", resource.into()))
    }

    /// 競合エラーを作成するヘルパー関数
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        AppError::Conflict(message.into())
    }

    /// 状態遷移エラーを作成するヘルパー関数
    ///
    /// # 引数
    /// * `current` - 現在のステータス
    /// * `target` - 遷移しようとしたステータス
    pub fn invalid_state<S: Into<String>>(current: S, target: S) -> Self {
        AppError::InvalidState(format!(
            "ステータス {} から {} への遷移は許可されていません",
            current.into(),
            target.into()
        ))
    }

    /// バリデーションエラーを作成するヘルパー関数
    pub fn validation<S: Into<String>>(message: S) -> Self {
        AppError::Validation(message.into())
    }

    /// 決済プロバイダエラーを作成するヘルパー関数
    pub fn provider<S: Into<String>>(message: S) -> Self {
        AppError::Provider(message.into())
    }

    /// 設定エラーを作成するヘルパー関数
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        AppError::Configuration(message.into())
    }

    /// 並行処理エラーを作成するヘルパー関数
    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        AppError::Concurrency(message.into())
    }
}

/// rusqlite::ErrorからAppErrorへの変換
///
/// UNIQUE制約違反は台帳の冪等性・契約の一意性を守る仕組みなので、
/// Databaseではなく競合エラーとして扱う。
impl From<rusqlite::Error> for AppError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict("一意性制約に違反しています".to_string())
            }
            _ => AppError::Database(error.to_string()),
        }
    }
}

/// Result型のエイリアス（アプリケーション全体で使用）
pub type AppResult<T> = Result<T, AppError>;
