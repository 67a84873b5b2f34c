//! ドメイン層のエラー型

use thiserror::Error;

/// 値オブジェクトの検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueObjectError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be at most {1} characters")]
    TooLong(&'static str, usize),

    #[error("{0} may only contain letters, digits, '_', '-' and '.'")]
    InvalidCharacters(&'static str),

    #[error("'{0}' is reserved")]
    Reserved(&'static str),
}

/// [`ChatStore`](super::ChatStore) 実装が返すエラー
///
/// `NotFound` は一般的なバックエンド障害と常に区別する。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// 要求されたレコードが存在しない
    #[error("record not found")]
    NotFound,

    /// 一意キーが使用済み
    #[error("record already exists")]
    Conflict,

    /// RESTRICT または外部キー制約で拒否された
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// その他のストレージ障害
    #[error("storage failure: {0}")]
    Backend(String),
}
