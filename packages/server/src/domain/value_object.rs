//! 値オブジェクト
//!
//! ストア、アクター、ワイヤプロトコルの間で共有する検証済みの型。

use std::fmt;

use sha2::{Digest, Sha256};

use super::error::ValueObjectError;

/// ユーザー名とチャット ID の最大長
pub const MAX_ID_LENGTH: usize = 32;
/// 表示名（ユーザーのニックネーム、チャット名）の最大長
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;
/// チャットメッセージの最大長
pub const MAX_CONTENT_LENGTH: usize = 2000;

/// 削除されたユーザーのメッセージに記録する予約済みユーザー名
pub const UNKNOWN_AUTHOR: &str = "unknown";

fn validate_identifier(kind: &'static str, value: &str) -> Result<(), ValueObjectError> {
    if value.is_empty() {
        return Err(ValueObjectError::Empty(kind));
    }
    if value.chars().count() > MAX_ID_LENGTH {
        return Err(ValueObjectError::TooLong(kind, MAX_ID_LENGTH));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValueObjectError::InvalidCharacters(kind));
    }
    Ok(())
}

/// ユーザーを一意に識別する不変の ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    /// 長さと文字種を検証してユーザー名を作成
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        validate_identifier("username", &value)?;
        if value == UNKNOWN_AUTHOR {
            return Err(ValueObjectError::Reserved(UNKNOWN_AUTHOR));
        }
        Ok(Self(value))
    }

    /// 削除済みユーザーのメッセージに記録するユーザー名
    pub fn unknown() -> Self {
        Self(UNKNOWN_AUTHOR.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// チャットルームの一意なキー
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// 長さと文字種を検証してチャット ID を作成
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        validate_identifier("chat id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ユーザーまたはチャットの表示名（一意ではない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName(String);

impl DisplayName {
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(ValueObjectError::Empty("name"));
        }
        if value.chars().count() > MAX_DISPLAY_NAME_LENGTH {
            return Err(ValueObjectError::TooLong("name", MAX_DISPLAY_NAME_LENGTH));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// チャットメッセージの本文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent(String);

impl MessageContent {
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        if value.trim().is_empty() {
            return Err(ValueObjectError::Empty("message"));
        }
        if value.chars().count() > MAX_CONTENT_LENGTH {
            return Err(ValueObjectError::TooLong("message", MAX_CONTENT_LENGTH));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 保存済みメッセージの行 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(i64);

impl MessageId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix タイムスタンプ（ミリ秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

/// ソルト付き SHA-256 ダイジェスト（16 進文字列）
///
/// ソルトは所有レコードのキー（ユーザー名またはチャット ID）。
/// 同じパスワードでもアカウントごとに異なるダイジェストになる。
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordDigest(String);

impl PasswordDigest {
    /// 平文パスワードをソルト付きでハッシュ化
    pub fn hash(salt: &str, password: &str) -> Self {
        let digest = Sha256::digest(format!("{salt}:{password}").as_bytes());
        Self(format!("{digest:x}"))
    }

    /// ストアから読み込んだダイジェストをラップ
    pub fn from_stored(digest: String) -> Self {
        Self(digest)
    }

    pub fn verify(&self, salt: &str, password: &str) -> bool {
        *self == Self::hash(salt, password)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ダイジェストはログに出さない
impl fmt::Debug for PasswordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordDigest(..)")
    }
}
