//! マネージャーと全ルームアクターが共有するストアハンドル
//!
//! ストアへのアクセスはすべてプロセス全体の `RwLock` を通します。
//! 参照は共有モード、追加・更新・削除は排他モードで行い、
//! ガードは 1 ステートメントの間だけ保持します:
//!
//! ```ignore
//! let user = store.read().await.get_user(&username).await;
//! ```

use std::{ops::Deref, sync::Arc};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::ChatStore;

/// プロセス全体の読み書きロックで保護された、複製可能なストアハンドル
#[derive(Clone)]
pub struct LockedStore {
    store: Arc<dyn ChatStore>,
    lock: Arc<RwLock<()>>,
}

/// 1 ステートメント分の共有アクセス
pub struct StoreReadGuard<'a> {
    store: &'a Arc<dyn ChatStore>,
    _guard: RwLockReadGuard<'a, ()>,
}

/// 1 ステートメント分の排他アクセス
pub struct StoreWriteGuard<'a> {
    store: &'a Arc<dyn ChatStore>,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl LockedStore {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// 共有（読み取り）モードで取得
    pub async fn read(&self) -> StoreReadGuard<'_> {
        StoreReadGuard {
            store: &self.store,
            _guard: self.lock.read().await,
        }
    }

    /// 排他（書き込み）モードで取得
    pub async fn write(&self) -> StoreWriteGuard<'_> {
        StoreWriteGuard {
            store: &self.store,
            _guard: self.lock.write().await,
        }
    }
}

impl Deref for StoreReadGuard<'_> {
    type Target = dyn ChatStore;

    fn deref(&self) -> &Self::Target {
        &**self.store
    }
}

impl Deref for StoreWriteGuard<'_> {
    type Target = dyn ChatStore;

    fn deref(&self) -> &Self::Target {
        &**self.store
    }
}
