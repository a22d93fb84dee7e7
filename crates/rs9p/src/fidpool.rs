//! Per-connection fid table.
//!
//! Each fid a client has walked to or attached is kept here, keyed by the client-chosen
//! `u32`. The reference implementation's fid pool (`np_fidpool_create`/`np_fid_find`/
//! `np_fid_incref`/`np_fid_decref`) hands out a manually refcounted pointer so a fid
//! that's mid-operation on one task survives a concurrent `Tclunk` from another. Rust
//! already has a smart handle for exactly that: `Arc`. `find` and `create` clone it,
//! `decref` drops the table's own clone, and whoever (table or in-flight task) drops the
//! last handle frees the fid's backend state — no hand-rolled counter to keep in sync.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{error::Error, srv::FId};

/// A table of live fids for one connection.
pub struct FidPool<T> {
    table: RwLock<HashMap<u32, Arc<FId<T>>>>,
}

impl<T> Default for FidPool<T> {
    fn default() -> Self {
        FidPool {
            table: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Send + Sync + 'static> FidPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new fid. Fails with [`Error::FidInUse`] if `id` is already live, matching
    /// `Twalk`/`Tattach`'s requirement that `newfid` not collide with an open fid.
    pub async fn create(&self, id: u32, aux: T) -> Result<Arc<FId<T>>, Error> {
        let mut table = self.table.write().await;
        if table.contains_key(&id) {
            return Err(Error::FidInUse(id));
        }
        let fid = Arc::new(FId::new(id, aux));
        table.insert(id, fid.clone());
        Ok(fid)
    }

    /// Look up a live fid, failing with [`Error::NoFid`] otherwise.
    pub async fn find(&self, id: u32) -> Result<Arc<FId<T>>, Error> {
        self.table
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::NoFid(id))
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.table.read().await.contains_key(&id)
    }

    /// Remove `id` from the table, returning the table's own handle to it if present.
    /// Any handle a concurrent operation obtained via `find`/`create` keeps the `FId`
    /// alive until that operation finishes with it, so `Tclunk` never has to block on
    /// in-flight work.
    pub async fn decref(&self, id: u32) -> Option<Arc<FId<T>>> {
        self.table.write().await.remove(&id)
    }

    /// Number of fids currently open on this connection.
    pub async fn count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Drop every remaining fid (connection teardown). Returns how many were left
    /// un-clunked, which a caller can log as a leak.
    pub async fn destroy(&self) -> usize {
        let mut table = self.table.write().await;
        let n = table.len();
        table.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_find_returns_same_aux() {
        let pool: FidPool<u64> = FidPool::new();
        pool.create(1, 42).await.unwrap();
        let fid = pool.find(1).await.unwrap();
        assert_eq!(fid.aux, 42);
        assert_eq!(fid.fid(), 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_fid() {
        let pool: FidPool<u64> = FidPool::new();
        pool.create(1, 1).await.unwrap();
        let err = pool.create(1, 2).await.unwrap_err();
        assert!(matches!(err, Error::FidInUse(1)));
    }

    #[tokio::test]
    async fn find_missing_fid_errors() {
        let pool: FidPool<u64> = FidPool::new();
        let err = pool.find(99).await.unwrap_err();
        assert!(matches!(err, Error::NoFid(99)));
    }

    #[tokio::test]
    async fn decref_removes_from_table_but_outstanding_handle_survives() {
        let pool: FidPool<u64> = FidPool::new();
        pool.create(5, 7).await.unwrap();
        let held = pool.find(5).await.unwrap();

        let removed = pool.decref(5).await;
        assert!(removed.is_some());
        assert_eq!(pool.count().await, 0);

        // The handle obtained before decref is unaffected: clunk doesn't have to wait
        // on in-flight operations.
        assert_eq!(held.aux, 7);
        assert!(pool.find(5).await.is_err());
    }

    #[tokio::test]
    async fn count_tracks_creates_and_decrefs() {
        let pool: FidPool<u64> = FidPool::new();
        for i in 0..10 {
            pool.create(i, i as u64).await.unwrap();
        }
        assert_eq!(pool.count().await, 10);
        for i in 0..10 {
            pool.decref(i).await;
        }
        assert_eq!(pool.count().await, 0);
    }

    #[tokio::test]
    async fn destroy_reports_leaked_fid_count() {
        let pool: FidPool<u64> = FidPool::new();
        pool.create(1, 1).await.unwrap();
        pool.create(2, 2).await.unwrap();
        pool.decref(1).await;

        let leaked = pool.destroy().await;
        assert_eq!(leaked, 1);
        assert_eq!(pool.count().await, 0);
    }
}
