//! Client-side fid allocator.
//!
//! The fid space is 32 bits, too large to track with a bitmap the way [`crate::tagpool`]
//! tracks the 16-bit tag space, so this is a bump allocator with a free list instead:
//! structurally the same role as `Npcpool` played for fids in the original client
//! (`npc_fid_alloc`/`npc_fid_free`), just sized for the space it actually covers.

use tokio::sync::Mutex;

struct Inner {
    next: u32,
    free: Vec<u32>,
}

pub struct FidPool {
    inner: Mutex<Inner>,
}

impl Default for FidPool {
    fn default() -> Self {
        FidPool {
            inner: Mutex::new(Inner {
                next: 0,
                free: Vec::new(),
            }),
        }
    }
}

impl FidPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alloc(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        if let Some(fid) = inner.free.pop() {
            return fid;
        }
        let fid = inner.next;
        inner.next = inner.next.checked_add(1).expect("client fid space exhausted");
        fid
    }

    pub async fn free(&self, fid: u32) {
        self.inner.lock().await.free.push(fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_fids() {
        let pool = FidPool::new();
        let a = pool.alloc().await;
        let b = pool.alloc().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn freed_fid_is_reused() {
        let pool = FidPool::new();
        let a = pool.alloc().await;
        pool.free(a).await;
        let b = pool.alloc().await;
        assert_eq!(a, b);
    }
}
