//! Client-side tag allocator.
//!
//! Mirrors `Npcpool` (`npcimpl.h`'s `maxid`/`map` bitmap, grown generically to back both
//! the tag pool and the fid pool in the original client library) scoped to the 16-bit tag
//! space. `NOTAG` is never handed out since it's reserved for `Tversion`.

use tokio::sync::Mutex;

use rs9p::{error::Error, NOTAG};

const TAG_COUNT: usize = NOTAG as usize;
const WORD_BITS: usize = 64;
const WORDS: usize = (TAG_COUNT + WORD_BITS - 1) / WORD_BITS;

struct Inner {
    bits: Vec<u64>,
    cursor: usize,
}

pub struct TagPool {
    inner: Mutex<Inner>,
}

impl Default for TagPool {
    fn default() -> Self {
        TagPool {
            inner: Mutex::new(Inner {
                bits: vec![0u64; WORDS],
                cursor: 0,
            }),
        }
    }
}

impl TagPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a free tag, failing with [`Error::NoTag`] if all 65535 are in flight.
    pub async fn alloc(&self) -> Result<u16, Error> {
        let mut inner = self.inner.lock().await;
        let start = inner.cursor;
        for step in 0..TAG_COUNT {
            let idx = (start + step) % TAG_COUNT;
            let (word, bit) = (idx / WORD_BITS, idx % WORD_BITS);
            if inner.bits[word] & (1 << bit) == 0 {
                inner.bits[word] |= 1 << bit;
                inner.cursor = (idx + 1) % TAG_COUNT;
                return Ok(idx as u16);
            }
        }
        Err(Error::NoTag)
    }

    pub async fn free(&self, tag: u16) {
        let mut inner = self.inner.lock().await;
        let idx = tag as usize;
        let (word, bit) = (idx / WORD_BITS, idx % WORD_BITS);
        inner.bits[word] &= !(1 << bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_tags() {
        let pool = TagPool::new();
        let a = pool.alloc().await.unwrap();
        let b = pool.alloc().await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, NOTAG);
        assert_ne!(b, NOTAG);
    }

    #[tokio::test]
    async fn freed_tag_is_reused() {
        let pool = TagPool::new();
        let a = pool.alloc().await.unwrap();
        pool.free(a).await;
        // cursor wraps straight back to the freed slot before advancing further.
        let b = pool.alloc().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn exhaustion_reports_no_tag() {
        let pool = TagPool::new();
        let mut allocated = Vec::with_capacity(TAG_COUNT);
        for _ in 0..TAG_COUNT {
            allocated.push(pool.alloc().await.unwrap());
        }
        assert!(matches!(pool.alloc().await, Err(Error::NoTag)));
        pool.free(allocated[0]).await;
        assert!(pool.alloc().await.is_ok());
    }
}
