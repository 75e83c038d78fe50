//! Free-list management of tags for outstanding 9P requests.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::fcall::Tag;
use crate::utils::Result;

/// Default number of distinct tags a pool hands out: every 16-bit value
/// except `NOTAG`.
pub const DEFAULT_OUTSTANDING: u32 = 0xFFFE;

/// Allocator of request tags.
///
/// Fresh tags are minted from a monotonic counter until the tag space is
/// exhausted; after that, allocation comes from the free list. No tag is
/// ever handed to two outstanding requests at once.
pub struct TagPool {
    free_tx: mpsc::Sender<Tag>,
    free_rx: Mutex<mpsc::Receiver<Tag>>,
    next: AtomicU32,
    limit: u32,
    closed: CancellationToken,
}

impl TagPool {
    /// Create a pool handing out at most `limit` distinct tags, all below
    /// `NOTAG`.
    pub fn new(limit: u32) -> TagPool {
        let limit = limit.clamp(1, DEFAULT_OUTSTANDING);
        let (free_tx, free_rx) = mpsc::channel(limit as usize);

        TagPool {
            free_tx,
            free_rx: Mutex::new(free_rx),
            next: AtomicU32::new(0),
            limit,
            closed: CancellationToken::new(),
        }
    }

    /// Take a tag, blocking until one is available. Fails with
    /// [`Error::Closed`] once the pool has been closed.
    pub async fn get(&self) -> Result<Tag> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }

        let fresh = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n < self.limit { Some(n + 1) } else { None }
            });
        if let Ok(n) = fresh {
            return Ok(n as Tag);
        }

        let mut free_rx = self.free_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Closed),
            tag = free_rx.recv() => tag.ok_or(Error::Closed),
        }
    }

    /// Return a tag to the free list.
    pub fn put(&self, tag: Tag) {
        // Capacity equals the tag space, so the send cannot fail with Full;
        // after close the tag is simply dropped.
        let _ = self.free_tx.try_send(tag);
    }

    /// Close the pool, waking all blocked `get` callers with an error.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Default for TagPool {
    fn default() -> Self {
        TagPool::new(DEFAULT_OUTSTANDING)
    }
}
