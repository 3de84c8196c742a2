//! Bounded pool of uniformly sized blocks.
//!
//! The pool enforces the cache's global memory ceiling: it allocates blocks
//! lazily up to `mem_size / block_size` and recycles released blocks through
//! a FIFO free list. A `get` on an exhausted pool waits a bounded time for a
//! release before failing.

use crate::block::Block;
use cfs_error::{CfsError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

/// How long `get` waits for a released block once the pool is at capacity.
const POOL_GET_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded free list of [`Block`]s.
///
/// Total live blocks (free-listed plus handed out) never exceed
/// `mem_size / block_size`. Every block returned by [`get`](Self::get) has
/// been re-armed and carries no state from its previous use.
#[derive(Debug)]
pub struct BlockPool {
    block_size: u64,
    max_blocks: usize,
    free_tx: Sender<Arc<Block>>,
    free_rx: Receiver<Arc<Block>>,
    allocated: AtomicUsize,
}

impl BlockPool {
    pub fn new(block_size: u64, mem_size: u64) -> Result<Self> {
        if block_size == 0 || mem_size == 0 {
            return Err(CfsError::InvalidConfig(
                "block size and memory size must be non-zero".to_owned(),
            ));
        }
        let max_blocks = usize::try_from(mem_size / block_size).map_err(|_| {
            CfsError::InvalidConfig("block count exceeds address space".to_owned())
        })?;
        if max_blocks < 1 {
            return Err(CfsError::InvalidConfig(
                "memory size must hold at least one block".to_owned(),
            ));
        }
        let (free_tx, free_rx) = bounded(max_blocks);
        Ok(Self {
            block_size,
            max_blocks,
            free_tx,
            free_rx,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Take a block from the pool: recycle a free one, allocate below the
    /// ceiling, or wait for a release. The returned block is armed for a new
    /// fetch cycle.
    pub fn get(&self) -> Result<Arc<Block>> {
        if let Ok(block) = self.free_rx.try_recv() {
            block.rearm();
            return Ok(block);
        }

        if self.reserve_slot() {
            match Block::allocate(self.block_size) {
                Ok(block) => {
                    trace!(
                        event = "block_allocated",
                        block_size = self.block_size,
                        allocated = self.allocated()
                    );
                    let block = Arc::new(block);
                    block.rearm();
                    return Ok(block);
                }
                Err(err) => {
                    self.allocated.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }

        match self.free_rx.recv_timeout(POOL_GET_TIMEOUT) {
            Ok(block) => {
                block.rearm();
                Ok(block)
            }
            Err(_) => {
                warn!(
                    event = "pool_exhausted",
                    max_blocks = self.max_blocks,
                    waited_ms = POOL_GET_TIMEOUT.as_millis() as u64
                );
                Err(CfsError::PoolExhausted)
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_blocks).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return a block to the free list.
    pub fn release(&self, block: Arc<Block>) {
        // The free list is sized to the ceiling; overflow means a block that
        // was never accounted by this pool.
        if self.free_tx.try_send(block).is_err() {
            error!(event = "block_release_overflow", max_blocks = self.max_blocks);
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Blocks allocated so far (free-listed or handed out).
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Blocks obtainable without waiting: the free list plus unallocated
    /// headroom. Approximate under concurrent use.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_rx.len() + (self.max_blocks - self.allocated())
    }
}
