//! Fixed-size block buffers and their readiness latch.
//!
//! A [`Block`] pairs an anonymously mapped buffer with a small state machine
//! gating readers on the completion of a background fetch. Readers block on
//! the latch until the downloading worker marks the block ready; the latch
//! also hands each reader its sequence number, which the cache uses to drive
//! the prefetch window (first reader) and trailing eviction (second reader).

use cfs_error::{CfsError, Result};
use cfs_types::BlockIndex;
use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// A reader's position in the consumption order of a block, observed while
/// passing the readiness latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderTurn {
    /// First reader of the block since it was armed.
    First,
    /// Second reader; responsible for unblocking and trailing eviction.
    Second,
    /// Any later reader, or any reader arriving after the block was
    /// unblocked. No side effects are expected of it.
    Later,
    /// The fetch was abandoned; the block holds no usable data.
    Failed,
}

#[derive(Debug, Default)]
struct LatchState {
    armed: bool,
    ready: bool,
    failed: bool,
    closed: bool,
    readers: u32,
}

/// A fixed-size buffer plus the readiness latch for its in-flight fetch.
///
/// Lifecycle: allocated blocks start disarmed. The pool arms a block with
/// [`rearm`](Self::rearm) before handing it out, the downloading worker fills
/// the buffer and calls [`mark_ready`](Self::mark_ready), readers pass
/// [`await_turn`](Self::await_turn), and the second reader closes the cycle
/// with [`unblock`](Self::unblock). Releasing to the pool and re-arming
/// starts the next cycle.
///
/// The buffer is only written through the [`RwLock`] write guard held by the
/// worker before readiness; afterwards readers take shared guards.
#[derive(Debug)]
pub struct Block {
    index: AtomicU64,
    data: RwLock<MmapMut>,
    latch: Mutex<LatchState>,
    fetched: Condvar,
}

impl Block {
    /// Allocate a block backed by `size` bytes of anonymous page-aligned
    /// mapping. The mapping is released when the block is dropped.
    pub fn allocate(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(CfsError::Allocation("invalid block size 0".to_owned()));
        }
        let len = usize::try_from(size)
            .map_err(|_| CfsError::Allocation(format!("block size {size} exceeds address space")))?;
        let data = MmapMut::map_anon(len).map_err(|err| {
            CfsError::Allocation(format!("anonymous mmap of {size} bytes failed: {err}"))
        })?;
        Ok(Self {
            index: AtomicU64::new(0),
            data: RwLock::new(data),
            latch: Mutex::new(LatchState::default()),
            fetched: Condvar::new(),
        })
    }

    /// Arm the block for a new fetch cycle, resetting readiness, failure and
    /// the reader sequence. Called exactly once per cycle, before the fetch
    /// is scheduled.
    pub fn rearm(&self) {
        let mut state = self.latch.lock();
        *state = LatchState {
            armed: true,
            ..LatchState::default()
        };
    }

    /// Bind this block to a block index of the file it is fetching for.
    /// Stable only for the lifetime of the current cycle.
    pub fn assign(&self, index: BlockIndex) {
        self.index.store(index.get(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn index(&self) -> BlockIndex {
        BlockIndex(self.index.load(Ordering::Relaxed))
    }

    /// Signal that the fetch completed and readers may proceed.
    pub fn mark_ready(&self) -> Result<()> {
        let mut state = self.latch.lock();
        if !state.armed {
            return Err(CfsError::State("block was never armed"));
        }
        if state.ready || state.failed {
            return Err(CfsError::State("block already marked ready"));
        }
        state.ready = true;
        drop(state);
        self.fetched.notify_all();
        Ok(())
    }

    /// Signal that the fetch was abandoned. Waiting readers wake with
    /// [`ReaderTurn::Failed`].
    pub fn mark_failed(&self) -> Result<()> {
        let mut state = self.latch.lock();
        if !state.armed {
            return Err(CfsError::State("block was never armed"));
        }
        if state.ready || state.failed {
            return Err(CfsError::State("block already marked ready"));
        }
        state.failed = true;
        drop(state);
        self.fetched.notify_all();
        Ok(())
    }

    /// Wait until the block is ready (or abandoned) and take the next reader
    /// turn.
    pub fn await_turn(&self) -> ReaderTurn {
        let mut state = self.latch.lock();
        while !(state.ready || state.failed || state.closed) {
            self.fetched.wait(&mut state);
        }
        if state.failed {
            return ReaderTurn::Failed;
        }
        if state.closed {
            return ReaderTurn::Later;
        }
        state.readers += 1;
        match state.readers {
            1 => ReaderTurn::First,
            2 => ReaderTurn::Second,
            _ => ReaderTurn::Later,
        }
    }

    /// Close the current cycle: later readers pass the latch without taking a
    /// turn, and the block becomes eligible for release back to the pool.
    pub fn unblock(&self) -> Result<()> {
        let mut state = self.latch.lock();
        if !state.armed || state.closed {
            return Err(CfsError::State("invalid state to unblock"));
        }
        state.closed = true;
        drop(state);
        self.fetched.notify_all();
        Ok(())
    }

    /// True once [`unblock`](Self::unblock) closed the current cycle.
    #[must_use]
    pub fn is_unblocked(&self) -> bool {
        self.latch.lock().closed
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.latch.lock().armed
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.latch.lock().ready
    }

    /// Number of readers that have taken a turn in the current cycle.
    #[must_use]
    pub fn readers_seen(&self) -> u32 {
        self.latch.lock().readers
    }

    /// Shared view of the buffer. Only meaningful after readiness.
    #[must_use]
    pub fn data(&self) -> RwLockReadGuard<'_, MmapMut> {
        self.data.read()
    }

    /// Exclusive view of the buffer for the downloading worker.
    #[must_use]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, MmapMut> {
        self.data.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn allocate_rejects_zero_size() {
        let err = Block::allocate(0).unwrap_err();
        assert!(matches!(err, CfsError::Allocation(_)));
    }

    #[test]
    fn allocate_provides_zeroed_buffer() {
        let block = Block::allocate(4096).expect("allocate");
        assert_eq!(block.data().len(), 4096);
        assert!(block.data().iter().all(|&b| b == 0));
        assert!(!block.is_armed());
        assert_eq!(block.index(), BlockIndex(0));
    }

    #[test]
    fn mark_ready_requires_arming() {
        let block = Block::allocate(16).expect("allocate");
        let err = block.mark_ready().unwrap_err();
        assert!(matches!(err, CfsError::State("block was never armed")));

        block.rearm();
        assert!(block.is_armed());
        assert!(!block.is_ready());
        block.mark_ready().expect("ready");
        assert!(block.is_ready());

        let err = block.mark_ready().unwrap_err();
        assert!(matches!(err, CfsError::State("block already marked ready")));
    }

    #[test]
    fn readers_take_turns_in_sequence() {
        let block = Block::allocate(16).expect("allocate");
        block.rearm();
        block.mark_ready().expect("ready");

        assert_eq!(block.await_turn(), ReaderTurn::First);
        assert_eq!(block.await_turn(), ReaderTurn::Second);
        assert_eq!(block.await_turn(), ReaderTurn::Later);
        assert_eq!(block.readers_seen(), 3);
        assert!(!block.is_unblocked());
    }

    #[test]
    fn unblock_closes_the_cycle() {
        let block = Block::allocate(16).expect("allocate");
        assert!(block.unblock().is_err());

        block.rearm();
        block.mark_ready().expect("ready");
        assert_eq!(block.await_turn(), ReaderTurn::First);
        assert_eq!(block.await_turn(), ReaderTurn::Second);
        block.unblock().expect("unblock");
        assert!(block.is_unblocked());

        // Readers after the close take no turn.
        assert_eq!(block.await_turn(), ReaderTurn::Later);
        assert_eq!(block.readers_seen(), 2);

        let err = block.unblock().unwrap_err();
        assert!(matches!(err, CfsError::State("invalid state to unblock")));
    }

    #[test]
    fn rearm_resets_a_recycled_block() {
        let block = Block::allocate(16).expect("allocate");
        block.rearm();
        block.mark_ready().expect("ready");
        assert_eq!(block.await_turn(), ReaderTurn::First);
        assert_eq!(block.await_turn(), ReaderTurn::Second);
        block.unblock().expect("unblock");

        block.rearm();
        assert!(!block.is_ready());
        assert!(!block.is_unblocked());
        assert_eq!(block.readers_seen(), 0);
        block.mark_ready().expect("ready again");
        assert_eq!(block.await_turn(), ReaderTurn::First);
    }

    #[test]
    fn failed_fetch_wakes_waiting_readers() {
        let block = Arc::new(Block::allocate(16).expect("allocate"));
        block.rearm();

        let waiter = {
            let block = Arc::clone(&block);
            std::thread::spawn(move || block.await_turn())
        };
        std::thread::sleep(Duration::from_millis(20));
        block.mark_failed().expect("fail");
        assert_eq!(waiter.join().expect("join"), ReaderTurn::Failed);
    }

    #[test]
    fn readers_block_until_ready() {
        let block = Arc::new(Block::allocate(16).expect("allocate"));
        block.rearm();

        let waiter = {
            let block = Arc::clone(&block);
            std::thread::spawn(move || block.await_turn())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(block.readers_seen(), 0);
        block.mark_ready().expect("ready");
        assert_eq!(waiter.join().expect("join"), ReaderTurn::First);
    }
}
