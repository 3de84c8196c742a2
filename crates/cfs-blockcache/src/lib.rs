#![forbid(unsafe_code)]
//! Read-only prefetching block cache pipeline component.
//!
//! Sits between the POSIX-facing surface above and the storage-facing
//! component below, translating random, small, sequential-leaning reads into
//! a small number of large parallel block fetches while keeping resident
//! memory bounded.
//!
//! Three pieces cooperate: a bounded [`BlockPool`] of mmap-backed buffers, a
//! two-priority [`ThreadPool`] executing fetch jobs, and the per-handle read
//! state machine in [`BlockCache`] that maps offsets to blocks, schedules
//! prefetches ahead of the reader, gates readers on block readiness, and
//! evicts consumed blocks trailing the scan.

mod block;
mod block_pool;
mod thread_pool;

pub use block::{Block, ReaderTurn};
pub use block_pool::BlockPool;
pub use thread_pool::ThreadPool;

use cfs_error::{CfsError, Result};
use cfs_pipeline::{
    CloseFileOptions, Component, FileAttr, GetAttrOptions, Handle, OpenFileOptions,
    PipelineConfig, ReadInBufferOptions,
};
use cfs_types::{BlockIndex, MIB};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Component name used in configuration and logs.
pub const BLOCK_CACHE_COMPONENT: &str = "block_cache";

/// How many indices a consumed block trails the scan before its table entry
/// is evicted by the second reader of the current block.
const EVICTION_LAG: u64 = 3;

/// Download attempts per block before the fetch is abandoned and waiting
/// readers are failed.
const MAX_DOWNLOAD_ATTEMPTS: u32 = 5;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Configuration for the block cache component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Uniform block size in MiB.
    #[serde(rename = "block-size-mb")]
    pub block_size_mb: u32,
    /// Total memory ceiling for block buffers in MiB.
    #[serde(rename = "mem-size-mb")]
    pub mem_size_mb: u32,
    /// Blocks queued at open and kept ahead of the reader.
    #[serde(rename = "prefetch")]
    pub prefetch: u32,
    /// Worker thread count.
    #[serde(rename = "parallelism")]
    pub parallelism: u32,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size_mb: 8,
            mem_size_mb: 512,
            prefetch: 8,
            parallelism: 8,
        }
    }
}

impl BlockCacheConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size_mb == 0 {
            return Err(CfsError::InvalidConfig(
                "block-size-mb must be > 0".to_owned(),
            ));
        }
        if self.mem_size_mb < self.block_size_mb {
            return Err(CfsError::InvalidConfig(
                "mem-size-mb must hold at least one block".to_owned(),
            ));
        }
        if self.prefetch == 0 {
            return Err(CfsError::InvalidConfig("prefetch must be >= 1".to_owned()));
        }
        if self.parallelism == 0 {
            return Err(CfsError::InvalidConfig(
                "parallelism must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// One scheduled block fetch.
#[derive(Debug, Clone)]
struct WorkItem {
    handle: Weak<Handle>,
    block: Arc<Block>,
    attempts: u32,
}

/// Per-open read state attached to the handle: the block table plus the
/// leading edge of the prefetch window, behind one mutex.
#[derive(Debug, Default)]
struct FileState {
    inner: Mutex<FileTable>,
}

#[derive(Debug, Default)]
struct FileTable {
    blocks: HashMap<BlockIndex, WorkItem>,
    next_prefetch_offset: u64,
}

struct CacheEngine {
    block_size: u64,
    prefetch: u32,
    pool: BlockPool,
    threads: ThreadPool<WorkItem>,
    next: OnceLock<Arc<dyn Component>>,
}

impl CacheEngine {
    fn next(&self) -> Result<&Arc<dyn Component>> {
        self.next
            .get()
            .ok_or(CfsError::State("next component is not wired"))
    }

    fn open_file(&self, options: OpenFileOptions) -> Result<Arc<Handle>> {
        trace!(event = "open_file", path = %options.path, flags = options.flags);

        let attr = self.next()?.get_attr(GetAttrOptions {
            path: options.path.clone(),
        })?;
        let handle = Arc::new(Handle::new(options.path, attr.size));
        let state = Arc::new(FileState::default());
        handle.attach(Arc::clone(&state));

        let mut table = state.inner.lock();
        let mut next_offset = 0_u64;
        let mut scheduled = 0_u32;
        while scheduled < self.prefetch && next_offset < handle.size() {
            if let Err(err) = self.lineup_download(&mut table, &handle, next_offset) {
                error!(
                    event = "open_prefetch_failed",
                    path = %handle.path(),
                    offset = next_offset,
                    error = %err
                );
                for (_, item) in table.blocks.drain() {
                    self.pool.release(item.block);
                }
                return Err(err);
            }
            next_offset += self.block_size;
            scheduled += 1;
        }
        table.next_prefetch_offset = next_offset;
        drop(table);

        debug!(
            event = "file_opened",
            path = %handle.path(),
            handle = %handle.id(),
            size = handle.size(),
            prefetched = scheduled
        );
        Ok(handle)
    }

    /// Take a block from the pool and queue its fetch, recording the work
    /// item in the handle's table. The caller holds the table lock, so two
    /// racing readers can never line up the same index twice.
    fn lineup_download(
        &self,
        table: &mut FileTable,
        handle: &Arc<Handle>,
        offset: u64,
    ) -> Result<()> {
        let block = self.pool.get()?;
        let index = BlockIndex::from_offset(offset, self.block_size);
        block.assign(index);
        let item = WorkItem {
            handle: Arc::downgrade(handle),
            block,
            attempts: 0,
        };
        table.blocks.insert(index, item.clone());
        trace!(event = "fetch_scheduled", path = %handle.path(), block = %index);
        // Only the first block of a freshly opened file is latency critical.
        self.threads.schedule(offset == 0, item)?;
        Ok(())
    }

    /// Worker callback: fill the block from the next component and signal
    /// readiness. Errors and empty reads are retried with backoff up to the
    /// attempt ceiling.
    fn download(&self, item: WorkItem) {
        let Some(handle) = item.handle.upgrade() else {
            trace!(event = "download_orphaned", block = %item.block.index());
            return;
        };
        let next = match self.next() {
            Ok(next) => next,
            Err(err) => {
                error!(event = "download_unwired", error = %err);
                return;
            }
        };

        let offset = item.block.index().to_offset(self.block_size);
        let read = {
            let mut data = item.block.data_mut();
            next.read_in_buffer(ReadInBufferOptions {
                handle: Arc::clone(&handle),
                offset,
                data: &mut data[..],
            })
        };

        match read {
            Ok(0) => {
                warn!(
                    event = "download_empty",
                    path = %handle.path(),
                    block = %item.block.index()
                );
                self.requeue(item);
            }
            Ok(bytes) => {
                trace!(
                    event = "download_complete",
                    path = %handle.path(),
                    block = %item.block.index(),
                    bytes
                );
                if let Err(err) = item.block.mark_ready() {
                    error!(
                        event = "download_state_error",
                        path = %handle.path(),
                        block = %item.block.index(),
                        error = %err
                    );
                }
            }
            Err(err) => {
                warn!(
                    event = "download_failed",
                    path = %handle.path(),
                    block = %item.block.index(),
                    attempt = item.attempts,
                    error = %err
                );
                self.requeue(item);
            }
        }
    }

    fn requeue(&self, mut item: WorkItem) {
        item.attempts += 1;
        if item.attempts >= MAX_DOWNLOAD_ATTEMPTS {
            error!(
                event = "download_abandoned",
                block = %item.block.index(),
                attempts = item.attempts
            );
            if let Err(err) = item.block.mark_failed() {
                error!(event = "download_state_error", error = %err);
            }
            return;
        }

        let backoff = RETRY_BACKOFF_BASE
            .saturating_mul(1 << (item.attempts - 1))
            .min(RETRY_BACKOFF_CAP);
        thread::sleep(backoff);
        if let Err(err) = self.threads.schedule(false, item) {
            warn!(event = "download_requeue_failed", error = %err);
        }
    }

    /// Resolve the block covering `offset`, lining up its download on a miss,
    /// and wait for readiness. The first reader of a block advances the
    /// prefetch window; the second unblocks it and evicts the trailing entry.
    fn get_block(&self, handle: &Arc<Handle>, offset: u64) -> Result<Arc<Block>> {
        if offset >= handle.size() {
            return Err(CfsError::EndOfFile);
        }
        let state = handle
            .attachment::<FileState>()
            .ok_or(CfsError::State("handle carries no cache state"))?;
        let index = BlockIndex::from_offset(offset, self.block_size);

        let item = {
            let mut table = state.inner.lock();
            match table.blocks.get(&index) {
                Some(item) => item.clone(),
                None => {
                    trace!(event = "read_miss", path = %handle.path(), block = %index);
                    self.lineup_download(&mut table, handle, offset)?;
                    table
                        .blocks
                        .get(&index)
                        .cloned()
                        .ok_or(CfsError::State("scheduled block missing from table"))?
                }
            }
        };

        match item.block.await_turn() {
            ReaderTurn::Failed => Err(CfsError::Downstream(format!(
                "block {index} of {} could not be downloaded",
                handle.path()
            ))),
            ReaderTurn::First => {
                self.advance_window(&state, handle);
                Ok(item.block)
            }
            ReaderTurn::Second => {
                if let Err(err) = item.block.unblock() {
                    warn!(event = "unblock_failed", block = %index, error = %err);
                }
                self.evict_trailing(&state, index);
                Ok(item.block)
            }
            ReaderTurn::Later => Ok(item.block),
        }
    }

    fn advance_window(&self, state: &FileState, handle: &Arc<Handle>) {
        let mut table = state.inner.lock();
        let offset = table.next_prefetch_offset;
        if offset >= handle.size() {
            return;
        }
        match self.lineup_download(&mut table, handle, offset) {
            Ok(()) => table.next_prefetch_offset = offset + self.block_size,
            Err(err) => {
                warn!(
                    event = "prefetch_failed",
                    path = %handle.path(),
                    offset,
                    error = %err
                );
            }
        }
    }

    fn evict_trailing(&self, state: &FileState, index: BlockIndex) {
        let Some(trailing) = index.trailing(EVICTION_LAG) else {
            return;
        };
        let removed = state.inner.lock().blocks.remove(&trailing);
        if let Some(item) = removed {
            // Non-sequential access can evict a trailing block that is still
            // awaiting its second reader; the pool re-arms it before reuse.
            if !item.block.is_unblocked() {
                warn!(event = "evict_undrained_block", block = %trailing);
            }
            trace!(event = "block_evicted", block = %trailing);
            self.pool.release(item.block);
        }
    }

    fn read_in_buffer(&self, options: ReadInBufferOptions<'_>) -> Result<usize> {
        let ReadInBufferOptions {
            handle,
            mut offset,
            data,
        } = options;

        let mut data_read = 0_usize;
        while data_read < data.len() {
            let block = match self.get_block(&handle, offset) {
                Ok(block) => block,
                Err(CfsError::EndOfFile) if data_read > 0 => return Ok(data_read),
                Err(err) => return Err(err),
            };

            let block_start = block.index().to_offset(self.block_size);
            let block_end = (block_start + self.block_size).min(handle.size());
            let within = (offset - block_start) as usize;
            let n = ((block_end - offset) as usize).min(data.len() - data_read);
            {
                let buf = block.data();
                data[data_read..data_read + n].copy_from_slice(&buf[within..within + n]);
            }
            data_read += n;
            offset += n as u64;
        }
        Ok(data_read)
    }

    fn close_file(&self, options: CloseFileOptions) -> Result<()> {
        let handle = options.handle;
        trace!(event = "close_file", path = %handle.path(), handle = %handle.id());

        let Some(state) = handle.detach::<FileState>() else {
            return Ok(());
        };
        let mut table = state.inner.lock();
        let released = table.blocks.len();
        for (_, item) in table.blocks.drain() {
            self.pool.release(item.block);
        }
        table.next_prefetch_offset = 0;
        drop(table);

        debug!(event = "file_closed", path = %handle.path(), released);
        Ok(())
    }
}

/// The block cache component.
///
/// Construct with [`BlockCache::new`], wire into a pipeline, `configure`
/// (which enforces the read-only mount and builds the pool and workers),
/// then `start`.
pub struct BlockCache {
    config: BlockCacheConfig,
    next: OnceLock<Arc<dyn Component>>,
    engine: OnceLock<Arc<CacheEngine>>,
}

impl BlockCache {
    #[must_use]
    pub fn new(config: BlockCacheConfig) -> Self {
        Self {
            config,
            next: OnceLock::new(),
            engine: OnceLock::new(),
        }
    }

    fn engine(&self) -> Result<&Arc<CacheEngine>> {
        self.engine
            .get()
            .ok_or(CfsError::State("block cache is not configured"))
    }

    /// Blocks obtainable from the pool without waiting. Test and diagnostics
    /// surface, not part of the read path.
    pub fn pool_available(&self) -> Result<usize> {
        Ok(self.engine()?.pool.available())
    }
}

impl Component for BlockCache {
    fn name(&self) -> &'static str {
        BLOCK_CACHE_COMPONENT
    }

    fn set_next_component(&self, next: Arc<dyn Component>) {
        if let Some(engine) = self.engine.get() {
            let _ = engine.next.set(Arc::clone(&next));
        }
        let _ = self.next.set(next);
    }

    fn configure(&self, config: &PipelineConfig) -> Result<()> {
        if !config.read_only {
            error!(event = "configure_rejected", reason = "mount is not read-only");
            return Err(CfsError::InvalidConfig(
                "block cache requires a read-only mount".to_owned(),
            ));
        }
        self.config.validate()?;

        let block_size = u64::from(self.config.block_size_mb) * MIB;
        let mem_size = u64::from(self.config.mem_size_mb) * MIB;
        let pool = BlockPool::new(block_size, mem_size)?;
        if (pool.max_blocks() as u64) < u64::from(self.config.prefetch) {
            warn!(
                event = "prefetch_exceeds_pool",
                prefetch = self.config.prefetch,
                max_blocks = pool.max_blocks()
            );
        }

        let engine_slot: Arc<OnceLock<Weak<CacheEngine>>> = Arc::new(OnceLock::new());
        let worker_slot = Arc::clone(&engine_slot);
        let reader = Arc::new(move |item: WorkItem| {
            if let Some(engine) = worker_slot.get().and_then(Weak::upgrade) {
                engine.download(item);
            }
        });
        let threads = ThreadPool::new(self.config.parallelism, reader)?;

        let engine = Arc::new(CacheEngine {
            block_size,
            prefetch: self.config.prefetch,
            pool,
            threads,
            next: OnceLock::new(),
        });
        if let Some(next) = self.next.get() {
            let _ = engine.next.set(Arc::clone(next));
        }
        let _ = engine_slot.set(Arc::downgrade(&engine));
        self.engine
            .set(engine)
            .map_err(|_| CfsError::State("block cache configured twice"))?;

        debug!(
            event = "block_cache_configured",
            block_size_mb = self.config.block_size_mb,
            mem_size_mb = self.config.mem_size_mb,
            prefetch = self.config.prefetch,
            parallelism = self.config.parallelism
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        trace!(event = "component_start", component = BLOCK_CACHE_COMPONENT);
        self.engine()?.threads.start()
    }

    fn stop(&self) -> Result<()> {
        trace!(event = "component_stop", component = BLOCK_CACHE_COMPONENT);
        if let Some(engine) = self.engine.get() {
            engine.threads.stop();
        }
        Ok(())
    }

    fn get_attr(&self, options: GetAttrOptions) -> Result<FileAttr> {
        self.engine()?.next()?.get_attr(options)
    }

    fn open_file(&self, options: OpenFileOptions) -> Result<Arc<Handle>> {
        self.engine()?.open_file(options)
    }

    fn read_in_buffer(&self, options: ReadInBufferOptions<'_>) -> Result<usize> {
        self.engine()?.read_in_buffer(options)
    }

    fn close_file(&self, options: CloseFileOptions) -> Result<()> {
        self.engine()?.close_file(options)
    }
}
