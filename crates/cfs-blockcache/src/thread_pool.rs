//! Two-priority worker pool for block-fetch jobs.
//!
//! Workers drain a priority queue before taking normal work; priority jobs
//! are scarce by construction (only the first block of a freshly opened file)
//! so starvation of the normal queue is not a concern. On stop both queues
//! are closed and workers drain what remains before exiting.

use cfs_error::{CfsError, Result};
use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

type JobReader<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Fixed-size pool of worker threads consuming jobs from two queues.
pub struct ThreadPool<T: Send + 'static> {
    workers: u32,
    reader: JobReader<T>,
    inner: Mutex<Option<PoolInner<T>>>,
}

impl<T: Send + 'static> std::fmt::Debug for ThreadPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

struct PoolInner<T> {
    priority_tx: Sender<T>,
    normal_tx: Sender<T>,
    joins: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Create a stopped pool. `reader` is invoked once per dequeued job.
    pub fn new(workers: u32, reader: JobReader<T>) -> Result<Self> {
        if workers == 0 {
            return Err(CfsError::InvalidConfig(
                "thread pool requires at least one worker".to_owned(),
            ));
        }
        Ok(Self {
            workers,
            reader,
            inner: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Spawn the workers. Fails if the pool is already running.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(CfsError::State("thread pool already started"));
        }

        let (priority_tx, priority_rx) = unbounded();
        let (normal_tx, normal_rx) = unbounded();
        let mut joins = Vec::with_capacity(self.workers as usize);
        for i in 0..self.workers {
            let reader = Arc::clone(&self.reader);
            let priority_rx = priority_rx.clone();
            let normal_rx = normal_rx.clone();
            let join = thread::Builder::new()
                .name(format!("cfs-fetch-{i}"))
                .spawn(move || worker_loop(&reader, &priority_rx, &normal_rx))
                .map_err(CfsError::from)?;
            joins.push(join);
        }
        debug!(event = "thread_pool_started", workers = self.workers);

        *inner = Some(PoolInner {
            priority_tx,
            normal_tx,
            joins,
        });
        Ok(())
    }

    /// Close both queues and join the workers. Queued jobs are still executed
    /// before the workers exit. Idempotent.
    pub fn stop(&self) {
        let Some(inner) = self.inner.lock().take() else {
            return;
        };
        let PoolInner {
            priority_tx,
            normal_tx,
            joins,
        } = inner;
        drop(priority_tx);
        drop(normal_tx);
        for join in joins {
            let _ = join.join();
        }
        debug!(event = "thread_pool_stopped");
    }

    /// Queue a job on the priority or normal queue.
    pub fn schedule(&self, priority: bool, item: T) -> Result<()> {
        let inner = self.inner.lock();
        let Some(inner) = inner.as_ref() else {
            return Err(CfsError::State("thread pool is not running"));
        };
        let queue = if priority {
            &inner.priority_tx
        } else {
            &inner.normal_tx
        };
        queue
            .send(item)
            .map_err(|_| CfsError::State("thread pool is not running"))
    }
}

fn worker_loop<T>(reader: &JobReader<T>, priority_rx: &Receiver<T>, normal_rx: &Receiver<T>) {
    loop {
        // Priority work is taken whenever it is queued, before any normal job.
        match priority_rx.try_recv() {
            Ok(item) => {
                reader(item);
                continue;
            }
            Err(TryRecvError::Disconnected) => {
                for item in normal_rx.iter() {
                    reader(item);
                }
                return;
            }
            Err(TryRecvError::Empty) => {}
        }

        select! {
            recv(priority_rx) -> msg => match msg {
                Ok(item) => reader(item),
                Err(_) => {
                    for item in normal_rx.iter() {
                        reader(item);
                    }
                    return;
                }
            },
            recv(normal_rx) -> msg => match msg {
                Ok(item) => reader(item),
                Err(_) => {
                    for item in priority_rx.iter() {
                        reader(item);
                    }
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn new_rejects_zero_workers() {
        let err = ThreadPool::<i32>::new(0, Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, CfsError::InvalidConfig(_)));
    }

    #[test]
    fn schedule_requires_running_pool() {
        let pool = ThreadPool::new(1, Arc::new(|_: i32| {})).expect("pool");
        let err = pool.schedule(false, 1).unwrap_err();
        assert!(matches!(err, CfsError::State(_)));
    }

    #[test]
    fn both_queues_feed_the_reader() {
        let seen = Arc::new(AtomicUsize::new(0));
        let reader = {
            let seen = Arc::clone(&seen);
            Arc::new(move |item: i32| {
                assert_eq!(item, 1);
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pool = ThreadPool::new(2, reader).expect("pool");
        assert_eq!(pool.workers(), 2);
        pool.start().expect("start");

        pool.schedule(false, 1).expect("normal");
        pool.schedule(true, 1).expect("priority");
        pool.stop();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn start_twice_is_an_error() {
        let pool = ThreadPool::new(1, Arc::new(|_: i32| {})).expect("pool");
        pool.start().expect("start");
        assert!(pool.start().is_err());
        pool.stop();
        // A stopped pool may be started again.
        pool.start().expect("restart");
        pool.stop();
    }

    #[test]
    fn schedule_after_stop_is_an_error() {
        let pool = ThreadPool::new(1, Arc::new(|_: i32| {})).expect("pool");
        pool.start().expect("start");
        pool.stop();
        let err = pool.schedule(true, 1).unwrap_err();
        assert!(matches!(err, CfsError::State(_)));
    }

    #[test]
    fn priority_jobs_run_before_earlier_normal_jobs() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (entered_tx, entered_rx) = bounded::<()>(0);

        let reader = {
            let order = Arc::clone(&order);
            Arc::new(move |item: i32| {
                if item == 0 {
                    // Hold the single worker until the queues are loaded.
                    entered_tx.send(()).expect("signal");
                    gate_rx.recv().expect("gate");
                }
                order.lock().push(item);
            })
        };
        let pool = ThreadPool::new(1, reader).expect("pool");
        pool.start().expect("start");

        pool.schedule(false, 0).expect("gate job");
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker entered gate");
        pool.schedule(false, 1).expect("normal");
        pool.schedule(false, 2).expect("normal");
        pool.schedule(true, 3).expect("priority");

        gate_tx.send(()).expect("release gate");
        pool.stop();

        assert_eq!(*order.lock(), vec![0, 3, 1, 2]);
    }

    #[test]
    fn stop_drains_queued_work() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (entered_tx, entered_rx) = bounded::<()>(0);

        let reader = {
            let seen = Arc::clone(&seen);
            Arc::new(move |item: i32| {
                if item == 0 {
                    entered_tx.send(()).expect("signal");
                    gate_rx.recv().expect("gate");
                }
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pool = ThreadPool::new(1, reader).expect("pool");
        pool.start().expect("start");

        pool.schedule(false, 0).expect("gate job");
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker entered gate");
        for i in 1..=10 {
            pool.schedule(false, i).expect("queue");
        }

        gate_tx.send(()).expect("release gate");
        pool.stop();

        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }
}
