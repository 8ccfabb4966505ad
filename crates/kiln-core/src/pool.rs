//! Worker fan-out.
//!
//! Batches of OIDs are spread over a fixed-size rayon pool. Every pool thread
//! is marked as an inline worker when it starts, so dispatcher calls made
//! from inside a module body run sequentially on that thread instead of
//! fanning out again.

use std::cell::Cell;

use rayon::prelude::*;

use kiln_registry::{DispatchError, DispatchResult};

thread_local! {
    static INLINE: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` on a pool worker thread.
pub fn is_inline_thread() -> bool {
    INLINE.with(Cell::get)
}

pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl WorkerPool {
    /// A pool of `workers` threads; one worker means everything runs on the
    /// calling thread.
    pub fn new(workers: usize) -> DispatchResult<Self> {
        if workers <= 1 {
            return Ok(Self::inline());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .start_handler(|_| INLINE.with(|flag| flag.set(true)))
            .build()
            .map_err(|e| DispatchError::Config(format!("cannot start worker pool: {e}")))?;
        tracing::debug!(workers, "worker pool started");
        Ok(Self {
            pool: Some(pool),
            workers,
        })
    }

    pub fn inline() -> Self {
        Self {
            pool: None,
            workers: 1,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `f` to every item, in parallel when a pool exists, the batch has
    /// more than one item, and the caller is not already a worker.
    ///
    /// Results come back in input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) if items.len() > 1 && !is_inline_thread() => {
                pool.install(|| items.par_iter().map(&f).collect())
            }
            _ => items.iter().map(f).collect(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn inline_pool_runs_on_caller() {
        let pool = WorkerPool::new(1).unwrap();
        let caller = thread::current().id();
        let ids = pool.map(&[1, 2, 3], |_| thread::current().id());
        assert!(ids.iter().all(|id| *id == caller));
        assert!(!is_inline_thread());
    }

    #[test]
    fn results_keep_input_order() {
        let pool = WorkerPool::new(4).unwrap();
        let items: Vec<u32> = (0..100).collect();
        let out = pool.map(&items, |n| n * 2);
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn workers_are_marked_inline_and_do_not_refan() {
        let pool = WorkerPool::new(3).unwrap();
        let nested_threads = Mutex::new(HashSet::new());
        let flags = pool.map(&[0u8; 12], |_| {
            let outer = thread::current().id();
            let inner = pool.map(&[0u8; 4], |_| thread::current().id());
            nested_threads.lock().unwrap().extend(inner.iter().copied());
            assert!(inner.iter().all(|id| *id == outer));
            is_inline_thread()
        });
        assert!(flags.into_iter().all(|f| f));
        assert!(nested_threads.lock().unwrap().len() <= 3);
    }
}
