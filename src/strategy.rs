//! Concurrency strategy selection for per-level item processing
//!
//! Small populations go through a small thread pool, large ones through a
//! wide pool sized from the core count. A pool that cannot be built or that
//! panics degrades to the next narrower strategy. Catching worker panics
//! needs the unwinding panic strategy, so release builds keep it.

use log::{debug, error};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::ScanThresholds;
use crate::models::MediaType;

/// How a batch of items is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyStrategy {
    /// One item after the other on the calling thread
    Sequential,
    /// A pool of a few workers
    SmallPool(usize),
    /// A pool sized from the number of cores
    WidePool(usize),
}

impl ConcurrencyStrategy {
    /// Pick the strategy for `count` items of the given kind
    ///
    /// Videos are expensive to open, so they switch to the wide pool at a
    /// much lower count than images.
    pub fn select(
        kind: MediaType,
        count: usize,
        recursive: bool,
        thresholds: &ScanThresholds,
    ) -> Self {
        let threshold = match kind {
            MediaType::Video => thresholds.video_threshold(recursive),
            _ => thresholds.image_threshold(recursive),
        };

        if count > threshold {
            ConcurrencyStrategy::WidePool(thresholds.effective_wide_threads(recursive))
        } else {
            ConcurrencyStrategy::SmallPool(thresholds.small_pool_threads.max(1))
        }
    }

    /// The strategy to fall back to when this one fails
    pub fn fallback(&self, thresholds: &ScanThresholds) -> Option<Self> {
        match self {
            ConcurrencyStrategy::WidePool(_) => Some(ConcurrencyStrategy::SmallPool(
                thresholds.small_pool_threads.max(1),
            )),
            ConcurrencyStrategy::SmallPool(_) => Some(ConcurrencyStrategy::Sequential),
            ConcurrencyStrategy::Sequential => None,
        }
    }

    /// Process every item, preserving input order in the output
    pub fn run<T, R, F>(self, items: &[T], thresholds: &ScanThresholds, f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        let mut strategy = self;
        loop {
            match strategy.try_run(items, &f) {
                Ok(results) => return results,
                Err(reason) => match strategy.fallback(thresholds) {
                    Some(next) => {
                        error!("{:?} failed ({}), falling back to {:?}", strategy, reason, next);
                        strategy = next;
                    }
                    None => {
                        // Sequential never returns Err, but keep the loop total
                        return items.iter().map(&f).collect();
                    }
                },
            }
        }
    }

    fn try_run<T, R, F>(&self, items: &[T], f: &F) -> Result<Vec<R>, String>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        let threads = match self {
            ConcurrencyStrategy::Sequential => return Ok(items.iter().map(f).collect()),
            ConcurrencyStrategy::SmallPool(n) | ConcurrencyStrategy::WidePool(n) => *n,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("jnodes-scan-{}", i))
            .build()
            .map_err(|e| e.to_string())?;

        debug!("Processing {} items on {} threads", items.len(), threads);

        catch_unwind(AssertUnwindSafe(|| {
            pool.install(|| items.par_iter().map(f).collect::<Vec<R>>())
        }))
        .map_err(|_| "worker panicked".to_string())
    }
}
