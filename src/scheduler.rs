//! Background loading of dataset entries into the image cache.
//!
//! The first few entries are loaded synchronously on the display thread so
//! something can be shown immediately. The rest are claimed by a small pool
//! of workers through a shared atomic cursor: every index past the initial
//! batch is handed to exactly one worker.

use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheError, ImageCache},
    dataset::{Dataset, Eye},
    display::DisplaySurface,
    frame::FrameSource,
};

/// How many times a failed decode is attempted before the slot is given up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoaderConfig {
    pub initial_load_count: usize,
    pub num_workers: usize,
    pub worker_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            initial_load_count: 10,
            num_workers: 4,
            worker_delay: Duration::from_millis(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Log progress every this many claimed indices.
const PROGRESS_INTERVAL: usize = 50;

#[derive(Default)]
struct LoaderState {
    cursor: AtomicUsize,
    exited: AtomicUsize,
    complete: AtomicBool,
    running: AtomicBool,
}

/// Everything a loading thread needs, shared between the scheduler and its
/// workers.
struct Loader<H> {
    dataset: Arc<Dataset>,
    cache: Arc<ImageCache<H>>,
    source: Arc<dyn FrameSource>,
    retry: RetryPolicy,
}

impl<H> Loader<H> {
    /// Decode one slot unless it is already decoded or has failed before.
    ///
    /// Returns whether the slot holds a decoded frame afterwards.
    fn load_slot(&self, index: usize, eye: Eye) -> bool {
        if self.cache.is_decoded(index, eye) {
            return true;
        }
        if self.cache.is_failed(index, eye) {
            return false;
        }
        let Some(path) = self.dataset.get(index).and_then(|entry| entry.path(eye)) else {
            return false;
        };

        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.source.load(eye, path) {
                Ok(frame) => {
                    return match self.cache.store_decoded(index, eye, frame) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(%err, index, "unable to store decoded frame");
                            false
                        }
                    };
                }
                Err(err) if attempt < attempts => {
                    debug!(%err, index, ?eye, attempt, "decode failed, retrying");
                    thread::sleep(Duration::from_millis(self.retry.delay_ms));
                }
                Err(err) => {
                    if self.cache.mark_failed(index, eye) {
                        warn!(%err, index, ?eye, "unable to load image");
                    }
                }
            }
        }

        false
    }

    fn load_entry(&self, index: usize) {
        for eye in self.dataset.layout().eyes() {
            self.load_slot(index, *eye);
        }
    }

    fn run_worker(&self, state: &LoaderState, num_workers: usize, delay: Duration) {
        let len = self.dataset.len();
        while state.running.load(Ordering::Acquire) {
            let index = state.cursor.fetch_add(1, Ordering::AcqRel);
            if index >= len {
                break;
            }

            self.load_entry(index);
            if (index + 1) % PROGRESS_INTERVAL == 0 {
                info!(loaded = index + 1, total = len, "loading images");
            }
            thread::sleep(delay);
        }

        if state.exited.fetch_add(1, Ordering::AcqRel) + 1 == num_workers {
            state.complete.store(true, Ordering::Release);
            info!(total = len, "background loading finished");
        }
    }
}

/// Coordinates the initial synchronous load and the background workers.
pub struct LoadScheduler<H> {
    loader: Arc<Loader<H>>,
    config: LoaderConfig,
    state: Arc<LoaderState>,
    workers: Vec<JoinHandle<()>>,
}

impl<H: Send + 'static> LoadScheduler<H> {
    pub fn new(
        dataset: Arc<Dataset>,
        cache: Arc<ImageCache<H>>,
        source: Arc<dyn FrameSource>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            loader: Arc::new(Loader {
                dataset,
                cache,
                source,
                retry: config.retry,
            }),
            config,
            state: Arc::new(LoaderState::default()),
            workers: Vec::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache<H>> {
        &self.loader.cache
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.loader.dataset
    }

    /// Load the initial batch and then start the workers.
    pub fn start<S>(&mut self, surface: &mut S) -> Result<(), CacheError>
    where
        S: DisplaySurface<Handle = H>,
    {
        self.load_initial(surface)?;
        self.spawn_workers();
        Ok(())
    }

    /// Synchronously load and promote the first entries, then move the
    /// cursor past them.
    pub fn load_initial<S>(&mut self, surface: &mut S) -> Result<(), CacheError>
    where
        S: DisplaySurface<Handle = H>,
    {
        let count = self.config.initial_load_count.min(self.loader.dataset.len());
        for index in 0..count {
            self.ensure_loaded(index, surface)?;
        }

        self.state.cursor.store(count, Ordering::Release);
        info!(count, "loaded initial images");
        Ok(())
    }

    /// Start the background workers from the current cursor position.
    ///
    /// No workers are started when there is nothing left to load.
    pub fn spawn_workers(&mut self) {
        if !self.workers.is_empty() {
            return;
        }

        let len = self.loader.dataset.len();
        let num_workers = self.config.num_workers;
        if self.state.cursor.load(Ordering::Acquire) >= len || num_workers == 0 {
            self.state.complete.store(true, Ordering::Release);
            debug!("nothing to load in the background");
            return;
        }

        self.state.running.store(true, Ordering::Release);
        self.workers = (0..num_workers)
            .map(|_| {
                let loader = Arc::clone(&self.loader);
                let state = Arc::clone(&self.state);
                let delay = self.config.worker_delay;
                thread::spawn(move || loader.run_worker(&state, num_workers, delay))
            })
            .collect();
        info!(num_workers, remaining = len - self.progress(), "started loading workers");
    }

    /// Decode and promote every eye of entry `index` on the calling thread if
    /// it is not ready yet. Slots that failed to decode are skipped.
    pub fn ensure_loaded<S>(&self, index: usize, surface: &mut S) -> Result<(), CacheError>
    where
        S: DisplaySurface<Handle = H>,
    {
        let cache = &self.loader.cache;
        for eye in self.loader.dataset.layout().eyes() {
            if cache.is_ready(index, *eye) {
                continue;
            }
            if self.loader.load_slot(index, *eye) {
                cache.promote_to_ready(index, *eye, surface)?;
            }
        }
        Ok(())
    }

    /// Number of indices claimed so far, including the initial batch.
    pub fn progress(&self) -> usize {
        self.state
            .cursor
            .load(Ordering::Acquire)
            .min(self.loader.dataset.len())
    }

    /// Whether every worker has exited.
    pub fn is_complete(&self) -> bool {
        self.state.complete.load(Ordering::Acquire)
    }

    /// Block until every worker has exited on its own.
    pub fn wait(&mut self) {
        self.join();
    }

    /// Ask the workers to stop after their current index and wait for them.
    pub fn shutdown(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.join();
    }

    fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("loading worker panicked");
            }
        }
    }
}

impl<H> Drop for LoadScheduler<H> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
