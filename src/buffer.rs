//! Read-ahead iterator.
//!
//! [`BufferedIterator`] pulls items from its source on a shared rayon pool into a bounded queue,
//! so that slow producers (decoding, disk reads) overlap with consumption. At most one fill task
//! runs per iterator; it yields its pool thread after a soft deadline and reschedules itself.

use crate::config::{BufferConfig, HistoryConfig};
use crate::error::{HistoryError, Result, SharedError};
use crate::telemetry::{history_metrics, noop_event_listener, HistoryEvent, HistoryEventListener};

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type BoxedSource<T> = Box<dyn Iterator<Item = std::result::Result<T, SharedError>> + Send>;
type Wakeup = Box<dyn FnOnce() + Send + 'static>;

/// Failure recorded when the source panics while producing an item.
#[derive(Debug, thiserror::Error)]
#[error("source panicked: {0}")]
pub struct SourcePanicked(pub String);

/// Minimum size of the shared fill pool. Sources may themselves block on other buffered
/// iterators, so a single-threaded pool could starve.
const MIN_SHARED_FILL_THREADS: usize = 4;

/// Builds a pool suitable for [`BufferedIterator::with_pool`].
pub fn build_fill_pool(threads: Option<usize>) -> Result<Arc<ThreadPool>> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("monsoon-fill-{}", i));
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map(Arc::new)
        .map_err(|e| HistoryError::InvalidArgument(format!("failed to build fill pool: {}", e)))
}

/// The process-wide fill pool, built on first use.
pub fn shared_fill_pool() -> Result<Arc<ThreadPool>> {
    static POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
    if let Some(pool) = POOL.get() {
        return Ok(Arc::clone(pool));
    }
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_SHARED_FILL_THREADS);
    let pool = build_fill_pool(Some(threads))?;
    Ok(Arc::clone(POOL.get_or_init(|| pool)))
}

struct State<T> {
    queue: VecDeque<T>,
    at_end: bool,
    failure: Option<SharedError>,
    running: bool,
    wakeup: Option<Wakeup>,
}

impl<T> State<T> {
    fn available(&self) -> bool {
        !self.queue.is_empty() || self.at_end || self.failure.is_some()
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    source: Mutex<BoxedSource<T>>,
    capacity: usize,
    fill_deadline: Duration,
    pool: Arc<ThreadPool>,
    events: Arc<dyn HistoryEventListener>,
}

impl<T: Send + 'static> Shared<T> {
    // Nothing user-supplied runs under the state lock, so a poisoned guard is still consistent.
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the single fill slot if a fill is needed. The caller spawns when this returns true.
    fn claim_fill(&self, state: &mut State<T>) -> bool {
        if state.running
            || state.at_end
            || state.failure.is_some()
            || state.queue.len() >= self.capacity
        {
            return false;
        }
        state.running = true;
        true
    }

    fn spawn_fill(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pool.spawn(move || fill(weak));
    }

    fn pull_one(&self) -> Option<std::result::Result<T, SharedError>> {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        match panic::catch_unwind(AssertUnwindSafe(|| source.next())) {
            Ok(item) => item,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                let err: SharedError = Arc::new(SourcePanicked(msg));
                Some(Err(err))
            }
        }
    }
}

/// Body of a fill task. Holds only a weak reference between items, so dropping the iterator
/// stops the fill at the next item boundary.
fn fill<T: Send + 'static>(weak: Weak<Shared<T>>) {
    let started = Instant::now();
    let mut filled = 0u64;
    loop {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        {
            let mut state = shared.lock_state();
            if state.at_end || state.failure.is_some() || state.queue.len() >= shared.capacity {
                state.running = false;
                break;
            }
            if started.elapsed() >= shared.fill_deadline {
                let queued = state.queue.len();
                drop(state);
                shared.events.on_event(HistoryEvent::FillRescheduled { queued });
                shared.spawn_fill();
                break;
            }
        }

        let item = shared.pull_one();

        let mut state = shared.lock_state();
        match item {
            Some(Ok(v)) => {
                state.queue.push_back(v);
                filled += 1;
            }
            Some(Err(e)) => {
                shared.events.on_event(HistoryEvent::ProducerFailed {
                    error: e.to_string(),
                });
                state.failure = Some(e);
            }
            None => state.at_end = true,
        }
        let wakeup = state.wakeup.take();
        drop(state);
        shared.cond.notify_all();
        if let Some(wakeup) = wakeup {
            shared.pool.spawn(wakeup);
        }
    }
    history_metrics::record_buffered_fill(filled);
}

/// Wakeup shared between the availability path and a timer. Whoever takes it first runs it.
struct TimedWakeup {
    slot: Mutex<Option<Wakeup>>,
    taken: Condvar,
}

impl TimedWakeup {
    fn new(wakeup: Wakeup) -> Self {
        TimedWakeup {
            slot: Mutex::new(Some(wakeup)),
            taken: Condvar::new(),
        }
    }

    fn take(&self) -> Option<Wakeup> {
        let wakeup = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.taken.notify_all();
        wakeup
    }

    /// Blocks until the wakeup is taken elsewhere or `timeout` elapses. Returns the wakeup if
    /// it is still pending at the deadline.
    fn wait_expired(&self, timeout: Duration) -> Option<Wakeup> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .taken
            .wait_timeout_while(slot, timeout, |slot| slot.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// Iterator that reads ahead of its consumer.
///
/// Source failures (errors or panics) are captured once. Items queued before the failure are
/// still returned; after that every call returns the same error.
pub struct BufferedIterator<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> std::fmt::Debug for BufferedIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("BufferedIterator")
            .field("capacity", &self.shared.capacity)
            .field("queued", &state.queue.len())
            .field("at_end", &state.at_end)
            .field("failed", &state.failure.is_some())
            .finish()
    }
}

impl<T: Send + 'static> BufferedIterator<T> {
    /// Wraps `source` with the default capacity on the shared fill pool.
    pub fn new<I, E>(source: I) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        Self::with_pool(source, &BufferConfig::default(), shared_fill_pool()?, noop_event_listener())
    }

    pub fn with_capacity<I, E>(source: I, capacity: usize) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        let cfg = BufferConfig {
            capacity,
            ..BufferConfig::default()
        };
        Self::with_pool(source, &cfg, shared_fill_pool()?, noop_event_listener())
    }

    /// Uses the buffer settings and event listener of `cfg`. A `fill_threads` setting gets a
    /// pool of its own; otherwise the shared pool is used.
    pub fn with_config<I, E>(source: I, cfg: &HistoryConfig) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        let pool = match cfg.buffer.fill_threads {
            Some(n) => build_fill_pool(Some(n))?,
            None => shared_fill_pool()?,
        };
        Self::with_pool(source, &cfg.buffer, pool, Arc::clone(&cfg.event_listener))
    }

    /// Starts filling immediately.
    pub fn with_pool<I, E>(
        source: I,
        cfg: &BufferConfig,
        pool: Arc<ThreadPool>,
        events: Arc<dyn HistoryEventListener>,
    ) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        if cfg.capacity == 0 {
            return Err(HistoryError::InvalidArgument(
                "buffered iterator capacity must be at least 1".to_string(),
            ));
        }
        let source: BoxedSource<T> = Box::new(source.map(|item| {
            item.map_err(|e| {
                let boxed: Box<dyn StdError + Send + Sync> = e.into();
                SharedError::from(boxed)
            })
        }));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(cfg.capacity),
                at_end: false,
                failure: None,
                running: false,
                wakeup: None,
            }),
            cond: Condvar::new(),
            source: Mutex::new(source),
            capacity: cfg.capacity,
            fill_deadline: cfg.fill_deadline,
            pool,
            events,
        });
        let it = BufferedIterator { shared };
        it.fire();
        Ok(it)
    }

    /// Wraps a source that cannot fail.
    pub fn from_iter<I>(source: I) -> Result<Self>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        Self::new(source.map(Ok::<T, Infallible>))
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn fire(&self) {
        let spawn = {
            let mut state = self.shared.lock_state();
            self.shared.claim_fill(&mut state)
        };
        if spawn {
            self.shared.spawn_fill();
        }
    }

    /// Takes the oldest queued item without blocking.
    ///
    /// `Ok(None)` means nothing is queued yet, or the source is exhausted (see [`Self::at_end`]).
    pub fn try_next(&mut self) -> Result<Option<T>> {
        let result = {
            let mut state = self.shared.lock_state();
            match state.queue.pop_front() {
                Some(v) => Ok(Some(v)),
                None => match &state.failure {
                    Some(e) => Err(HistoryError::Producer(Arc::clone(e))),
                    None => Ok(None),
                },
            }
        };
        self.fire();
        result
    }

    /// Blocks until an item is queued, the source ended, or the source failed.
    pub fn wait_avail(&self) {
        self.fire();
        let mut state = self.shared.lock_state();
        while !state.available() {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Self::wait_avail`], giving up after `timeout`. Returns whether the wait was satisfied.
    pub fn wait_avail_timeout(&self, timeout: Duration) -> bool {
        self.fire();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !state.available() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Registers a one-shot callback, run on the fill pool once an item is available or the
    /// source ended or failed. Fires right away if that is already the case. Replaces any
    /// callback that has not fired yet.
    pub fn set_wakeup<F>(&self, wakeup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock_state();
        if state.available() {
            drop(state);
            self.shared.pool.spawn(wakeup);
            return;
        }
        state.wakeup = Some(Box::new(wakeup));
        drop(state);
        self.fire();
    }

    /// Like [`Self::set_wakeup`], but also fires once `timeout` elapses, whichever comes first.
    /// The callback still runs exactly once, on the fill pool.
    pub fn set_wakeup_timeout<F>(&self, wakeup: F, timeout: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm_wakeup_timeout(Box::new(wakeup), timeout)?;
        Ok(())
    }

    /// Registers `wakeup` and starts its timer. The timer thread exits as soon as the callback
    /// has been taken by either side.
    fn arm_wakeup_timeout(&self, wakeup: Wakeup, timeout: Duration) -> Result<JoinHandle<()>> {
        let timed = Arc::new(TimedWakeup::new(wakeup));

        let timer = Arc::clone(&timed);
        let pool = Arc::clone(&self.shared.pool);
        let handle = std::thread::Builder::new()
            .name("monsoon-wakeup-timer".to_string())
            .spawn(move || {
                if let Some(f) = timer.wait_expired(timeout) {
                    pool.spawn(f);
                }
            })?;

        self.set_wakeup(move || {
            if let Some(f) = timed.take() {
                f();
            }
        });
        Ok(handle)
    }

    /// True once the source is exhausted and every queued item has been taken.
    pub fn at_end(&self) -> bool {
        let state = self.shared.lock_state();
        state.queue.is_empty() && state.at_end && state.failure.is_none()
    }

    /// True if [`Self::try_next`] would return an item or an error right now.
    pub fn next_avail(&self) -> bool {
        let state = self.shared.lock_state();
        !state.queue.is_empty() || state.failure.is_some()
    }
}

/// Blocking iteration. After a source failure this yields the same error forever.
impl<T: Send + 'static> Iterator for BufferedIterator<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.wait_avail();
        self.try_next().transpose()
    }
}
