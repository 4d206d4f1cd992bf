//! Dynamically sized worker pool.
//!
//! Workers are OS threads pulling from one FIFO task queue. The pool keeps at
//! least `min_threads` alive while running, grows by one thread per submission
//! while the backlog exceeds the idle workers (up to `max_threads`), and lets
//! surplus workers retire after `max_idle` without work.
//!
//! Locks:
//! - `control`: serialises start/stop/pause and growth decisions. `submit`
//!   only tries it, so a slow `stop` never blocks producers.
//! - queue lock: the task queue; every counter change happens under it.
//! - worker list lock: join handles of spawned workers.

mod task;

pub use task::{FutureStatus, TaskFuture};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use task::Task;

const WAIT_RECHECK: Duration = Duration::from_millis(50);

/// Lifecycle state of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Stop = 0,
    Running = 1,
    Paused = 2,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stop,
        }
    }
}

/// Identifier of a worker thread, unique per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const WORKER_RUNNING: u8 = 0;
const WORKER_STOP: u8 = 1;

struct WorkerThread {
    id: WorkerId,
    status: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl WorkerThread {
    fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == WORKER_STOP
    }
}

struct PoolInner {
    state: AtomicU8,
    queue: Mutex<VecDeque<Task>>,
    /// Signalled on new work and on state changes.
    task_ready: Condvar,
    /// Signalled whenever a worker finishes a task or leaves the pool.
    drained: Condvar,
    workers: Mutex<Vec<WorkerThread>>,
    min_threads: AtomicUsize,
    max_threads: AtomicUsize,
    cur_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    max_idle: Duration,
    next_worker: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Task queue mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerThread>> {
        self.workers.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Worker list mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

/// Worker pool running submitted closures on OS threads.
///
/// Created stopped; call [`start`](Self::start) to spawn the initial workers.
/// Tasks submitted while stopped stay queued until the next start.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    control: Mutex<()>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig::new(config.min_threads, config.max_threads)
            .with_max_idle(config.max_idle);
        Self {
            inner: Arc::new(PoolInner {
                state: AtomicU8::new(PoolState::Stop as u8),
                queue: Mutex::new(VecDeque::new()),
                task_ready: Condvar::new(),
                drained: Condvar::new(),
                workers: Mutex::new(Vec::new()),
                min_threads: AtomicUsize::new(config.min_threads),
                max_threads: AtomicUsize::new(config.max_threads),
                cur_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                max_idle: config.max_idle,
                next_worker: AtomicU64::new(0),
            }),
            control: Mutex::new(()),
        }
    }

    /// Build and start a pool in one step.
    pub fn started(config: PoolConfig) -> Result<Self> {
        let pool = Self::new(config);
        pool.start()?;
        Ok(pool)
    }

    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn min_threads(&self) -> usize {
        self.inner.min_threads.load(Ordering::Acquire)
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads.load(Ordering::Acquire)
    }

    /// Workers currently owned by the pool, busy or idle.
    pub fn current_threads(&self) -> usize {
        self.inner.cur_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.inner.idle_threads.load(Ordering::Acquire)
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner.lock_queue().len()
    }

    /// Raises `max_threads` too if it would fall below the new minimum.
    pub fn set_min_threads(&self, min: usize) {
        let _control = self.lock_control();
        self.inner.min_threads.store(min, Ordering::Release);
        if self.max_threads() < min {
            self.inner.max_threads.store(min.max(1), Ordering::Release);
        }
        self.grow_if_backlogged();
    }

    /// Clamped to at least `min_threads` and at least 1. Existing surplus
    /// workers are not interrupted; they retire through the idle policy.
    pub fn set_max_threads(&self, max: usize) {
        let _control = self.lock_control();
        let max = max.max(self.min_threads()).max(1);
        self.inner.max_threads.store(max, Ordering::Release);
        self.grow_if_backlogged();
    }

    /// Start with `min_threads` workers. Returns `Ok(false)` if already running.
    pub fn start(&self) -> Result<bool> {
        self.start_with(self.min_threads())
    }

    /// Start with `threads` workers, clamped into `[min_threads, max_threads]`.
    /// Returns `Ok(false)` without side effects if the pool is not stopped.
    pub fn start_with(&self, threads: usize) -> Result<bool> {
        let _control = self.lock_control();
        {
            let _queue = self.inner.lock_queue();
            if self.inner.state() != PoolState::Stop {
                return Ok(false);
            }
            self.inner.set_state(PoolState::Running);
        }

        let threads = threads.max(self.min_threads()).min(self.max_threads());
        for _ in 0..threads {
            self.spawn_worker()?;
        }
        self.grow_if_backlogged();
        self.inner.task_ready.notify_all();

        tracing::debug!(threads, "Thread pool started");
        Ok(true)
    }

    /// Stop the pool: wake and join every worker (running tasks finish first),
    /// discard queued tasks and reset the counters. Returns `false` if already
    /// stopped.
    ///
    /// Must not be called from inside a task running on this pool.
    pub fn stop(&self) -> bool {
        let _control = self.lock_control();
        {
            let _queue = self.inner.lock_queue();
            if self.inner.state() == PoolState::Stop {
                return false;
            }
            self.inner.set_state(PoolState::Stop);
            self.inner.task_ready.notify_all();
        }

        let workers = std::mem::take(&mut *self.inner.lock_workers());
        let joined = workers.len();
        for worker in workers {
            if worker.handle.join().is_err() {
                tracing::error!(worker = %worker.id, "Worker thread panicked outside a task");
            }
        }

        let discarded = {
            let mut queue = self.inner.lock_queue();
            self.inner.cur_threads.store(0, Ordering::Release);
            self.inner.idle_threads.store(0, Ordering::Release);
            self.inner.drained.notify_all();
            std::mem::take(&mut *queue)
        };

        tracing::debug!(
            joined,
            discarded = discarded.len(),
            "Thread pool stopped"
        );
        // Dropped outside the queue lock: abandoned tasks resolve their futures here.
        drop(discarded);
        true
    }

    /// Workers stop taking new tasks until [`resume`](Self::resume). Queued
    /// tasks are kept.
    pub fn pause(&self) -> bool {
        let _control = self.lock_control();
        let _queue = self.inner.lock_queue();
        if self.inner.state() != PoolState::Running {
            return false;
        }
        self.inner.set_state(PoolState::Paused);
        true
    }

    pub fn resume(&self) -> bool {
        let _control = self.lock_control();
        {
            let _queue = self.inner.lock_queue();
            if self.inner.state() != PoolState::Paused {
                return false;
            }
            self.inner.set_state(PoolState::Running);
            self.inner.task_ready.notify_all();
        }
        self.grow_if_backlogged();
        true
    }

    /// Block until the queue is empty and every worker is idle, or the pool
    /// is stopped.
    pub fn wait(&self) {
        let mut queue = self.inner.lock_queue();
        loop {
            if self.inner.state() == PoolState::Stop
                || (queue.is_empty() && self.idle_threads() == self.current_threads())
            {
                return;
            }
            queue = self
                .inner
                .drained
                .wait_timeout(queue, WAIT_RECHECK)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Queue `f` and return a future for its result. Never blocks on the work.
    ///
    /// Growth is skipped while another thread holds `control` (start, stop,
    /// pause, resume or a setter); those re-check the backlog themselves. The
    /// exception is a running pool with no workers at all, which waits for
    /// `control` so the task cannot strand.
    pub fn submit<F, T>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, future) = Task::new(f);
        self.inner.lock_queue().push_back(task);
        {
            let control = match self.control.try_lock() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock)
                    if self.state() == PoolState::Running && self.current_threads() == 0 =>
                {
                    Some(self.lock_control())
                }
                Err(TryLockError::WouldBlock) => None,
            };
            if control.is_some() {
                self.grow_if_backlogged();
            }
        }
        self.inner.task_ready.notify_one();
        future
    }

    /// Spawn one more worker if the backlog exceeds idle capacity. Caller holds `control`.
    fn grow_if_backlogged(&self) {
        let queued = self.inner.lock_queue().len();
        if self.inner.state() == PoolState::Running
            && self.idle_threads() < queued
            && self.current_threads() < self.max_threads()
            && let Err(e) = self.spawn_worker()
        {
            tracing::warn!(error = %e, queued, "Failed to grow thread pool");
        }
    }

    /// Caller holds `control`.
    fn spawn_worker(&self) -> Result<()> {
        self.reap_retired();

        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::Relaxed));
        let status = Arc::new(AtomicU8::new(WORKER_RUNNING));
        {
            let _queue = self.inner.lock_queue();
            self.inner.cur_threads.fetch_add(1, Ordering::AcqRel);
            self.inner.idle_threads.fetch_add(1, Ordering::AcqRel);
        }

        let inner = Arc::clone(&self.inner);
        let worker_status = Arc::clone(&status);
        let spawned = thread::Builder::new()
            .name(format!("volley-worker-{}", id))
            .spawn(move || worker_loop(inner, id, worker_status));

        match spawned {
            Ok(handle) => {
                self.inner.lock_workers().push(WorkerThread { id, status, handle });
                tracing::debug!(worker = %id, "Worker spawned");
                Ok(())
            }
            Err(e) => {
                let _queue = self.inner.lock_queue();
                self.inner.cur_threads.fetch_sub(1, Ordering::AcqRel);
                self.inner.idle_threads.fetch_sub(1, Ordering::AcqRel);
                Err(Error::Spawn(e.to_string()))
            }
        }
    }

    /// Join workers that retired through the idle policy.
    fn reap_retired(&self) {
        let retired: Vec<WorkerThread> = {
            let mut workers = self.inner.lock_workers();
            let (retired, alive) = std::mem::take(&mut *workers)
                .into_iter()
                .partition(WorkerThread::is_stopped);
            *workers = alive;
            retired
        };
        for worker in retired {
            if worker.handle.join().is_err() {
                tracing::error!(worker = %worker.id, "Retired worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<PoolInner>, id: WorkerId, status: Arc<AtomicU8>) {
    loop {
        let task = {
            let mut queue = inner.lock_queue();
            loop {
                match inner.state() {
                    PoolState::Stop => {
                        status.store(WORKER_STOP, Ordering::Release);
                        return;
                    }
                    PoolState::Running => {
                        if let Some(task) = queue.pop_front() {
                            inner.idle_threads.fetch_sub(1, Ordering::AcqRel);
                            break task;
                        }
                    }
                    PoolState::Paused => {}
                }

                let (guard, wait) = inner
                    .task_ready
                    .wait_timeout(queue, inner.max_idle)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue = guard;

                if wait.timed_out()
                    && queue.is_empty()
                    && inner.state() == PoolState::Running
                    && inner.cur_threads.load(Ordering::Acquire)
                        > inner.min_threads.load(Ordering::Acquire)
                {
                    inner.cur_threads.fetch_sub(1, Ordering::AcqRel);
                    inner.idle_threads.fetch_sub(1, Ordering::AcqRel);
                    status.store(WORKER_STOP, Ordering::Release);
                    inner.drained.notify_all();
                    tracing::debug!(worker = %id, "Idle worker retired");
                    return;
                }
            }
        };

        task.run();

        let _queue = inner.lock_queue();
        inner.idle_threads.fetch_add(1, Ordering::AcqRel);
        inner.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn fixed(threads: usize) -> ThreadPool {
        ThreadPool::new(PoolConfig::new(threads, threads))
    }

    fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn fixed_pool_runs_every_task_once() {
        let pool = fixed(3);
        assert_eq!(pool.start(), Ok(true));
        assert_eq!(pool.current_threads(), 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let futures: Vec<_> = (0..200)
            .map(|i| {
                let seen = Arc::clone(&seen);
                pool.submit(move || seen.lock().unwrap().push(i))
            })
            .collect();
        pool.wait();

        assert_eq!(pool.current_threads(), 3);
        assert_eq!(pool.idle_threads(), 3);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
        assert!(futures.iter().all(|f| f.is_ready()));
    }

    #[test]
    fn growing_pool_stays_within_bounds() {
        let pool = ThreadPool::new(PoolConfig::new(1, 10));
        pool.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let _ = pool.submit(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        let cur = pool.current_threads();
        assert!((1..=10).contains(&cur), "current threads = {cur}");
        assert!(pool.idle_threads() <= cur);
    }

    #[test]
    fn submit_to_stopped_pool_runs_only_after_start() {
        let pool = fixed(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut future = pool.submit(move || c.fetch_add(1, Ordering::SeqCst) + 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.current_threads(), 0);
        assert_eq!(pool.queued_tasks(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!future.is_ready());

        pool.start().unwrap();
        assert_eq!(future.get(), Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lifecycle_calls_are_idempotent() {
        let pool = fixed(1);
        assert!(!pool.stop());
        assert_eq!(pool.start(), Ok(true));
        assert_eq!(pool.start(), Ok(false));
        assert_eq!(pool.current_threads(), 1);
        assert!(pool.stop());
        assert!(!pool.stop());
        assert_eq!(pool.state(), PoolState::Stop);
        assert_eq!(pool.current_threads(), 0);
        assert_eq!(pool.idle_threads(), 0);
    }

    #[test]
    fn start_with_clamps_thread_count() {
        let pool = ThreadPool::new(PoolConfig::new(2, 4));
        pool.start_with(16).unwrap();
        assert_eq!(pool.current_threads(), 4);
        pool.stop();

        pool.start_with(0).unwrap();
        assert_eq!(pool.current_threads(), 2);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = fixed(1);
        pool.start().unwrap();

        let mut bad = pool.submit(|| -> u32 { panic!("task failure") });
        assert_eq!(bad.get(), Err(Error::TaskPanicked("task failure".into())));

        let mut good = pool.submit(|| 7);
        assert_eq!(good.get(), Ok(7));
        assert_eq!(pool.current_threads(), 1);
    }

    #[test]
    fn stop_finishes_running_task_and_discards_pending() {
        let pool = Arc::new(fixed(1));
        pool.start().unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut running = pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            "finished"
        });
        started_rx.recv().unwrap();
        let mut pending = pool.submit(|| "never");

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.stop())
        };
        assert!(eventually(Duration::from_secs(2), || pool.state()
            == PoolState::Stop));
        release_tx.send(()).unwrap();
        assert!(stopper.join().unwrap());

        assert_eq!(running.get(), Ok("finished"));
        assert_eq!(pending.get(), Err(Error::Abandoned));
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[test]
    fn surplus_workers_retire_when_idle() {
        let pool = ThreadPool::new(
            PoolConfig::new(1, 4).with_max_idle(Duration::from_millis(30)),
        );
        pool.start().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let futures: Vec<_> = (0..4)
            .map(|_| {
                let rx = Arc::clone(&release_rx);
                pool.submit(move || {
                    let _ = rx.lock().unwrap().recv_timeout(Duration::from_secs(2));
                })
            })
            .collect();
        assert!(pool.current_threads() > 1);
        assert!(pool.current_threads() <= 4);

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for mut f in futures {
            f.get().unwrap();
        }

        assert!(eventually(Duration::from_secs(3), || pool.current_threads()
            == 1));
        assert_eq!(pool.idle_threads(), 1);
    }

    #[test]
    fn paused_pool_holds_tasks_until_resumed() {
        let pool = fixed(1);
        pool.start().unwrap();
        assert!(pool.pause());
        assert!(!pool.pause());

        let mut future = pool.submit(|| 5);
        assert_eq!(
            future.wait_for(Duration::from_millis(50)),
            Ok(FutureStatus::Timeout)
        );
        assert_eq!(pool.queued_tasks(), 1);

        assert!(pool.resume());
        assert_eq!(future.get(), Ok(5));
    }

    #[test]
    fn setters_keep_bounds_ordered() {
        let pool = ThreadPool::new(PoolConfig::new(1, 2));
        pool.set_min_threads(5);
        assert_eq!(pool.min_threads(), 5);
        assert_eq!(pool.max_threads(), 5);
        pool.set_max_threads(3);
        assert_eq!(pool.max_threads(), 5);
        pool.set_max_threads(8);
        assert_eq!(pool.max_threads(), 8);
    }

    #[test]
    fn submit_does_not_wait_for_a_stop_in_progress() {
        let pool = Arc::new(fixed(1));
        pool.start().unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut running = pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.stop())
        };
        assert!(eventually(Duration::from_secs(2), || pool.state()
            == PoolState::Stop));

        // `stop` is now joining the busy worker while holding `control`.
        let submitted = Instant::now();
        let mut late = pool.submit(|| 1);
        assert!(submitted.elapsed() < Duration::from_millis(500));

        release_tx.send(()).unwrap();
        assert!(stopper.join().unwrap());
        assert_eq!(running.get(), Ok(()));
        assert_eq!(late.get(), Err(Error::Abandoned));
    }
}
