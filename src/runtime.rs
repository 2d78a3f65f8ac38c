//! Process-wide background runtime.
//!
//! One worker thread serves every open ball. Work arrives as boxed
//! closures on a FIFO queue guarded by a mutex and condition variable;
//! jobs execute strictly in enqueue order, which is what serialises a
//! dirty-page flush against a later reload of the same page. The
//! runtime is created when the first ball opens and joined when the
//! last ball closes — an explicit object rather than ambient static
//! initialisation.
//!
//! Callers that must wait for a result (the hard-miss reload) use
//! [`Runtime::run_sync`]; everything else is fire-and-forget. A panic
//! inside a job is contained and logged; the worker never dies early.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::error::{Error, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Shared state between submitters and the worker.
pub(crate) struct Runtime {
    queue: Mutex<VecDeque<Job>>,
    job_ready: Condvar,
    shutdown: AtomicBool,
}

impl Runtime {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            job_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues a job for the worker.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        let mut queue = self.queue.lock();
        queue.push_back(job);
        self.job_ready.notify_one();
        Ok(())
    }

    /// Runs `f` on the worker and blocks until it completes.
    ///
    /// This is the one synchronously-waited path: a hard miss that the
    /// caller needs inline. Queue order still applies, so a flush of the
    /// same page enqueued earlier lands in the store first.
    pub(crate) fn run_sync<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot: Arc<(Mutex<Option<T>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = slot.clone();
        self.submit(Box::new(move || {
            let value = f();
            let (lock, cond) = &*signal;
            *lock.lock() = Some(value);
            cond.notify_all();
        }))?;

        let (lock, cond) = &*slot;
        let mut guard = lock.lock();
        while guard.is_none() {
            cond.wait(&mut guard);
        }
        Ok(guard.take().expect("slot filled before notify"))
    }

    /// Blocks until every job enqueued before this call has executed.
    pub(crate) fn drain(&self) -> Result<()> {
        self.run_sync(|| ())
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.job_ready.wait(&mut queue);
                }
            };
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("background job panicked; worker continues");
            }
        }
    }
}

struct Global {
    runtime: Arc<Runtime>,
    worker: Option<JoinHandle<()>>,
    open_balls: FxHashSet<u64>,
    next_ball_id: u64,
}

/// The open-balls registry and its worker, created lazily.
static GLOBAL: Mutex<Option<Global>> = Mutex::new(None);

/// Registers a new ball, starting the worker if this is the first one.
pub(crate) fn register_ball() -> (u64, Arc<Runtime>) {
    let mut global = GLOBAL.lock();
    let state = global.get_or_insert_with(|| {
        let runtime = Arc::new(Runtime::new());
        let worker = {
            let runtime = runtime.clone();
            std::thread::Builder::new()
                .name("pagekit-worker".into())
                .spawn(move || runtime.worker_loop())
                .expect("failed to spawn worker thread")
        };
        tracing::debug!("started background worker");
        Global {
            runtime,
            worker: Some(worker),
            open_balls: FxHashSet::default(),
            next_ball_id: 0,
        }
    });

    let id = state.next_ball_id;
    state.next_ball_id += 1;
    state.open_balls.insert(id);
    (id, state.runtime.clone())
}

/// Removes a ball from the registry; the last one out joins the worker.
pub(crate) fn deregister_ball(id: u64) {
    let finished = {
        let mut global = GLOBAL.lock();
        let last = match global.as_mut() {
            None => return,
            Some(state) => {
                state.open_balls.remove(&id);
                state.open_balls.is_empty()
            }
        };
        if last {
            global.take()
        } else {
            None
        }
    };

    if let Some(mut state) = finished {
        state.runtime.shutdown.store(true, Ordering::Release);
        state.runtime.job_ready.notify_all();
        if let Some(worker) = state.worker.take() {
            if worker.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
        tracing::debug!("joined background worker");
    }
}

/// Number of currently open balls (diagnostics).
pub fn open_ball_count() -> usize {
    GLOBAL.lock().as_ref().map_or(0, |g| g.open_balls.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// The registry is process-global; these tests take turns.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn jobs_run_in_enqueue_order() {
        let _serial = SERIAL.lock();
        let (id, runtime) = register_ball();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..8u32 {
            let order = order.clone();
            runtime
                .submit(Box::new(move || order.lock().push(tag)))
                .unwrap();
        }
        runtime.drain().unwrap();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
        deregister_ball(id);
    }

    #[test]
    fn run_sync_returns_the_value() {
        let _serial = SERIAL.lock();
        let (id, runtime) = register_ball();
        let value = runtime.run_sync(|| 21 * 2).unwrap();
        assert_eq!(value, 42);
        deregister_ball(id);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let _serial = SERIAL.lock();
        let (id, runtime) = register_ball();
        let ran = Arc::new(AtomicUsize::new(0));
        runtime.submit(Box::new(|| panic!("contained"))).unwrap();
        let after = ran.clone();
        runtime
            .submit(Box::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        runtime.drain().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        deregister_ball(id);
    }

    #[test]
    fn last_ball_shuts_the_worker_down() {
        let _serial = SERIAL.lock();
        let (first, runtime) = register_ball();
        let (second, _) = register_ball();
        deregister_ball(first);
        // Still accepting: one ball remains open.
        runtime.drain().unwrap();
        deregister_ball(second);
        assert!(matches!(
            runtime.submit(Box::new(|| {})),
            Err(Error::ShutdownInProgress)
        ));
    }
}
