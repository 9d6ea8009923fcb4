use super::error::DhtError;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Reusable container for one unit of queued work.
///
/// Results never travel through the container; they are handed back over a
/// channel captured by the job itself, so recycling a container cannot race
/// a waiter reading its result.
struct WorkItem {
    job: Option<Job>,
    blocking: bool,
}

enum Signal {
    Work(Box<WorkItem>),
    Shutdown,
}

struct Pool {
    items: Option<ArrayQueue<Box<WorkItem>>>,
    allocated: AtomicUsize,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            items: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            allocated: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Box<WorkItem> {
        if let Some(item) = self.items.as_ref().and_then(ArrayQueue::pop) {
            return item;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Box::new(WorkItem {
            job: None,
            blocking: false,
        })
    }

    fn give_back(&self, mut item: Box<WorkItem>) {
        item.job = None;
        item.blocking = false;
        if let Some(items) = &self.items {
            let _ = items.push(item);
        }
    }
}

struct Inner {
    name: String,
    sender: Sender<Signal>,
    pool: Arc<Pool>,
    handle: Handle,
    worker: ThreadId,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.sender.send(Signal::Shutdown);
    }
}

/// Serial executor that owns all mutation of engine state.
///
/// Jobs run one at a time, in submission order, on a dedicated thread that
/// sleeps while the queue is empty. Any thread may submit. Clones share the
/// same worker.
///
/// # Examples
///
/// ```
/// use rdht::dht::MainLoop;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), rdht::dht::DhtError> {
/// let main_loop = MainLoop::new("example")?;
/// let answer = main_loop.queue_wait(|| 6 * 7).await?;
/// assert_eq!(answer, 42);
/// main_loop.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MainLoop {
    inner: Arc<Inner>,
}

impl MainLoop {
    /// Starts a worker bound to the current tokio runtime.
    pub fn new(name: &str) -> Result<Self, DhtError> {
        let handle = Handle::try_current()
            .map_err(|e| DhtError::Scheduler(format!("no tokio runtime: {}", e)))?;
        Self::with_handle(name, handle, super::config::DEFAULT_SCHEDULER_POOL)
    }

    /// Starts a worker bound to `handle`, keeping up to `pool_capacity`
    /// spare work-item containers. A capacity of zero disables pooling.
    pub fn with_handle(name: &str, handle: Handle, pool_capacity: usize) -> Result<Self, DhtError> {
        let (sender, receiver) = channel::unbounded();
        let pool = Arc::new(Pool::new(pool_capacity));

        let worker = {
            let pool = pool.clone();
            let handle = handle.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || run(name, receiver, pool, handle))?
        };

        debug!(main_loop = name, pool_capacity, "main loop started");

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                sender,
                pool,
                handle,
                worker: worker.thread().id(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// True when called from the worker thread itself.
    pub fn is_worker(&self) -> bool {
        thread::current().id() == self.inner.worker
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enqueues `job` without waiting for it.
    pub fn queue<F>(&self, job: F) -> Result<(), DhtError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job), false)
    }

    /// Runs `job` on the worker and resolves with its result.
    ///
    /// Fails with [`DhtError::Scheduler`] if the job panics.
    pub async fn queue_wait<F, R>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker() {
            return Ok(job());
        }

        let (tx, rx) = oneshot::channel();
        self.submit(
            Box::new(move || {
                let _ = tx.send(job());
            }),
            false,
        )?;
        rx.await.map_err(|_| self.lost_result())
    }

    /// Runs `job` on the worker and blocks the calling thread until it
    /// finishes. Called from the worker itself, the job runs in place.
    ///
    /// Must not be called from inside an async context; use
    /// [`queue_wait`](Self::queue_wait) there.
    pub fn queue_wait_blocking<F, R>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker() {
            return Ok(job());
        }

        let (tx, rx) = oneshot::channel();
        self.submit(
            Box::new(move || {
                let _ = tx.send(job());
            }),
            true,
        )?;
        rx.blocking_recv().map_err(|_| self.lost_result())
    }

    /// Runs `job` on the worker after `delay`, then again every `delay` for
    /// as long as it returns `true`.
    ///
    /// The timer holds no strong reference to the loop; it stops by itself
    /// once every [`MainLoop`] handle is dropped.
    pub fn queue_timeout<F>(&self, delay: Duration, job: F) -> TimeoutHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = self.inner.handle.spawn(async move {
            let mut job = job;
            loop {
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let main_loop = MainLoop { inner };
                let fired = main_loop
                    .queue_wait(move || {
                        let again = job();
                        (job, again)
                    })
                    .await;
                drop(main_loop);

                match fired {
                    Ok((returned, true)) => job = returned,
                    Ok((_, false)) => break,
                    Err(e) => {
                        trace!("timeout dropped: {}", e);
                        break;
                    }
                }
            }
        });

        TimeoutHandle {
            abort: task.abort_handle(),
        }
    }

    /// Stops the worker once the work already queued has run. Later
    /// submissions fail with [`DhtError::Shutdown`].
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.sender.send(Signal::Shutdown);
            debug!(main_loop = %self.inner.name, "main loop shutting down");
        }
    }

    fn submit(&self, job: Job, blocking: bool) -> Result<(), DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::Shutdown);
        }

        let mut item = self.inner.pool.take();
        item.job = Some(job);
        item.blocking = blocking;

        self.inner
            .sender
            .send(Signal::Work(item))
            .map_err(|_| DhtError::Shutdown)
    }

    fn lost_result(&self) -> DhtError {
        if self.is_shutdown() {
            DhtError::Shutdown
        } else {
            DhtError::Scheduler("job panicked before producing a result".into())
        }
    }

    #[cfg(test)]
    fn allocated_containers(&self) -> usize {
        self.inner.pool.allocated.load(Ordering::Relaxed)
    }
}

fn run(name: String, receiver: Receiver<Signal>, pool: Arc<Pool>, handle: Handle) {
    let _runtime = handle.enter();

    while let Ok(signal) = receiver.recv() {
        let mut item = match signal {
            Signal::Work(item) => item,
            Signal::Shutdown => break,
        };

        if let Some(job) = item.job.take() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(main_loop = %name, blocking = item.blocking, "main loop job panicked");
            }
        }
        pool.give_back(item);
    }

    debug!(main_loop = %name, "main loop stopped");
}

/// Cancels a pending [`MainLoop::queue_timeout`]. Dropping the handle leaves
/// the timer running.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    abort: AbortHandle,
}

impl TimeoutHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn queue_wait_returns_result() {
        let main_loop = MainLoop::new("test").unwrap();
        let value = main_loop.queue_wait(|| "done").await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let main_loop = MainLoop::new("test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = seen.clone();
            main_loop.queue(move || seen.lock().push(i)).unwrap();
        }
        main_loop.queue_wait(|| ()).await.unwrap();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn jobs_run_on_the_worker_thread() {
        let main_loop = MainLoop::new("test").unwrap();
        assert!(!main_loop.is_worker());

        let probe = main_loop.clone();
        assert!(main_loop.queue_wait(move || probe.is_worker()).await.unwrap());
    }

    #[tokio::test]
    async fn behaves_the_same_with_and_without_pooling() {
        for capacity in [0, 4] {
            let main_loop = MainLoop::with_handle("test", Handle::current(), capacity).unwrap();
            let counter = Arc::new(AtomicU32::new(0));

            for i in 0..100u32 {
                let counter = counter.clone();
                let seen = main_loop
                    .queue_wait(move || counter.fetch_add(1, Ordering::SeqCst))
                    .await
                    .unwrap();
                assert_eq!(seen, i);
            }

            if capacity == 0 {
                assert_eq!(main_loop.allocated_containers(), 100);
            } else {
                assert!(main_loop.allocated_containers() <= 2);
            }
        }
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_worker() {
        let main_loop = MainLoop::new("test").unwrap();

        let result = main_loop.queue_wait(|| -> u8 { panic!("boom") }).await;
        assert!(matches!(result, Err(DhtError::Scheduler(_))));

        assert_eq!(main_loop.queue_wait(|| 1).await.unwrap(), 1);
    }

    #[test]
    fn blocking_submit_from_outside_the_runtime() {
        let rt = runtime();
        let main_loop = MainLoop::with_handle("test", rt.handle().clone(), 8).unwrap();

        assert_eq!(main_loop.queue_wait_blocking(|| 7).unwrap(), 7);
    }

    #[test]
    fn blocking_submit_from_the_worker_runs_in_place() {
        let rt = runtime();
        let main_loop = MainLoop::with_handle("test", rt.handle().clone(), 8).unwrap();

        let nested = main_loop.clone();
        let result = main_loop
            .queue_wait_blocking(move || {
                let inner = nested.clone();
                nested
                    .queue_wait_blocking(move || inner.is_worker())
                    .unwrap()
            })
            .unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn timeout_fires_on_the_worker() {
        let main_loop = MainLoop::new("test").unwrap();
        let (tx, rx) = oneshot::channel();
        let probe = main_loop.clone();
        let mut tx = Some(tx);

        main_loop.queue_timeout(Duration::from_millis(10), move || {
            if let Some(tx) = tx.take() {
                let _ = tx.send(probe.is_worker());
            }
            false
        });

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_rearms_while_job_returns_true() {
        let main_loop = MainLoop::new("test").unwrap();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        let handle = main_loop.queue_timeout(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst) + 1 < 3
        });

        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_timeout_never_fires() {
        let main_loop = MainLoop::new("test").unwrap();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let handle = main_loop.queue_timeout(Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
            false
        });
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects() {
        let main_loop = MainLoop::new("test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        main_loop.queue(move || flag.store(true, Ordering::SeqCst)).unwrap();
        main_loop.shutdown();

        assert!(matches!(main_loop.queue(|| ()), Err(DhtError::Shutdown)));
        assert!(matches!(
            main_loop.queue_wait(|| ()).await,
            Err(DhtError::Shutdown)
        ));

        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
