//! C12: bounded thread pool for blocking file/sendfile operations.
//!
//! A fixed number of OS threads share one protected FIFO of tasks (§4.11).
//! A task's `work` runs on a pool thread; its `on_complete` is handed to the
//! worker's [`Notifier::notify`](crate::notifier::Notifier::notify), which
//! queues it to run back on the single-threaded event loop the next time it
//! wakes — this is how C12 hands a blocking result back to C7 without ever
//! touching per-connection state from a pool thread itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::notifier::Notifier;

type Work = Box<dyn FnOnce() + Send + 'static>;
type OnComplete = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    work: Work,
    on_complete: OnComplete,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    shutdown: AtomicBool,
    blocked: AtomicUsize,
    notifier: Arc<Notifier>,
}

/// A pool of OS threads draining one shared task queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(size: usize, notifier: Arc<Notifier>) -> ThreadPool {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            blocked: AtomicUsize::new(0),
            notifier,
        });

        let workers = (0..size.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("veyrond-pool-{idx}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        ThreadPool { shared, workers }
    }

    /// Number of tasks currently running or queued — the worker's `blocked`
    /// counter of §4.11.
    pub fn blocked(&self) -> usize {
        self.shared.blocked.load(Ordering::Relaxed)
    }

    /// Submit a blocking task. `work` runs on a pool thread; `on_complete`
    /// is delivered back to the event loop's own thread via the notifier.
    pub fn submit(
        &self,
        work: impl FnOnce() + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
    ) {
        self.shared.blocked.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Task {
            work: Box::new(work),
            on_complete: Box::new(on_complete),
        });
        self.shared.cond.notify_one();
    }

    /// Clean shutdown: stop accepting new iterations of the wait loop once
    /// the queue drains, then join every worker thread. Also run
    /// automatically on `Drop`, so an owner (e.g. [`Worker`](crate::eventloop::Worker))
    /// doesn't need to remember to call this explicitly.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };

        let Some(task) = task else {
            return;
        };

        (task.work)();
        let on_complete = task.on_complete;
        let _ = shared.notifier.notify(move || on_complete());
        shared.blocked.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submitted_work_runs_and_completion_wakes_the_notifier() {
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut pool = ThreadPool::new(2, Arc::clone(&notifier));

        let (tx, rx) = mpsc::channel();
        pool.submit(
            move || {
                tx.send(42).unwrap();
            },
            || {},
        );

        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 42);
        pool.shutdown();
    }

    #[test]
    fn completion_handler_runs_via_process_events() {
        use crate::event::Events;

        let notifier = Arc::new(Notifier::new().unwrap());
        let mut pool = ThreadPool::new(1, Arc::clone(&notifier));

        let (tx, rx) = mpsc::channel();
        pool.submit(|| {}, move || tx.send(()).unwrap());

        let mut events = Events::with_capacity(16);
        notifier
            .process_events(&mut events, Some(std::time::Duration::from_secs(1)))
            .unwrap();

        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_ok());
        pool.shutdown();
    }
}
