//! Worker thread pool.
//!
//! A fixed set of threads consumes a FIFO queue guarded by a mutex and
//! condvar. Enqueueing a task wakes one worker; shutdown flips the closed
//! flag under the lock, wakes everyone, and joins. Workers drain the
//! queue before exiting, so tasks accepted before shutdown still run.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    queue: Arc<(Mutex<Queue>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers.
    ///
    /// # Panics
    /// Panics if `count` is 0.
    pub fn new(count: usize) -> io::Result<WorkerPool> {
        assert!(count > 0, "worker pool needs at least one thread");
        let queue = Arc::new((
            Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, queue))?;
            workers.push(handle);
        }

        Ok(WorkerPool { queue, workers })
    }

    /// Queue a task and wake one worker.
    ///
    /// Tasks submitted after `shutdown` are dropped.
    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        let (lock, cond) = &*self.queue;
        let mut queue = lock.lock().unwrap();
        if queue.closed {
            warn!("task submitted to a closed worker pool, dropping it");
            return;
        }
        queue.tasks.push_back(Box::new(task));
        cond.notify_one();
    }

    /// Close the queue, wake all workers, and join them.
    ///
    /// Tasks already queued run to completion before the workers exit.
    pub fn shutdown(&mut self) {
        let (lock, cond) = &*self.queue;
        {
            let mut queue = lock.lock().unwrap();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        cond.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, queue: Arc<(Mutex<Queue>, Condvar)>) {
    debug!(worker = worker_id, "worker started");
    let (lock, cond) = &*queue;
    let mut guard = lock.lock().unwrap();
    loop {
        if let Some(task) = guard.tasks.pop_front() {
            // the task runs without holding the queue lock
            drop(guard);
            task();
            guard = lock.lock().unwrap();
        } else if guard.closed {
            break;
        } else {
            guard = cond.wait(guard).unwrap();
        }
    }
    debug!(worker = worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_every_task_runs_exactly_once() {
        let mut pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.add_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_queued_tasks_drain_on_shutdown() {
        // One worker held busy while the queue fills, then immediate shutdown.
        let mut pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.add_task(|| thread::sleep(Duration::from_millis(50)));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.add_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_single_worker_runs_in_submission_order() {
        let mut pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            pool.add_task(move || order.lock().unwrap().push(i));
        }
        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_after_shutdown_is_dropped() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.add_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic]
    fn test_zero_workers_panics() {
        let _ = WorkerPool::new(0);
    }
}
