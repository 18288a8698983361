//! Timer-driven worker pool for cooperative tasks.
//!
//! A [`Task`] does a bounded amount of non-blocking work each time it runs
//! and returns the next time it wants to run. Workers sleep on a condition
//! variable until the earliest due time. A task is out of the queue while it
//! runs, so it never runs on two workers at once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{ReflectorError, Result};
use crate::time::{Millis, milliseconds};

/// Repeated, non-blocking, time-scheduled work.
pub trait Task: Send + Sync {
    /// Run once. Return the next due time, or `None` to retire the task.
    fn run(&self, now: Millis) -> Option<Millis>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Default)]
struct Queue {
    due: BinaryHeap<Reverse<(Millis, TaskId)>>,
    tasks: HashMap<TaskId, Arc<dyn Task>>,
}

impl Queue {
    /// Pop the earliest due, still-registered task.
    fn pop_due(&mut self, now: Millis) -> Option<(TaskId, Arc<dyn Task>)> {
        while let Some(Reverse((at, id))) = self.due.peek().copied() {
            if at > now {
                return None;
            }
            self.due.pop();
            if let Some(task) = self.tasks.get(&id) {
                return Some((id, task.clone()));
            }
        }
        None
    }

    fn next_due(&self) -> Option<Millis> {
        self.due.peek().map(|Reverse((at, _))| *at)
    }

    fn reschedule(&mut self, id: TaskId, next: Option<Millis>) {
        match next {
            Some(at) if self.tasks.contains_key(&id) => self.due.push(Reverse((at, id))),
            _ => {
                self.tasks.remove(&id);
            }
        }
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// Cooperative scheduler shared by sockets and streams.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    worker_count: usize,
}

impl Scheduler {
    pub fn new(worker_count: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
            worker_count: worker_count.max(1),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ReflectorError::AlreadyRunning);
        }

        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("reflector-worker-{index}"))
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(workers);
                    let _ = self.stop();
                    return Err(e.into());
                }
            }
        }

        tracing::info!(workers = self.worker_count, "scheduler started");
        Ok(())
    }

    /// Stop the workers and wait for them. Queued tasks stay registered.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(ReflectorError::NotStarted);
        }
        {
            // hold the lock so no worker misses the notification
            let _queue = self.shared.queue.lock();
            self.shared.wakeup.notify_all();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue `task` to first run at `at`.
    pub fn schedule(&self, task: Arc<dyn Task>, at: Millis) -> TaskId {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut queue = self.shared.queue.lock();
        queue.tasks.insert(id, task);
        queue.due.push(Reverse((at, id)));
        self.shared.wakeup.notify_one();
        id
    }

    /// Retire a task. A run already in progress finishes but is not requeued.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.queue.lock().tasks.remove(&id).is_some()
    }

    pub fn task_count(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Run every task due at `now` on the calling thread.
    ///
    /// Tasks that ask to run again at or before `now` are not rerun in the
    /// same call. Returns the number of runs.
    pub fn run_due(&self, now: Millis) -> usize {
        let mut ran = Vec::new();
        loop {
            let popped = self.shared.queue.lock().pop_due(now);
            let Some((id, task)) = popped else { break };
            ran.push((id, task.run(now)));
        }
        let count = ran.len();
        let mut queue = self.shared.queue.lock();
        for (id, next) in ran {
            queue.reschedule(id, next);
        }
        count
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count)
            .field("running", &self.is_running())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock();
    while shared.running.load(Ordering::SeqCst) {
        let now = milliseconds();
        if let Some((id, task)) = queue.pop_due(now) {
            drop(queue);
            let next = task.run(now);
            queue = shared.queue.lock();
            queue.reschedule(id, next);
            continue;
        }

        match queue.next_due() {
            Some(at) => {
                let wait = Duration::from_millis((at - now).max(1) as u64);
                shared.wakeup.wait_for(&mut queue, wait);
            }
            None => shared.wakeup.wait(&mut queue),
        }
    }
}
