//! Ordered execution of deferred tasks on a dedicated worker thread
//!
//! Used to run application callbacks away from the threads that deliver
//! service responses, while preserving submission order.

use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crossbeam_channel::{Sender, unbounded};

use crate::status::Status;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    sender: Option<Sender<Task>>,
    worker: Option<thread::JoinHandle<()>>,
    shutting_down: bool,
}

pub struct AsyncTaskQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl AsyncTaskQueue {
    /// Creates an idle queue. The worker thread is only spawned with the first task.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                sender: None,
                worker: None,
                shutting_down: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `task` behind all previously added tasks
    pub fn add<F>(&self, task: F) -> Status
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.shutting_down {
            tracing::debug!("{}: add refused, shutting down", self.name);
            return Status::NotAllowed;
        }

        if state.sender.is_none() {
            let (sender, receiver) = unbounded::<Task>();
            let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
                // Ends once the sender is dropped and the queue is drained
                for task in receiver.iter() {
                    task();
                }
            });
            match spawned {
                Ok(handle) => {
                    state.sender = Some(sender);
                    state.worker = Some(handle);
                }
                Err(e) => {
                    tracing::error!("{}: failed to spawn worker thread: {}", self.name, e);
                    return Status::Failed;
                }
            }
        }

        let Some(sender) = state.sender.as_ref() else {
            return Status::Failed;
        };
        match sender.send(Box::new(task)) {
            Ok(()) => Status::Success,
            Err(_) => {
                tracing::error!("{}: worker thread is gone", self.name);
                Status::Failed
            }
        }
    }

    /// Queues `task`, which will only run if `owner` is still alive when it is dequeued.
    /// The owner is kept alive for the duration of the task.
    pub fn add_bound<F, T>(&self, task: F, owner: Weak<T>) -> Status
    where
        F: FnOnce() + Send + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.add(move || match owner.upgrade() {
            Some(_owner) => task(),
            None => tracing::debug!("{}: owner gone, task skipped", name),
        })
    }

    /// Runs the remaining queued tasks and stops the worker thread.
    /// Must not be called from within a task.
    pub fn shutdown(&self) {
        let (sender, worker) = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            (state.sender.take(), state.worker.take())
        };
        tracing::debug!("{}: shutdown started", self.name);

        // Closing the channel lets the worker finish the backlog and exit
        drop(sender);
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                tracing::warn!("{}: shutdown called from its own worker, not joining", self.name);
            } else if worker.join().is_err() {
                tracing::error!("{}: worker thread panicked", self.name);
            }
        }
        tracing::debug!("{}: shutdown complete", self.name);
    }
}

impl Drop for AsyncTaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::debug;

    #[test]
    fn test_tasks_run_in_order() {
        debug::setup_logging_verbose();
        let queue = AsyncTaskQueue::new("test-queue");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            assert_eq!(queue.add(move || seen.lock().unwrap().push(i)), Status::Success);
        }
        queue.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_after_shutdown_refused() {
        debug::setup_logging_verbose();
        let queue = AsyncTaskQueue::new("test-queue");
        queue.shutdown();
        queue.shutdown();
        assert_eq!(queue.add(|| {}), Status::NotAllowed);
    }

    #[test]
    fn test_bound_task_skipped_when_owner_dropped() {
        debug::setup_logging_verbose();
        let queue = AsyncTaskQueue::new("test-queue");
        let ran = Arc::new(Mutex::new(Vec::new()));

        let alive = Arc::new(());
        let dropped = Arc::new(());
        let weak_dropped = Arc::downgrade(&dropped);
        drop(dropped);

        let r = ran.clone();
        queue.add_bound(move || r.lock().unwrap().push("alive"), Arc::downgrade(&alive));
        let r = ran.clone();
        queue.add_bound(move || r.lock().unwrap().push("dropped"), weak_dropped);
        queue.shutdown();

        assert_eq!(*ran.lock().unwrap(), vec!["alive"]);
    }
}
