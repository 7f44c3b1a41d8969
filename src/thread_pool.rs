use std::thread::{self, Builder, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub fn default_capacity() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed set of workers pulling from one shared queue.
///
/// A busy worker never holds up tasks that an idle one could take, so a slow
/// callback only occupies its own worker.
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Sender<WorkerMessage>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(capacity);

        for id in 0..capacity {
            workers.push(Worker::new(id, receiver.clone())?);
        }

        Ok(Self { workers, sender })
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(WorkerMessage::Task(Box::new(task)))
            .map_err(|_| Error::Handler("thread pool is shut down".into()))
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(WorkerMessage::Terminate);
        }
        let current = thread::current().id();
        for worker in &mut self.workers {
            if let Some(t) = worker.take_thread() {
                // the last owner may be one of our own workers
                if t.thread().id() == current {
                    continue;
                }
                if t.join().is_err() {
                    warn!(worker = worker.id, "pool worker panicked");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<WorkerMessage>) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("mill-pool-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Task(task) => task(),
                        WorkerMessage::Terminate => break,
                    }
                }
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}
