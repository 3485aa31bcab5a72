// Pool Module - Fixed set of worker threads draining per-frame task batches
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// Unit of work handed to the pool
pub type Task<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded worker pool.
///
/// Workers live as long as the pool and pull one job at a time from a shared
/// channel. A batch never has more than `size` jobs in flight.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (jobs, queue) = unbounded::<Job>();

        let workers = (0..size)
            .map(|index| {
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("pool-worker-{}", index))
                    .spawn(move || worker_loop(queue))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!("Failed to spawn pool worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!("Worker pool started with {} workers", workers.len());

        WorkerPool {
            jobs: Some(jobs),
            size: workers.len().max(1),
            workers,
        }
    }

    /// Pool size for a layout: never more workers than the busiest phase has jobs
    pub fn size_for(configured_workers: usize, areas: usize, universes: usize) -> usize {
        configured_workers.min(areas.max(universes)).max(1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run every task and return their outcomes in submission order.
    ///
    /// Tasks are handed out in chunks of `size`; the next chunk starts only
    /// after the whole previous chunk reported back. A panicking task shows
    /// up as `Error::TaskPanicked`.
    pub fn run_batch<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> Vec<Result<T>> {
        let mut results: Vec<Option<Result<T>>> = (0..tasks.len()).map(|_| None).collect();
        let (done_tx, done_rx) = unbounded::<(usize, Result<T>)>();

        let mut pending = tasks.into_iter().enumerate().peekable();
        while pending.peek().is_some() {
            let mut taken = 0;
            for (index, task) in pending.by_ref().take(self.size) {
                let done = done_tx.clone();
                let job: Job = Box::new(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(
                        |payload| Err(Error::TaskPanicked(panic_message(payload))),
                    );
                    let _ = done.send((index, outcome));
                });

                if let Err(rejected) = self.submit(job) {
                    // no worker left to run it; run on the caller so the batch still completes
                    (rejected)();
                }
                taken += 1;
            }

            for _ in 0..taken {
                match done_rx.recv() {
                    Ok((index, outcome)) => results[index] = Some(outcome),
                    Err(_) => break,
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::TaskPanicked("task lost".to_string()))))
            .collect()
    }

    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        if self.workers.is_empty() {
            return Err(job);
        }
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel ends every worker loop
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(queue: Receiver<Job>) {
    for job in queue.iter() {
        job();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
