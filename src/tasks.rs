//! Save task group.
//!
//! A fixed pool of save workers fed over a crossbeam channel. Every spawned task
//! gets a completion handle, kept in issuance order until it is reaped or
//! drained. `drain` waits on every outstanding handle; a failed or panicked
//! task is logged and counted but never stops the drain of the others.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::logging::SessionLog;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Envelope {
    job: Job,
    done: Sender<Result<()>>,
}

struct PendingTask {
    label: String,
    done: Receiver<Result<()>>,
}

/// Lifetime totals, shared with whoever wants to report progress.
#[derive(Debug, Default)]
pub struct TaskCounters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TaskCounters {
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Outcome of one drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
}

pub struct SaveTaskGroup {
    jobs: Option<Sender<Envelope>>,
    workers: Vec<JoinHandle<()>>,
    pending: VecDeque<PendingTask>,
    counters: Arc<TaskCounters>,
    log: SessionLog,
}

impl SaveTaskGroup {
    pub fn new(worker_count: usize, log: SessionLog) -> Result<Self> {
        if worker_count == 0 {
            return Err(anyhow!("save task group needs at least one worker"));
        }
        let (tx, rx) = crossbeam_channel::unbounded::<Envelope>();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("save-worker-{}", index))
                .spawn(move || run_worker(rx))?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(tx),
            workers,
            pending: VecDeque::new(),
            counters: Arc::new(TaskCounters::default()),
            log,
        })
    }

    pub fn counters(&self) -> Arc<TaskCounters> {
        self.counters.clone()
    }

    /// Tasks issued but not yet reaped or drained.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue `job` on the pool and keep a handle to its completion.
    pub fn spawn<F>(&mut self, label: impl Into<String>, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("save task group is shut down, dropped task {}", label))?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        jobs.send(Envelope {
            job: Box::new(job),
            done: done_tx,
        })
        .map_err(|_| anyhow!("save workers are gone, dropped task {}", label))?;
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        self.pending.push_back(PendingTask {
            label,
            done: done_rx,
        });
        Ok(())
    }

    /// Drop handles of tasks that already finished, reporting failures.
    pub fn reap(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        let counters = &self.counters;
        let log = &self.log;
        self.pending.retain(|task| match task.done.try_recv() {
            Ok(outcome) => {
                record(counters, log, &task.label, outcome, &mut report);
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Disconnected) => {
                record(counters, log, &task.label, Err(lost_task()), &mut report);
                false
            }
        });
        report
    }

    /// Wait for every outstanding task, in issuance order.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(task) = self.pending.pop_front() {
            self.log.info(format_args!(
                "waiting for save tasks, {} task(s) are left",
                self.pending.len() + 1
            ));
            let outcome = task.done.recv().unwrap_or_else(|_| Err(lost_task()));
            record(&self.counters, &self.log, &task.label, outcome, &mut report);
        }
        report
    }

    /// Drain, then stop and join the workers. Safe to call more than once.
    pub fn shutdown(&mut self) -> DrainReport {
        let report = self.drain();
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                self.log.error(format_args!("save worker thread panicked"));
            }
        }
        report
    }
}

impl Drop for SaveTaskGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(jobs: Receiver<Envelope>) {
    for Envelope { job, done } in jobs {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job))
            .unwrap_or_else(|_| Err(anyhow!("save task panicked")));
        let _ = done.send(outcome);
    }
}

fn lost_task() -> anyhow::Error {
    anyhow!("save task finished without reporting")
}

fn record(
    counters: &TaskCounters,
    log: &SessionLog,
    label: &str,
    outcome: Result<()>,
    report: &mut DrainReport,
) {
    match outcome {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            report.completed += 1;
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            report.failed += 1;
            log.error(format_args!("could not finish save task {}: {:#}", label, e));
        }
    }
}
