//! Job Queue
//!
//! Runs an ordered list of jobs on one dedicated worker thread, strictly one
//! after the other, and reports back to the controlling thread over a
//! channel. The queue is fail-fast: the first `JobResult::Failure` ends the
//! run and no later job is started.
//!
//! # Progress
//!
//! Every job carries a weight. Overall progress is
//!
//! ```text
//! (weight of finished jobs + weight of current job * its fraction) / total weight
//! ```
//!
//! and is never allowed to move backwards, even if a job reports a smaller
//! fraction than before.
//!
//! # Cancellation
//!
//! `QueueHandle::cancel()` stops the run before the next job starts. A job
//! that is already executing always runs to completion.

use crate::error::Result;
use crate::job::{Job, JobContext, JobList, JobResult};
use crate::storage::GlobalStore;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Progress and lifecycle notifications sent by the worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobStarted {
        index: usize,
        total: usize,
        name: String,
    },
    Progress {
        /// Overall progress in `[0.0, 1.0]`.
        percent: f64,
        /// Status text of the running job.
        status: String,
    },
    JobFinished {
        index: usize,
        name: String,
    },
    Failed {
        index: usize,
        job: String,
        message: String,
        details: String,
    },
    Finished,
    Cancelled {
        completed: usize,
    },
}

/// How a queue run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Every job returned `Ok`.
    Finished,
    /// Job `index` failed; nothing after it ran.
    Failed {
        index: usize,
        job: String,
        message: String,
        details: String,
    },
    /// Stopped between jobs after `completed` jobs had finished.
    Cancelled { completed: usize },
}

impl QueueOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

struct QueuedJob {
    job: Box<dyn Job>,
    weight: f64,
}

/// Ordered collection of jobs waiting to run.
pub struct JobQueue {
    storage: Arc<GlobalStore>,
    jobs: Vec<QueuedJob>,
}

impl JobQueue {
    pub fn new(storage: Arc<GlobalStore>) -> Self {
        Self {
            storage,
            jobs: Vec::new(),
        }
    }

    #[inline]
    pub fn storage(&self) -> &Arc<GlobalStore> {
        &self.storage
    }

    /// Append jobs, each weighted by its own `Job::weight()`.
    pub fn enqueue(&mut self, jobs: JobList) {
        for job in jobs {
            let weight = sanitize_weight(job.weight());
            self.jobs.push(QueuedJob { job, weight });
        }
    }

    /// Append one module's jobs as a group worth `group_weight` in total.
    ///
    /// The group weight is spread over its jobs in proportion to their own
    /// weights, so a module's share of the progress bar does not depend on
    /// how many jobs it produces.
    pub fn enqueue_group(&mut self, group_weight: f64, jobs: JobList) {
        let group_weight = sanitize_weight(group_weight);
        let own_total: f64 = jobs.iter().map(|j| sanitize_weight(j.weight())).sum();
        for job in jobs {
            let share = sanitize_weight(job.weight()) / own_total;
            self.jobs.push(QueuedJob {
                job,
                weight: group_weight * share,
            });
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pretty names of the queued jobs, in run order.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|q| q.job.pretty_name()).collect()
    }

    /// Move the jobs onto a new worker thread and start running them.
    pub fn start(self) -> Result<QueueHandle> {
        let (tx, events) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            storage: self.storage,
            jobs: self.jobs,
            events: tx,
            cancel: Arc::clone(&cancel),
        };
        let handle = thread::Builder::new()
            .name("job-queue".to_string())
            .spawn(move || worker.run())?;
        Ok(QueueHandle {
            events,
            cancel,
            worker: handle,
        })
    }

    /// Start the queue and block until it ends, discarding events.
    pub fn run(self) -> Result<QueueOutcome> {
        Ok(self.start()?.wait())
    }
}

/// Control-side handle of a running queue.
pub struct QueueHandle {
    events: Receiver<QueueEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<QueueOutcome>,
}

impl QueueHandle {
    /// Event stream; disconnects once the worker has finished.
    pub fn events(&self) -> &Receiver<QueueEvent> {
        &self.events
    }

    /// Do not start any further job.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker thread and return how the run ended.
    pub fn wait(self) -> QueueOutcome {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(payload) => {
                let details = panic_message(payload.as_ref());
                error!("Job queue worker panicked: {}", details);
                QueueOutcome::Failed {
                    index: 0,
                    job: String::new(),
                    message: "Job queue worker crashed".to_string(),
                    details,
                }
            }
        }
    }
}

struct Worker {
    storage: Arc<GlobalStore>,
    jobs: Vec<QueuedJob>,
    events: Sender<QueueEvent>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) -> QueueOutcome {
        let Worker {
            storage,
            jobs,
            events,
            cancel,
        } = self;
        // Nobody listening is fine: `JobQueue::run` drops the receiver.
        let emit = |event: QueueEvent| {
            let _ = events.send(event);
        };

        let total = jobs.len();
        let total_weight: f64 = jobs.iter().map(|q| q.weight).sum();
        let tracker = Arc::new(ProgressTracker::new(total_weight, events.clone()));
        info!("Job queue starting {} job(s)", total);

        for (index, QueuedJob { mut job, weight }) in jobs.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!("Job queue cancelled after {} of {} job(s)", index, total);
                emit(QueueEvent::Cancelled { completed: index });
                return QueueOutcome::Cancelled { completed: index };
            }

            let name = job.pretty_name();
            info!("Starting job \"{}\" ({}/{})", name, index + 1, total);
            emit(QueueEvent::JobStarted {
                index,
                total,
                name: name.clone(),
            });
            tracker.begin_job(weight, job.pretty_status_message().unwrap_or_else(|| name.clone()));

            let progress_tracker = Arc::clone(&tracker);
            let status_tracker = Arc::clone(&tracker);
            let ctx = JobContext::with_sinks(
                Arc::clone(&storage),
                Arc::new(move |fraction: f64| progress_tracker.job_progress(fraction)),
                Arc::new(move |status: String| status_tracker.job_status(status)),
            );

            let result = panic::catch_unwind(AssertUnwindSafe(|| job.exec(&ctx)))
                .unwrap_or_else(|payload| {
                    JobResult::error(
                        format!("Job \"{}\" crashed", name),
                        panic_message(payload.as_ref()),
                    )
                });
            drop(job);

            match result {
                JobResult::Ok => {
                    debug!("Job \"{}\" finished", name);
                    tracker.finish_job();
                    emit(QueueEvent::JobFinished { index, name });
                }
                JobResult::Failure { message, details } => {
                    warn!("Job \"{}\" failed: {} {}", name, message, details);
                    emit(QueueEvent::Failed {
                        index,
                        job: name.clone(),
                        message: message.clone(),
                        details: details.clone(),
                    });
                    return QueueOutcome::Failed {
                        index,
                        job: name,
                        message,
                        details,
                    };
                }
            }
        }

        info!("Job queue finished");
        emit(QueueEvent::Finished);
        QueueOutcome::Finished
    }
}

/// Weighted, monotonic overall progress.
struct ProgressTracker {
    total_weight: f64,
    state: Mutex<TrackerState>,
    events: Sender<QueueEvent>,
}

#[derive(Default)]
struct TrackerState {
    finished_weight: f64,
    current_weight: f64,
    current_fraction: f64,
    reported: f64,
    status: String,
}

impl ProgressTracker {
    fn new(total_weight: f64, events: Sender<QueueEvent>) -> Self {
        Self {
            total_weight,
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    fn begin_job(&self, weight: f64, status: String) {
        self.update(|state| {
            state.current_weight = weight;
            state.current_fraction = 0.0;
            state.status = status;
        });
    }

    fn job_progress(&self, fraction: f64) {
        self.update(|state| state.current_fraction = fraction.clamp(0.0, 1.0));
    }

    fn job_status(&self, status: String) {
        self.update(|state| state.status = status);
    }

    fn finish_job(&self) {
        self.update(|state| {
            state.finished_weight += state.current_weight;
            state.current_weight = 0.0;
            state.current_fraction = 0.0;
        });
    }

    fn update(&self, f: impl FnOnce(&mut TrackerState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        let raw = if self.total_weight > 0.0 {
            (state.finished_weight + state.current_weight * state.current_fraction)
                / self.total_weight
        } else {
            0.0
        };
        state.reported = state.reported.max(raw.clamp(0.0, 1.0));
        let _ = self.events.send(QueueEvent::Progress {
            percent: state.reported,
            status: state.status.clone(),
        });
    }
}

fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        1.0
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
