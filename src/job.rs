//! Jobs: the unit of installer work
//!
//! Each module contributes one or more jobs. A job has a display name, may
//! publish a live status message and fractional progress while it runs, and
//! ends with a `JobResult`. `exec()` is the only side-effecting operation and
//! is called at most once, on the job queue's worker thread.

use crate::storage::GlobalStore;
use std::fmt;
use std::sync::Arc;

/// Receives fractional progress in `[0.0, 1.0]` from a running job.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Receives live status text from a running job.
pub type StatusSink = Arc<dyn Fn(String) + Send + Sync>;

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Ok,
    Failure {
        /// Short summary, suitable for a dialog title.
        message: String,
        /// Longer explanation for logs; may be empty.
        details: String,
    },
}

impl JobResult {
    pub const fn ok() -> Self {
        Self::Ok
    }

    pub fn error(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            details: details.into(),
        }
    }

    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Summary message; empty for `Ok`.
    pub fn message(&self) -> &str {
        match self {
            Self::Ok => "",
            Self::Failure { message, .. } => message,
        }
    }

    /// Detailed message; empty for `Ok`.
    pub fn details(&self) -> &str {
        match self {
            Self::Ok => "",
            Self::Failure { details, .. } => details,
        }
    }
}

impl From<&JobResult> for bool {
    fn from(result: &JobResult) -> bool {
        result.is_ok()
    }
}

impl From<JobResult> for bool {
    fn from(result: JobResult) -> bool {
        result.is_ok()
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Failure { message, details } if details.is_empty() => f.write_str(message),
            Self::Failure { message, details } => write!(f, "{}: {}", message, details),
        }
    }
}

/// What a running job can reach: the shared store and its progress/status
/// channels back to the queue.
#[derive(Clone)]
pub struct JobContext {
    storage: Arc<GlobalStore>,
    progress: ProgressSink,
    status: StatusSink,
}

impl JobContext {
    /// Context whose progress and status reports go nowhere.
    pub fn new(storage: Arc<GlobalStore>) -> Self {
        Self::with_sinks(storage, Arc::new(|_: f64| {}), Arc::new(|_: String| {}))
    }

    pub fn with_sinks(
        storage: Arc<GlobalStore>,
        progress: ProgressSink,
        status: StatusSink,
    ) -> Self {
        Self {
            storage,
            progress,
            status,
        }
    }

    #[inline]
    pub fn storage(&self) -> &Arc<GlobalStore> {
        &self.storage
    }

    /// Report progress through the current job; clamped to `[0.0, 1.0]`,
    /// NaN is dropped.
    pub fn report_progress(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        (self.progress)(fraction.clamp(0.0, 1.0));
    }

    /// Replace the live status text shown instead of the job's pretty name.
    pub fn set_status(&self, message: impl Into<String>) {
        (self.status)(message.into());
    }

    /// Shared handle to the progress channel, for callbacks that outlive a
    /// borrow of the context (script engines).
    pub fn progress_sink(&self) -> ProgressSink {
        Arc::clone(&self.progress)
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// A schedulable unit of installer work.
pub trait Job: Send {
    /// Display name, used for the UI and logs.
    fn pretty_name(&self) -> String;

    /// Status text to show instead of the pretty name when the job starts.
    fn pretty_status_message(&self) -> Option<String> {
        None
    }

    /// Relative share of the overall progress bar.
    fn weight(&self) -> f64 {
        1.0
    }

    /// Do the work. Called once.
    fn exec(&mut self, ctx: &JobContext) -> JobResult;
}

/// Ordered contribution of one module to the run.
pub type JobList = Vec<Box<dyn Job>>;

/// Job built from a closure; handy for small built-in steps and tests.
pub struct FnJob<F> {
    name: String,
    weight: f64,
    run: F,
}

impl<F> FnJob<F>
where
    F: FnMut(&JobContext) -> JobResult + Send,
{
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            run,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn boxed(self) -> Box<dyn Job>
    where
        F: 'static,
    {
        Box::new(self)
    }
}

impl<F> Job for FnJob<F>
where
    F: FnMut(&JobContext) -> JobResult + Send,
{
    fn pretty_name(&self) -> String {
        self.name.clone()
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn exec(&mut self, ctx: &JobContext) -> JobResult {
        (self.run)(ctx)
    }
}
