//! Background jobs with cancellation and non-blocking completion checks
//!
//! Coefficient computation and pixel rendering run on the blocking pool of
//! the tokio runtime. The interactive side keeps a [`JobHandle`] and checks
//! it from a low-frequency tick; checking never waits for the worker.
//! Dropping a handle cancels the job and detaches it, so a superseded job
//! can still run to its next cancellation point but its result goes nowhere.
//! A job spawned after another one waits on the other's [`JobLatch`] before
//! doing any work, so at most one job of a chain runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::CageError;
use crate::progress::{JobProgress, ProgressReporter};

/// Shared cancellation flag checked by workers between chunks
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Bail out of a worker loop once cancelled
    pub fn check(&self) -> Result<(), CageError> {
        if self.is_cancelled() {
            Err(CageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Released once a job's worker has returned, successful or not
#[derive(Debug, Clone, Default)]
pub struct JobLatch(Arc<(Mutex<bool>, Condvar)>);

impl JobLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn release(&self) {
        let (done, cond) = &*self.0;
        *done.lock() = true;
        cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        let (done, _) = &*self.0;
        *done.lock()
    }

    /// Block until released
    pub fn wait(&self) {
        let (done, cond) = &*self.0;
        let mut done = done.lock();
        while !*done {
            cond.wait(&mut done);
        }
    }
}

/// Releases the latch when the worker leaves, panics included
struct ReleaseOnDrop(JobLatch);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Outcome of a completion check
#[derive(Debug)]
pub enum JobPoll<T> {
    Pending,
    Ready(Result<T, CageError>),
}

/// Handle to a running background job
pub struct JobHandle<T> {
    label: &'static str,
    generation: u64,
    cancel: CancelToken,
    progress: Arc<JobProgress>,
    latch: JobLatch,
    task: Option<JoinHandle<Result<T, CageError>>>,
}

impl<T: Send + 'static> JobHandle<T> {
    /// Start `work` on the blocking pool of `runtime`
    pub fn spawn<F>(
        runtime: &Handle,
        label: &'static str,
        generation: u64,
        reporter: Arc<dyn ProgressReporter>,
        work: F,
    ) -> Self
    where
        F: FnOnce(&CancelToken, &JobProgress) -> Result<T, CageError> + Send + 'static,
    {
        Self::spawn_after(runtime, label, generation, reporter, None, work)
    }

    /// Start `work` once the job owning `after` has returned.
    ///
    /// A job cancelled while it waits returns without reporting any
    /// progress.
    pub fn spawn_after<F>(
        runtime: &Handle,
        label: &'static str,
        generation: u64,
        reporter: Arc<dyn ProgressReporter>,
        after: Option<JobLatch>,
        work: F,
    ) -> Self
    where
        F: FnOnce(&CancelToken, &JobProgress) -> Result<T, CageError> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let progress = Arc::new(JobProgress::with_cancel(reporter, cancel.clone()));
        let latch = JobLatch::new();

        let task = {
            let cancel = cancel.clone();
            let progress = progress.clone();
            let release = ReleaseOnDrop(latch.clone());
            runtime.spawn_blocking(move || {
                let _release = release;
                if let Some(previous) = after {
                    previous.wait();
                }
                cancel.check()?;

                progress.start(label);
                let result = work(&cancel, &progress);
                progress.end();
                result
            })
        };

        debug!("Started job '{}' (generation {})", label, generation);

        Self {
            label,
            generation,
            cancel,
            progress,
            latch,
            task: Some(task),
        }
    }

    /// Check for completion without blocking.
    ///
    /// Returns the result exactly once; later calls report a failure.
    pub fn poll(&mut self) -> JobPoll<T> {
        let Some(task) = self.task.as_mut() else {
            return JobPoll::Ready(Err(CageError::JobFailed(format!(
                "result of '{}' was already taken",
                self.label
            ))));
        };

        if !task.is_finished() {
            return JobPoll::Pending;
        }

        match task.now_or_never() {
            Some(joined) => {
                self.task = None;
                JobPoll::Ready(joined.unwrap_or_else(|e| Err(CageError::JobFailed(e.to_string()))))
            }
            None => JobPoll::Pending,
        }
    }

    /// Wait for the job to finish
    pub async fn wait(mut self) -> Result<T, CageError> {
        let Some(task) = self.task.take() else {
            return Err(CageError::JobFailed(format!(
                "result of '{}' was already taken",
                self.label
            )));
        };

        task.await
            .unwrap_or_else(|e| Err(CageError::JobFailed(e.to_string())))
    }
}

impl<T> JobHandle<T> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Latch released when the worker has returned
    pub fn latch(&self) -> JobLatch {
        self.latch.clone()
    }

    /// Fraction of completion reported so far
    pub fn progress(&self) -> f64 {
        self.progress.value()
    }

    /// Ask the worker to stop at its next cancellation point
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling job '{}' (generation {})", self.label, self.generation);
            self.cancel.cancel();
        }
    }
}

impl<T> Drop for JobHandle<T> {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel();
        }
    }
}
