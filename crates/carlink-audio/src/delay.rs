//! Deferred start of interrupting jobs
//!
//! An interrupting job must not overlap audio the head unit is still
//! playing, so while sent audio remains it waits here. A newer interrupting
//! job replaces any that are still waiting.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::AudioJob;

#[derive(Default)]
pub(crate) struct DelayStartHandler {
    queue: Mutex<VecDeque<AudioJob>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DelayStartHandler {
    /// Hold `job` for `delay`. Returns the job back when no wait is needed.
    ///
    /// `on_elapsed` runs once the delay passes; only the first deferral arms
    /// the timer.
    pub(crate) fn defer<F>(&self, job: AudioJob, delay: Duration, on_elapsed: F) -> Option<AudioJob>
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            return Some(job);
        }

        let superseded: Vec<AudioJob> = {
            let mut queue = self.queue.lock();
            let superseded = if job.interrupt {
                queue.drain(..).collect()
            } else {
                Vec::new()
            };
            debug!("Deferring job {} for {:?}", job.id, delay);
            queue.push_back(job);
            superseded
        };
        for job in superseded {
            job.cancel();
        }

        let mut timer = self.timer.lock();
        if timer.is_none() {
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                on_elapsed();
            }));
        }
        None
    }

    /// Next job to retry once the timer fired
    pub(crate) fn take_ready(&self) -> Option<AudioJob> {
        self.timer.lock().take();

        let (job, dropped) = {
            let mut queue = self.queue.lock();
            let job = queue.pop_front();
            let dropped: Vec<AudioJob> = match &job {
                Some(job) if job.interrupt => queue.drain(..).collect(),
                _ => Vec::new(),
            };
            (job, dropped)
        };
        for job in dropped {
            job.cancel();
        }
        job
    }

    /// Cancel every waiting job and the timer
    pub(crate) fn release(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        let waiting: Vec<AudioJob> = self.queue.lock().drain(..).collect();
        for job in waiting {
            job.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
