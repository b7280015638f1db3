//! Paced sample delivery
//!
//! One scheduler task per playing job. Chunks are sent once the wall clock
//! since the first chunk arrived, plus one second of lead, has passed their
//! presentation timestamp. A chunk carrying a finish flag completes the job
//! once everything sent so far has had time to play out.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::session::StreamingSession;

/// How far ahead of real time samples may be sent
pub const LEAD_TIME: Duration = Duration::from_secs(1);

/// Re-poll interval while the head chunk is not yet due
pub const REPOLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishFlag {
    NotFinished,
    Success,
    Failed,
}

/// A decoded buffer queued for sending. `data` is absent for the marker
/// chunk that only ends a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleChunk {
    pub data: Option<Bytes>,
    pub presentation_time_us: u64,
    pub finish: FinishFlag,
}

impl SampleChunk {
    pub fn new(data: Bytes, presentation_time_us: u64, finish: FinishFlag) -> Self {
        Self {
            data: Some(data),
            presentation_time_us,
            finish,
        }
    }

    pub fn finished(finish: FinishFlag) -> Self {
        Self {
            data: None,
            presentation_time_us: 0,
            finish,
        }
    }
}

/// When the last sent sample is due to finish playing. Shared by every
/// scheduler of one manager.
#[derive(Debug, Default)]
pub(crate) struct PacingClock {
    end_of_send: Mutex<Option<Instant>>,
}

impl PacingClock {
    fn mark(&self, end: Instant) {
        *self.end_of_send.lock() = Some(end);
    }

    fn end(&self) -> Option<Instant> {
        *self.end_of_send.lock()
    }

    /// Forget previously sent audio
    pub(crate) fn reset(&self) {
        *self.end_of_send.lock() = None;
    }

    /// Time until everything sent so far has played out
    pub(crate) fn remaining(&self) -> Duration {
        self.end()
            .map(|end| end.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

pub(crate) type FinishCallback = Box<dyn FnOnce(bool) + Send + 'static>;

enum SchedulerCommand {
    Add(Vec<SampleChunk>),
    Terminate,
}

#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub(crate) fn add(&self, chunks: Vec<SampleChunk>) {
        let _ = self.tx.send(SchedulerCommand::Add(chunks));
    }

    /// Drop all pending chunks. The finish callback is not called.
    pub(crate) fn terminate(&self) {
        let _ = self.tx.send(SchedulerCommand::Terminate);
    }

    /// Handle with no scheduler behind it
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

enum Tick {
    Idle,
    Wait(Instant),
    Finish { at: Instant, success: bool },
}

struct Scheduler {
    job_id: u64,
    chunks: VecDeque<SampleChunk>,
    start: Option<Instant>,
    sink: Arc<dyn StreamingSession>,
    clock: Arc<PacingClock>,
}

pub(crate) fn spawn_scheduler(
    job_id: u64,
    sink: Arc<dyn StreamingSession>,
    clock: Arc<PacingClock>,
    on_finish: FinishCallback,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler {
        job_id,
        chunks: VecDeque::new(),
        start: None,
        sink,
        clock,
    };
    let task = tokio::spawn(scheduler.run(rx, on_finish));
    (SchedulerHandle { tx }, task)
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerCommand>, on_finish: FinishCallback) {
        let mut next_tick: Option<Instant> = None;
        let mut finish: Option<(Instant, bool)> = None;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SchedulerCommand::Add(chunks)) => {
                        if finish.is_some() {
                            continue;
                        }
                        if self.start.is_none() {
                            self.start = Some(Instant::now());
                        }
                        self.chunks.extend(chunks);
                        if next_tick.is_none() {
                            next_tick = Some(Instant::now());
                        }
                    }
                    Some(SchedulerCommand::Terminate) | None => {
                        debug!("Scheduler for job {} terminated", self.job_id);
                        return;
                    }
                },
                _ = sleep_until(next_tick.unwrap_or_else(Instant::now)), if next_tick.is_some() => {
                    next_tick = None;
                    match self.tick().await {
                        Tick::Idle => {}
                        Tick::Wait(at) => next_tick = Some(at),
                        Tick::Finish { at, success } => finish = Some((at, success)),
                    }
                }
                _ = sleep_until(finish.map_or_else(Instant::now, |(at, _)| at)), if finish.is_some() => {
                    let success = finish.map_or(false, |(_, success)| success);
                    debug!("Job {} finished (success: {})", self.job_id, success);
                    on_finish(success);
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) -> Tick {
        let Some(start) = self.start else {
            return Tick::Idle;
        };

        loop {
            let Some((data, pts)) = self
                .chunks
                .front()
                .map(|c| (c.data.clone(), c.presentation_time_us))
            else {
                return Tick::Idle;
            };

            if let Some(data) = data {
                let now = Instant::now();
                let allowable_us = (now.duration_since(start) + LEAD_TIME).as_micros();
                if allowable_us <= pts as u128 {
                    return Tick::Wait(now + REPOLL_INTERVAL);
                }
                self.clock.mark(start + Duration::from_micros(pts));
                if let Err(e) = self.sink.send_audio(data, pts).await {
                    warn!("Failed to send audio for job {}: {}", self.job_id, e);
                }
            }

            let Some(chunk) = self.chunks.pop_front() else {
                return Tick::Idle;
            };
            if chunk.finish != FinishFlag::NotFinished {
                let now = Instant::now();
                let at = self.clock.end().map_or(now, |end| end.max(now));
                return Tick::Finish {
                    at,
                    success: chunk.finish == FinishFlag::Success,
                };
            }
        }
    }
}
