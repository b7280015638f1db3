//! Decoder seam and the per-job decode task

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::capability::AudioFormat;
use crate::error::Result;
use crate::scheduler::{FinishFlag, SampleChunk, SchedulerHandle};

/// How long one wait for decoder output may take before it is retried
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(3);

/// Something a decoder can read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    File(PathBuf),
    Memory(Bytes),
}

/// One decoded output buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    pub data: Bytes,
    /// Presentation timestamp relative to the start of the source
    pub presentation_time_us: u64,
}

impl SampleBuffer {
    pub fn new(data: impl Into<Bytes>, presentation_time_us: u64) -> Self {
        Self {
            data: data.into(),
            presentation_time_us,
        }
    }
}

/// Result of one decoder pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// More output follows
    Samples(Vec<SampleBuffer>),
    /// Last batch; may be empty
    EndOfStream(Vec<SampleBuffer>),
}

/// Turns a source into PCM in the negotiated format.
#[async_trait]
pub trait AudioDecoder: Send {
    /// Wait for the next batch of output. Called until it returns
    /// [`DecodeStep::EndOfStream`] or an error.
    async fn next_step(&mut self) -> Result<DecodeStep>;
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, source: &AudioSource, format: AudioFormat) -> Result<Box<dyn AudioDecoder>>;
}

/// Stop request shared by a job and its decode task
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) was called, before or after this
    /// started waiting
    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Pull `decoder` until end of stream and feed the chunks to `scheduler`.
///
/// A stop ends the task at once, even in the middle of a pull, without
/// emitting anything further. A decoder error emits a single failed chunk.
pub(crate) fn spawn_decode(
    job_id: u64,
    mut decoder: Box<dyn AudioDecoder>,
    stop: Arc<StopSignal>,
    scheduler: SchedulerHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pulled = tokio::select! {
                _ = stop.wait() => {
                    debug!("Decoder for job {} stopped", job_id);
                    return;
                }
                pulled = tokio::time::timeout(DEQUEUE_TIMEOUT, decoder.next_step()) => pulled,
            };

            let step = match pulled {
                Err(_) => {
                    debug!("Decoder for job {} produced nothing, retrying", job_id);
                    continue;
                }
                Ok(Err(e)) => {
                    error!("Decoder for job {} failed: {}", job_id, e);
                    if !stop.is_stopped() {
                        scheduler.add(vec![SampleChunk::finished(FinishFlag::Failed)]);
                    }
                    return;
                }
                Ok(Ok(step)) => step,
            };

            if stop.is_stopped() {
                debug!("Decoder for job {} stopped", job_id);
                return;
            }

            match step {
                DecodeStep::Samples(buffers) => {
                    if !buffers.is_empty() {
                        scheduler.add(to_chunks(buffers, FinishFlag::NotFinished));
                    }
                }
                DecodeStep::EndOfStream(buffers) => {
                    let chunks = if buffers.is_empty() {
                        vec![SampleChunk::finished(FinishFlag::Success)]
                    } else {
                        to_chunks(buffers, FinishFlag::Success)
                    };
                    scheduler.add(chunks);
                    debug!("Decoder for job {} reached end of stream", job_id);
                    return;
                }
            }
        }
    })
}

/// Every chunk is `NotFinished` except the last, which carries `last`
fn to_chunks(buffers: Vec<SampleBuffer>, last: FinishFlag) -> Vec<SampleChunk> {
    let count = buffers.len();
    buffers
        .into_iter()
        .enumerate()
        .map(|(i, buffer)| {
            let flag = if i + 1 == count {
                last
            } else {
                FinishFlag::NotFinished
            };
            SampleChunk::new(buffer.data, buffer.presentation_time_us, flag)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    /// Never produces output
    struct Stalled {
        pulls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AudioDecoder for Stalled {
        async fn next_step(&mut self) -> Result<DecodeStep> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_a_stalled_pull() {
        let pulls = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(StopSignal::default());
        let task = spawn_decode(
            1,
            Box::new(Stalled {
                pulls: pulls.clone(),
            }),
            stop.clone(),
            SchedulerHandle::detached(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let begin = Instant::now();
        stop.stop();
        task.await.unwrap();

        assert!(Instant::now().duration_since(begin) < DEQUEUE_TIMEOUT);
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_wait_is_seen() {
        let stop = StopSignal::default();
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), stop.wait())
            .await
            .expect("wait missed an earlier stop");
    }

    #[test]
    fn test_to_chunks_marks_last() {
        let chunks = to_chunks(
            vec![
                SampleBuffer::new(vec![1u8], 0),
                SampleBuffer::new(vec![2u8], 10),
                SampleBuffer::new(vec![3u8], 20),
            ],
            FinishFlag::Success,
        );
        let flags: Vec<_> = chunks.iter().map(|c| c.finish).collect();
        assert_eq!(
            flags,
            vec![
                FinishFlag::NotFinished,
                FinishFlag::NotFinished,
                FinishFlag::Success
            ]
        );
        assert_eq!(chunks[2].presentation_time_us, 20);
    }
}
