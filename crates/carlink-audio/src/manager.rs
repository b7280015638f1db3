//! Audio stream manager
//!
//! Owns the PCM service lifecycle of one session and plays pushed sources
//! one after another. Each playing job has a decode task feeding a
//! scheduler task; finishing a job starts the next one in the queue.

use carlink_core::ServiceType;
use carlink_session::ServiceListener;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{AudioCapability, AudioFormat};
use crate::decoder::{spawn_decode, AudioDecoder, AudioSource, DecoderFactory, StopSignal};
use crate::delay::DelayStartHandler;
use crate::error::{AudioError, Result};
use crate::scheduler::{spawn_scheduler, PacingClock, SchedulerHandle};
use crate::session::StreamingSession;

/// How long a start or stop request may wait for the head unit's answer
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) const TIMEOUT_REASON: &str = "Service operation timeout reached";

/// Called once with the outcome of an operation
pub type Completion = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    None,
    /// Start requested, waiting for the head unit
    Ready,
    Started,
    /// Stop requested, waiting for the head unit
    Stopped,
    Error,
}

impl std::fmt::Display for StreamingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamingState::None => "NONE",
            StreamingState::Ready => "READY",
            StreamingState::Started => "STARTED",
            StreamingState::Stopped => "STOPPED",
            StreamingState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Advertised PCM capability; 16 kHz 16 bit when unknown
    pub capability: Option<AudioCapability>,
    pub completion_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capability: None,
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }
}

impl AudioConfig {
    pub fn with_capability(mut self, capability: AudioCapability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

/// A pushed source waiting for or being played
pub(crate) struct AudioJob {
    pub(crate) id: u64,
    pub(crate) interrupt: bool,
    decoder: Option<Box<dyn AudioDecoder>>,
    stop: Arc<StopSignal>,
    completion: Option<Completion>,
}

impl AudioJob {
    /// Stop decoding and report failure
    pub(crate) fn cancel(mut self) {
        self.stop.stop();
        if let Some(completion) = self.completion.take() {
            completion(false);
        }
    }
}

struct ActiveJob {
    job_id: u64,
    scheduler: SchedulerHandle,
}

struct Inner {
    this: Weak<Inner>,
    session: Arc<dyn StreamingSession>,
    factory: Arc<dyn DecoderFactory>,
    config: AudioConfig,
    state: Mutex<StreamingState>,
    format: Mutex<Option<AudioFormat>>,
    service_completion: Mutex<Option<Completion>>,
    completion_timer: Mutex<Option<JoinHandle<()>>>,
    /// Head is the playing job
    queue: Mutex<VecDeque<AudioJob>>,
    active: Mutex<Option<ActiveJob>>,
    delay: DelayStartHandler,
    clock: Arc<PacingClock>,
    next_job_id: AtomicU64,
    listener: Arc<dyn ServiceListener>,
}

/// Forwards PCM service events into the manager
struct PcmListener {
    inner: Weak<Inner>,
}

impl ServiceListener for PcmListener {
    fn on_service_started(&self, _session_id: u8, service: ServiceType, encrypted: bool) {
        if service != ServiceType::Pcm {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.on_service_started(encrypted);
        }
    }

    fn on_service_ended(&self, _session_id: u8, service: ServiceType) {
        if service != ServiceType::Pcm {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.on_service_ended();
        }
    }

    fn on_service_error(&self, _session_id: u8, service: ServiceType, reason: &str) {
        if service != ServiceType::Pcm {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.on_service_error(reason);
        }
    }
}

/// Streams pushed audio sources over the PCM service of one session
pub struct AudioStreamManager {
    inner: Arc<Inner>,
}

impl AudioStreamManager {
    /// Create a manager and register for the session's PCM events.
    pub fn new(
        session: Arc<dyn StreamingSession>,
        factory: Arc<dyn DecoderFactory>,
        config: AudioConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<Inner>| Inner {
            this: this.clone(),
            session,
            factory,
            config,
            state: Mutex::new(StreamingState::None),
            format: Mutex::new(None),
            service_completion: Mutex::new(None),
            completion_timer: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(None),
            delay: DelayStartHandler::default(),
            clock: Arc::new(PacingClock::default()),
            next_job_id: AtomicU64::new(1),
            listener: Arc::new(PcmListener {
                inner: this.clone(),
            }),
        });
        inner.session.add_service_listener(inner.listener.clone());
        Self { inner }
    }

    pub fn state(&self) -> StreamingState {
        *self.inner.state.lock()
    }

    /// Negotiated format, once a start was accepted
    pub fn format(&self) -> Option<AudioFormat> {
        *self.inner.format.lock()
    }

    /// Jobs playing or waiting to play
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Interrupting jobs waiting for sent audio to play out
    pub fn deferred_len(&self) -> usize {
        self.inner.delay.len()
    }

    /// Start the PCM service.
    ///
    /// `completion` gets `true` once the head unit acknowledges, `false` on
    /// rejection, on timeout, or right away when not connected, already
    /// streaming, or the capability cannot be streamed.
    pub async fn start_audio_stream(&self, encrypted: bool, completion: Completion) {
        let format = match self.inner.begin_start() {
            Ok(format) => format,
            Err(e) => {
                warn!("Cannot start audio stream: {}", e);
                completion(false);
                return;
            }
        };
        info!(
            "Starting audio stream: {} Hz {:?}",
            format.sample_rate, format.sample_type
        );

        *self.inner.service_completion.lock() = Some(completion);
        self.inner.arm_timeout();
        if let Err(e) = self.inner.session.start_audio_service(encrypted).await {
            warn!("PCM start request failed: {}", e);
        }
    }

    /// End the PCM service. Requires a started stream.
    pub async fn stop_audio_stream(&self, completion: Completion) {
        if let Err(e) = self.inner.begin_stop() {
            warn!("Cannot stop audio stream: {}", e);
            completion(false);
            return;
        }

        *self.inner.service_completion.lock() = Some(completion);
        self.inner.arm_timeout();
        if let Err(e) = self.inner.session.stop_audio_service().await {
            warn!("PCM stop request failed: {}", e);
        }
    }

    /// Queue `source` for playback. Ignored unless the stream is started.
    ///
    /// An interrupting source discards everything queued or playing, and
    /// waits until already sent audio has played out before it starts.
    pub fn push_audio_source(&self, source: AudioSource, completion: Completion, interrupt: bool) {
        let state = self.state();
        if state != StreamingState::Started {
            debug!("Audio source ignored in state {}", state);
            return;
        }
        let Some(format) = self.format() else {
            return;
        };

        let decoder = match self.inner.factory.create(&source, format) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("Cannot decode audio source: {}", e);
                completion(false);
                return;
            }
        };

        let job = AudioJob {
            id: self.inner.next_job_id.fetch_add(1, Ordering::SeqCst),
            interrupt,
            decoder: Some(decoder),
            stop: Arc::new(StopSignal::default()),
            completion: Some(completion),
        };
        debug!("Queueing job {} (interrupt: {})", job.id, interrupt);
        self.inner.admit(job);
    }

    /// Drop all jobs, stop the stream and unregister from the session once
    /// the stop completes.
    pub async fn shutdown(&self) {
        self.inner.flush_pipeline();

        let session = self.inner.session.clone();
        let listener = self.inner.listener.clone();
        self.stop_audio_stream(Box::new(move |_| {
            session.remove_service_listener(&listener);
        }))
        .await;
    }
}

impl std::fmt::Debug for AudioStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStreamManager")
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl Drop for AudioStreamManager {
    fn drop(&mut self) {
        self.inner.disarm_timeout();
        self.inner.flush_pipeline();
    }
}

impl Inner {
    fn state(&self) -> StreamingState {
        *self.state.lock()
    }

    fn begin_start(&self) -> Result<AudioFormat> {
        if !self.session.is_connected() {
            return Err(AudioError::NotConnected);
        }
        let format = self.config.capability.unwrap_or_default().format()?;

        let mut state = self.state.lock();
        if *state != StreamingState::None {
            return Err(AudioError::InvalidState(*state));
        }
        *state = StreamingState::Ready;
        *self.format.lock() = Some(format);
        Ok(format)
    }

    fn begin_stop(&self) -> Result<()> {
        if !self.session.is_connected() {
            return Err(AudioError::NotConnected);
        }
        let mut state = self.state.lock();
        if *state != StreamingState::Started {
            return Err(AudioError::InvalidState(*state));
        }
        *state = StreamingState::Stopped;
        Ok(())
    }

    fn arm_timeout(&self) {
        let weak = self.this.clone();
        let timeout = self.config.completion_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.completion_timer.lock().take();
                inner.on_service_error(TIMEOUT_REASON);
            }
        });
        if let Some(previous) = self.completion_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn disarm_timeout(&self) {
        if let Some(timer) = self.completion_timer.lock().take() {
            timer.abort();
        }
    }

    fn finish_service(&self, success: bool) {
        let completion = self.service_completion.lock().take();
        if let Some(completion) = completion {
            completion(success);
        }
    }

    fn on_service_started(&self, encrypted: bool) {
        self.disarm_timeout();
        *self.state.lock() = StreamingState::Started;
        info!("PCM service started (encrypted: {})", encrypted);
        self.finish_service(true);
    }

    fn on_service_ended(&self) {
        self.disarm_timeout();
        *self.state.lock() = StreamingState::None;
        info!("PCM service ended");
        self.flush_pipeline();
        self.finish_service(true);
    }

    fn on_service_error(&self, reason: &str) {
        self.disarm_timeout();
        warn!("PCM service error: {}", reason);
        *self.state.lock() = StreamingState::Error;
        self.flush_pipeline();
        *self.state.lock() = StreamingState::None;
        self.finish_service(false);
    }

    /// Route a new or deferred job into the queue
    fn admit(&self, job: AudioJob) {
        if self.state() != StreamingState::Started {
            self.flush_pipeline();
            job.cancel();
            return;
        }

        let job = if job.interrupt {
            let weak = self.this.clone();
            let admitted = self.delay.defer(job, self.clock.remaining(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_delay_elapsed();
                }
            });
            self.flush_jobs();
            match admitted {
                Some(job) => job,
                None => return,
            }
        } else {
            job
        };

        let idle = {
            let mut queue = self.queue.lock();
            queue.push_back(job);
            self.active.lock().is_none()
        };
        if idle {
            self.start_head();
        }
    }

    fn on_delay_elapsed(&self) {
        if let Some(job) = self.delay.take_ready() {
            debug!("Retrying deferred job {}", job.id);
            self.admit(job);
        }
    }

    /// Spawn the scheduler and decoder of the head job
    fn start_head(&self) {
        let (job_id, decoder, stop) = {
            let mut queue = self.queue.lock();
            let Some(head) = queue.front_mut() else {
                return;
            };
            let Some(decoder) = head.decoder.take() else {
                return;
            };
            (head.id, decoder, head.stop.clone())
        };

        let weak = self.this.clone();
        let (scheduler, _task) = spawn_scheduler(
            job_id,
            self.session.clone(),
            self.clock.clone(),
            Box::new(move |success| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_job_finished(job_id, success);
                }
            }),
        );
        *self.active.lock() = Some(ActiveJob {
            job_id,
            scheduler: scheduler.clone(),
        });
        spawn_decode(job_id, decoder, stop, scheduler);
        debug!("Job {} playing", job_id);
    }

    fn on_job_finished(&self, job_id: u64, success: bool) {
        let finished = {
            let mut queue = self.queue.lock();
            let finished = match queue.front() {
                Some(head) if head.id == job_id => queue.pop_front(),
                _ => None,
            };
            let mut active = self.active.lock();
            if active.as_ref().map_or(false, |a| a.job_id == job_id) {
                *active = None;
            }
            finished
        };
        let Some(mut job) = finished else {
            return;
        };

        if let Some(completion) = job.completion.take() {
            completion(success);
        }

        if self.queue.lock().is_empty() {
            return;
        }
        if self.state() != StreamingState::Started {
            self.flush_pipeline();
            return;
        }
        self.start_head();
    }

    /// Terminate the playing job and cancel everything queued behind it
    fn flush_jobs(&self) {
        let (active, jobs) = {
            let mut queue = self.queue.lock();
            let active = self.active.lock().take();
            (active, queue.drain(..).collect::<Vec<_>>())
        };
        if let Some(active) = active {
            active.scheduler.terminate();
        }
        for job in jobs {
            job.cancel();
        }
    }

    /// Drop every job and forget audio already sent
    fn flush_pipeline(&self) {
        self.delay.release();
        self.flush_jobs();
        self.clock.reset();
    }
}
