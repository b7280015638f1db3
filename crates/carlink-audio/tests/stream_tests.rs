//! Audio Stream Manager Tests
//!
//! - PCM service start/stop, rejection and timeout
//! - Paced playback and sequential jobs
//! - Interrupting sources and their deferred start
//! - Decoder failures and cleanup

use async_trait::async_trait;
use bytes::Bytes;
use carlink_audio::{
    AudioCapability, AudioConfig, AudioDecoder, AudioError, AudioFormat, AudioSource,
    AudioStreamManager, Completion, DecodeStep, DecoderFactory, SampleBuffer, StreamingSession,
    StreamingState,
};
use carlink_core::ServiceType;
use carlink_session::ServiceListener;
use carlink_test_utils::{wait_for, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeSession {
    connected: AtomicBool,
    /// Never answer start or stop requests
    silent: AtomicBool,
    reject: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ServiceListener>>>,
    sent: Mutex<Vec<(Instant, u8, u64)>>,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl FakeSession {
    fn connected() -> Arc<Self> {
        let session = Arc::new(Self::default());
        session.connected.store(true, Ordering::SeqCst);
        session
    }

    fn listeners(&self) -> Vec<Arc<dyn ServiceListener>> {
        self.listeners.lock().clone()
    }

    fn end_from_peer(&self) {
        for listener in self.listeners() {
            listener.on_service_ended(1, ServiceType::Pcm);
        }
    }

    /// (tag, pts) of every buffer sent
    fn sent(&self) -> Vec<(u8, u64)> {
        self.sent.lock().iter().map(|(_, tag, pts)| (*tag, *pts)).collect()
    }

    fn first_send_of(&self, tag: u8) -> Option<Instant> {
        self.sent
            .lock()
            .iter()
            .find(|(_, t, _)| *t == tag)
            .map(|(at, _, _)| *at)
    }

    fn answer(&self, started: bool, encrypted: bool) {
        if self.silent.load(Ordering::SeqCst) {
            return;
        }
        let listeners = self.listeners();
        let reject = self.reject.load(Ordering::SeqCst);
        tokio::spawn(async move {
            for listener in listeners {
                if reject {
                    listener.on_service_error(1, ServiceType::Pcm, "Start PCM Service NACK'ed");
                } else if started {
                    listener.on_service_started(1, ServiceType::Pcm, encrypted);
                } else {
                    listener.on_service_ended(1, ServiceType::Pcm);
                }
            }
        });
    }
}

#[async_trait]
impl StreamingSession for FakeSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_audio_service(&self, encrypted: bool) -> carlink_session::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.answer(true, encrypted);
        Ok(())
    }

    async fn stop_audio_service(&self) -> carlink_session::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.answer(false, false);
        Ok(())
    }

    async fn send_audio(&self, data: Bytes, presentation_time_us: u64) -> carlink_session::Result<()> {
        let tag = data.first().copied().unwrap_or(0);
        self.sent
            .lock()
            .push((Instant::now(), tag, presentation_time_us));
        Ok(())
    }

    fn add_service_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }
}

type Script = Vec<carlink_audio::Result<DecodeStep>>;

struct ScriptedDecoder {
    steps: VecDeque<carlink_audio::Result<DecodeStep>>,
    stall_first: bool,
}

#[async_trait]
impl AudioDecoder for ScriptedDecoder {
    async fn next_step(&mut self) -> carlink_audio::Result<DecodeStep> {
        if self.stall_first {
            self.stall_first = false;
            std::future::pending::<()>().await;
        }
        match self.steps.pop_front() {
            Some(step) => step,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct ScriptedFactory {
    scripts: Mutex<VecDeque<Script>>,
    stall_first: AtomicBool,
    created: AtomicU32,
}

impl ScriptedFactory {
    fn with(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }
}

impl DecoderFactory for ScriptedFactory {
    fn create(
        &self,
        source: &AudioSource,
        _format: AudioFormat,
    ) -> carlink_audio::Result<Box<dyn AudioDecoder>> {
        if matches!(source, AudioSource::File(_)) {
            return Err(AudioError::Decoder("no such file".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let steps = self.scripts.lock().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedDecoder {
            steps: steps.into(),
            stall_first: self.stall_first.load(Ordering::SeqCst),
        }))
    }
}

/// `chunks` buffers tagged `tag`, 500ms apart, then end of stream
fn tone(tag: u8, chunks: u64) -> Script {
    let mut steps: Script = (0..chunks)
        .map(|i| {
            Ok(DecodeStep::Samples(vec![SampleBuffer::new(
                vec![tag; 8],
                i * 500_000,
            )]))
        })
        .collect();
    steps.push(Ok(DecodeStep::EndOfStream(Vec::new())));
    steps
}

fn source() -> AudioSource {
    AudioSource::Memory(Bytes::from_static(b"pcm"))
}

fn recorder() -> (Completion, Arc<Mutex<Option<bool>>>) {
    let slot = Arc::new(Mutex::new(None));
    let recorded = slot.clone();
    let completion: Completion = Box::new(move |success| {
        *recorded.lock() = Some(success);
    });
    (completion, slot)
}

async fn outcome(slot: &Arc<Mutex<Option<bool>>>) -> Option<bool> {
    wait_for(
        || {
            let done = slot.lock().is_some();
            async move { done }
        },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await;
    *slot.lock()
}

async fn started(session: &Arc<FakeSession>, factory: &Arc<ScriptedFactory>) -> AudioStreamManager {
    let manager = AudioStreamManager::new(session.clone(), factory.clone(), AudioConfig::default());
    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;
    assert_eq!(outcome(&result).await, Some(true));
    manager
}

// ============================================================================
// Service lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_requires_connection() {
    let session = Arc::new(FakeSession::default());
    let manager = AudioStreamManager::new(
        session.clone(),
        ScriptedFactory::with(vec![]),
        AudioConfig::default(),
    );

    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;

    assert_eq!(*result.lock(), Some(false));
    assert_eq!(manager.state(), StreamingState::None);
    assert_eq!(session.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_then_stop() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![]);
    let manager = started(&session, &factory).await;

    assert_eq!(manager.state(), StreamingState::Started);
    let format = manager.format().unwrap();
    assert_eq!(format.sample_rate, 16_000);

    let (done, result) = recorder();
    manager.stop_audio_stream(done).await;
    assert_eq!(manager.state(), StreamingState::Stopped);
    assert_eq!(outcome(&result).await, Some(true));
    assert_eq!(manager.state(), StreamingState::None);
    assert_eq!(session.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_streaming_fails() {
    let session = FakeSession::connected();
    let manager = started(&session, &ScriptedFactory::with(vec![])).await;

    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(manager.state(), StreamingState::Started);
    assert_eq!(session.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_requires_started_stream() {
    let session = FakeSession::connected();
    let manager = AudioStreamManager::new(
        session.clone(),
        ScriptedFactory::with(vec![]),
        AudioConfig::default(),
    );

    let (done, result) = recorder();
    manager.stop_audio_stream(done).await;
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(session.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_capability_fails() {
    let session = FakeSession::connected();
    let manager = AudioStreamManager::new(
        session.clone(),
        ScriptedFactory::with(vec![]),
        AudioConfig::default().with_capability(AudioCapability::new(48_000, 16)),
    );

    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(manager.state(), StreamingState::None);
    assert_eq!(session.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_start_times_out() {
    let session = FakeSession::connected();
    session.silent.store(true, Ordering::SeqCst);
    let manager = AudioStreamManager::new(
        session.clone(),
        ScriptedFactory::with(vec![]),
        AudioConfig::default(),
    );

    let (done, result) = recorder();
    manager.start_audio_stream(true, done).await;
    assert_eq!(manager.state(), StreamingState::Ready);

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(*result.lock(), None);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(manager.state(), StreamingState::None);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_start_reports_failure() {
    let session = FakeSession::connected();
    session.reject.store(true, Ordering::SeqCst);
    let manager = AudioStreamManager::new(
        session.clone(),
        ScriptedFactory::with(vec![]),
        AudioConfig::default(),
    );

    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;
    assert_eq!(outcome(&result).await, Some(false));
    assert_eq!(manager.state(), StreamingState::None);

    // A late timeout must not fire a second time
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.state(), StreamingState::None);
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_push_ignored_until_started() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 2)]);
    let manager = AudioStreamManager::new(session.clone(), factory.clone(), AudioConfig::default());

    let (done, result) = recorder();
    manager.push_audio_source(source(), done, false);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    assert_eq!(manager.queue_len(), 0);
    assert_eq!(*result.lock(), None);
}

#[tokio::test(start_paused = true)]
async fn test_source_is_paced_and_completes() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 6)]);
    let manager = started(&session, &factory).await;
    let begin = Instant::now();

    let (done, result) = recorder();
    manager.push_audio_source(source(), done, false);
    assert_eq!(manager.queue_len(), 1);

    assert_eq!(outcome(&result).await, Some(true));
    // Last buffer at 2.5s must have played out
    assert!(Instant::now().duration_since(begin) >= Duration::from_millis(2500));

    let sent = session.sent();
    let pts: Vec<u64> = sent.iter().map(|(_, pts)| *pts).collect();
    assert_eq!(pts, vec![0, 500_000, 1_000_000, 1_500_000, 2_000_000, 2_500_000]);

    let records = session.sent.lock().clone();
    for (at, _, pts) in records {
        let elapsed = at.duration_since(begin).as_micros();
        assert!(elapsed + 1_000_000 > pts as u128, "pts {} sent too early", pts);
    }
    assert_eq!(manager.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sources_play_in_push_order() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 3), tone(2, 3)]);
    let manager = started(&session, &factory).await;

    let (first_done, first) = recorder();
    let (second_done, second) = recorder();
    manager.push_audio_source(source(), first_done, false);
    manager.push_audio_source(source(), second_done, false);
    assert_eq!(manager.queue_len(), 2);

    assert_eq!(outcome(&first).await, Some(true));
    assert_eq!(*second.lock(), None);
    assert_eq!(outcome(&second).await, Some(true));

    let tags: Vec<u8> = session.sent().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![1, 1, 1, 2, 2, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_without_pending_audio_starts_at_once() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(7, 2)]);
    let manager = started(&session, &factory).await;

    let (done, result) = recorder();
    manager.push_audio_source(source(), done, true);
    assert_eq!(manager.deferred_len(), 0);
    assert_eq!(manager.queue_len(), 1);
    assert_eq!(outcome(&result).await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_flushes_and_waits_for_playout() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 10), tone(2, 2), tone(3, 2)]);
    let manager = started(&session, &factory).await;
    let begin = Instant::now();

    let (a_done, a) = recorder();
    let (b_done, b) = recorder();
    manager.push_audio_source(source(), a_done, false);
    manager.push_audio_source(source(), b_done, false);

    // pts 0 and 500ms of A are out, so sent audio lasts until 500ms
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (c_done, c) = recorder();
    manager.push_audio_source(source(), c_done, true);

    assert_eq!(*a.lock(), Some(false));
    assert_eq!(*b.lock(), Some(false));
    assert_eq!(manager.deferred_len(), 1);
    assert_eq!(manager.queue_len(), 0);

    assert_eq!(outcome(&c).await, Some(true));
    let c_start = session.first_send_of(3).unwrap();
    assert!(c_start.duration_since(begin) >= Duration::from_millis(500));
    assert!(session.first_send_of(2).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_newer_interrupt_supersedes_deferred_one() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 10), tone(2, 2), tone(3, 2)]);
    let manager = started(&session, &factory).await;

    let (a_done, _a) = recorder();
    manager.push_audio_source(source(), a_done, false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (b_done, b) = recorder();
    manager.push_audio_source(source(), b_done, true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (c_done, c) = recorder();
    manager.push_audio_source(source(), c_done, true);
    assert_eq!(*b.lock(), Some(false));
    assert_eq!(manager.deferred_len(), 1);

    assert_eq!(outcome(&c).await, Some(true));
    assert!(session.first_send_of(2).is_none());
    assert!(session.first_send_of(3).is_some());
}

// ============================================================================
// Failures and cleanup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_decoder_failure_moves_to_next_job() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![
        vec![Err(AudioError::Decoder("corrupt frame".into()))],
        tone(2, 2),
    ]);
    let manager = started(&session, &factory).await;

    let (a_done, a) = recorder();
    let (b_done, b) = recorder();
    manager.push_audio_source(source(), a_done, false);
    manager.push_audio_source(source(), b_done, false);

    assert_eq!(outcome(&a).await, Some(false));
    assert_eq!(outcome(&b).await, Some(true));
    assert_eq!(session.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_source_fails_immediately() {
    let session = FakeSession::connected();
    let manager = started(&session, &ScriptedFactory::with(vec![])).await;

    let (done, result) = recorder();
    manager.push_audio_source(AudioSource::File("/missing.mp3".into()), done, false);
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(manager.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_decoder_is_retried() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 1)]);
    factory.stall_first.store(true, Ordering::SeqCst);
    let manager = started(&session, &factory).await;
    let begin = Instant::now();

    let (done, result) = recorder();
    manager.push_audio_source(source(), done, false);

    assert_eq!(outcome(&result).await, Some(true));
    let first = session.first_send_of(1).unwrap();
    assert!(first.duration_since(begin) >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_service_end_cancels_jobs() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 10), tone(2, 2)]);
    let manager = started(&session, &factory).await;

    let (a_done, a) = recorder();
    let (b_done, b) = recorder();
    manager.push_audio_source(source(), a_done, false);
    manager.push_audio_source(source(), b_done, false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.end_from_peer();

    assert_eq!(*a.lock(), Some(false));
    assert_eq!(*b.lock(), Some(false));
    assert_eq!(manager.state(), StreamingState::None);
    assert_eq!(manager.queue_len(), 0);

    let sent = session.sent().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(session.sent().len(), sent);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_stream_forgets_previous_playout() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 10), tone(2, 2)]);
    let manager = started(&session, &factory).await;

    // pts 0 and 500ms go out at once
    let (a_done, _a) = recorder();
    manager.push_audio_source(source(), a_done, false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.sent().len(), 2);

    session.end_from_peer();
    assert_eq!(manager.state(), StreamingState::None);

    let (done, result) = recorder();
    manager.start_audio_stream(false, done).await;
    assert_eq!(outcome(&result).await, Some(true));

    // Nothing of the new stream is playing, so the interrupt starts at once
    let (b_done, b) = recorder();
    manager.push_audio_source(source(), b_done, true);
    assert_eq!(manager.deferred_len(), 0);
    assert_eq!(manager.queue_len(), 1);
    assert_eq!(outcome(&b).await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_stream_and_unregisters() {
    let session = FakeSession::connected();
    let factory = ScriptedFactory::with(vec![tone(1, 10)]);
    let manager = started(&session, &factory).await;
    assert_eq!(session.listeners().len(), 1);

    let (done, result) = recorder();
    manager.push_audio_source(source(), done, false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.shutdown().await;
    assert_eq!(*result.lock(), Some(false));
    assert_eq!(session.stops.load(Ordering::SeqCst), 1);

    let unregistered = wait_for(
        || {
            let empty = session.listeners().is_empty();
            async move { empty }
        },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await;
    assert!(unregistered);
    assert_eq!(manager.state(), StreamingState::None);
}
