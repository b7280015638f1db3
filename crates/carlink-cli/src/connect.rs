//! `connect` command: open a session and optionally play a raw PCM file

use anyhow::{bail, Result};
use carlink_audio::{AudioConfig, AudioSource, AudioStreamManager, Completion};
use carlink_core::{Packet, ServiceType};
use carlink_session::{create_session, ConnectionRegistry, SessionConfig, SessionListener};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::info;

use crate::pcm::RawPcmFactory;

/// How long to wait for the head unit to accept the session
const SESSION_START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectOptions {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub play: Option<PathBuf>,
    pub encrypted: bool,
}

/// Prints session events as they happen
#[derive(Default)]
struct ConsoleListener {
    rpc_started: Notify,
}

impl SessionListener for ConsoleListener {
    fn on_service_started(&self, session_id: u8, service: ServiceType, encrypted: bool) {
        let lock = if encrypted { " (encrypted)" } else { "" };
        println!(
            "{} {} service started on session {}{}",
            "OK".green().bold(),
            service.to_string().cyan(),
            session_id,
            lock
        );
        if service == ServiceType::Rpc {
            self.rpc_started.notify_one();
        }
    }

    fn on_service_ended(&self, session_id: u8, service: ServiceType) {
        println!(
            "{} {} service ended on session {}",
            "--".yellow(),
            service.to_string().cyan(),
            session_id
        );
    }

    fn on_service_nacked(&self, _session_id: u8, _service: ServiceType, reason: &str) {
        println!("{} {}", "NACK".red().bold(), reason);
    }

    fn on_message(&self, packet: &Packet) {
        println!(
            "{} {} {} bytes",
            "<-".dimmed(),
            packet.service_type().to_string().cyan(),
            packet.payload().len()
        );
    }

    fn on_heartbeat_timeout(&self, session_id: u8) {
        println!(
            "{} heartbeat timeout on session {}",
            "!!".red().bold(),
            session_id
        );
    }

    fn on_transport_disconnected(&self, reason: Option<&str>) {
        println!(
            "{} transport disconnected{}",
            "--".yellow(),
            reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
    }

    fn on_transport_error(&self, reason: &str) {
        println!("{} transport error: {}", "!!".red().bold(), reason);
    }
}

fn completion() -> (Completion, oneshot::Receiver<bool>) {
    let (tx, rx) = oneshot::channel();
    let completion: Completion = Box::new(move |success| {
        let _ = tx.send(success);
    });
    (completion, rx)
}

pub async fn run(options: ConnectOptions, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
    println!(
        "{} Connecting over {}",
        "carlink".cyan().bold(),
        options.session.transport.describe()
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let listener = Arc::new(ConsoleListener::default());
    let session = create_session(
        options.session.version,
        listener.clone(),
        options.session,
        registry,
    );
    session.start_session().await?;

    tokio::select! {
        _ = listener.rpc_started.notified() => {}
        _ = tokio::time::sleep(SESSION_START_TIMEOUT) => {
            session.close().await;
            bail!("Head unit did not accept the session");
        }
        _ = shutdown_rx.recv() => {
            session.close().await;
            return Ok(());
        }
    }
    info!(
        "Session {} started (hash 0x{:08x})",
        session.session_id(),
        session.hash_id()
    );

    if let Some(path) = options.play {
        let audio = AudioStreamManager::new(
            Arc::new(session.clone()),
            Arc::new(RawPcmFactory),
            options.audio,
        );
        let result = play(&audio, path, options.encrypted, shutdown_rx).await;
        audio.shutdown().await;
        session.close().await;
        return result;
    }

    println!("Press Ctrl+C to disconnect");
    shutdown_rx.recv().await;
    session.close().await;
    println!("{}", "Disconnected".yellow());
    Ok(())
}

async fn play(
    audio: &AudioStreamManager,
    path: PathBuf,
    encrypted: bool,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    let (started, started_rx) = completion();
    audio.start_audio_stream(encrypted, started).await;
    if !started_rx.await.unwrap_or(false) {
        bail!("PCM service did not start");
    }

    println!("{} Playing {}", "PCM".cyan().bold(), path.display());
    let (finished, finished_rx) = completion();
    audio.push_audio_source(AudioSource::File(path), finished, false);

    tokio::select! {
        played = finished_rx => {
            if played.unwrap_or(false) {
                println!("{} Playback finished", "OK".green().bold());
            } else {
                println!("{}", "Playback failed".red());
            }
        }
        _ = shutdown_rx.recv() => {
            println!("{}", "Playback interrupted".yellow());
        }
    }
    Ok(())
}
