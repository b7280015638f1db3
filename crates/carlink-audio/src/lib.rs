//! carlink Audio Streaming
//!
//! Plays queued audio sources over a session's PCM service:
//! - [`AudioStreamManager`]: PCM service lifecycle and the job queue
//! - Decoders are external; a [`DecoderFactory`] turns a source into an
//!   [`AudioDecoder`] that yields raw sample buffers
//! - Every buffer is paced by its presentation timestamp so the head unit
//!   never runs more than one second ahead of real time

pub mod capability;
pub mod decoder;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod session;

mod delay;

pub use capability::{AudioCapability, AudioFormat, SampleType};
pub use decoder::{AudioDecoder, AudioSource, DecodeStep, DecoderFactory, SampleBuffer};
pub use error::{AudioError, Result};
pub use manager::{AudioConfig, AudioStreamManager, Completion, StreamingState};
pub use scheduler::{FinishFlag, SampleChunk};
pub use session::StreamingSession;
