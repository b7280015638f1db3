//! Raw PCM sources
//!
//! Files and buffers are taken to already be in the negotiated format and are
//! sliced into 100ms buffers.

use async_trait::async_trait;
use bytes::Bytes;
use carlink_audio::{
    AudioDecoder, AudioError, AudioFormat, AudioSource, DecodeStep, DecoderFactory, SampleBuffer,
};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

/// Buffers per second of audio
const BUFFERS_PER_SECOND: u64 = 10;

pub struct RawPcmFactory;

impl DecoderFactory for RawPcmFactory {
    fn create(
        &self,
        source: &AudioSource,
        format: AudioFormat,
    ) -> carlink_audio::Result<Box<dyn AudioDecoder>> {
        let input = match source {
            AudioSource::File(path) => Input::File {
                path: path.clone(),
                file: None,
            },
            AudioSource::Memory(data) => Input::Memory(data.clone()),
        };
        Ok(Box::new(RawPcmDecoder {
            input,
            byte_rate: format.byte_rate().max(1),
            position: 0,
        }))
    }
}

enum Input {
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
    Memory(Bytes),
}

struct RawPcmDecoder {
    input: Input,
    byte_rate: u64,
    /// Bytes handed out so far
    position: u64,
}

impl RawPcmDecoder {
    fn chunk_size(&self) -> usize {
        (self.byte_rate / BUFFERS_PER_SECOND).max(1) as usize
    }

    async fn read_chunk(&mut self) -> carlink_audio::Result<Bytes> {
        let size = self.chunk_size();
        match &mut self.input {
            Input::Memory(data) => {
                let take = size.min(data.len());
                Ok(data.split_to(take))
            }
            Input::File { path, file } => {
                if file.is_none() {
                    let opened = tokio::fs::File::open(&*path).await.map_err(|e| {
                        AudioError::Decoder(format!("{}: {}", path.display(), e))
                    })?;
                    *file = Some(opened);
                }
                let Some(file) = file.as_mut() else {
                    return Ok(Bytes::new());
                };
                let mut buf = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let n = file
                        .read(&mut buf[filled..])
                        .await
                        .map_err(|e| AudioError::Decoder(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(Bytes::from(buf))
            }
        }
    }
}

#[async_trait]
impl AudioDecoder for RawPcmDecoder {
    async fn next_step(&mut self) -> carlink_audio::Result<DecodeStep> {
        let chunk = self.read_chunk().await?;
        if chunk.is_empty() {
            return Ok(DecodeStep::EndOfStream(Vec::new()));
        }
        let pts = self.position * 1_000_000 / self.byte_rate;
        self.position += chunk.len() as u64;
        Ok(DecodeStep::Samples(vec![SampleBuffer::new(chunk, pts)]))
    }
}
