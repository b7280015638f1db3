//! Channel halves over tokio streams

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::traits::{ChannelPair, ChannelReader, ChannelWriter};

/// [`ChannelReader`] over any `AsyncRead`
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> ChannelReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

/// [`ChannelWriter`] over any `AsyncWrite`
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> ChannelWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a bidirectional stream into channel halves
pub fn split_stream<S>(stream: S) -> ChannelPair
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        Box::new(StreamReader::new(reader)),
        Box::new(StreamWriter::new(writer)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let (mut a_read, mut a_write) = split_stream(a);
        let (mut b_read, mut b_write) = split_stream(b);

        a_write.write(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        b_write.write(b"pong").await.unwrap();
        let n = a_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_close_gives_peer_eof() {
        let (a, b) = tokio::io::duplex(64);
        let (_a_read, mut a_write) = split_stream(a);
        let (mut b_read, _b_write) = split_stream(b);

        a_write.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b_read.read(&mut buf).await.unwrap(), 0);
    }
}
