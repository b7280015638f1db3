//! Handshake provider contract
//!
//! The TLS-style handshake itself lives outside this crate. A provider is
//! fed the peer's handshake bytes and writes its answer into a caller
//! supplied buffer.

use bytes::Bytes;

/// Size of the buffer handed to [`HandshakeProvider::run_handshake`]
pub const HANDSHAKE_BUFFER_SIZE: usize = 4096;

pub trait HandshakeProvider: Send + Sync {
    /// Begin a handshake. Returned bytes are sent to the peer.
    fn initialize(&self) -> Option<Bytes>;

    /// Consume peer bytes, write any reply into `output` and return its length
    fn run_handshake(&self, input: &[u8], output: &mut [u8]) -> usize;

    /// True once the handshake has finished successfully
    fn is_complete(&self) -> bool;

    /// Release provider resources
    fn shutdown(&self);
}
