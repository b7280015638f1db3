//! The session surface audio streaming needs

use async_trait::async_trait;
use bytes::Bytes;
use carlink_core::ServiceType;
use carlink_session::{ServiceListener, Session};
use std::sync::Arc;

/// PCM service control and data path of a session
#[async_trait]
pub trait StreamingSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn start_audio_service(&self, encrypted: bool) -> carlink_session::Result<()>;

    async fn stop_audio_service(&self) -> carlink_session::Result<()>;

    /// Send one PCM buffer. The timestamp only paces sending; it is not
    /// carried on the wire.
    async fn send_audio(&self, data: Bytes, presentation_time_us: u64) -> carlink_session::Result<()>;

    fn add_service_listener(&self, listener: Arc<dyn ServiceListener>);

    fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>);
}

#[async_trait]
impl StreamingSession for Session {
    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    async fn start_audio_service(&self, encrypted: bool) -> carlink_session::Result<()> {
        self.start_service(ServiceType::Pcm, encrypted).await
    }

    async fn stop_audio_service(&self) -> carlink_session::Result<()> {
        self.end_service(ServiceType::Pcm).await
    }

    async fn send_audio(&self, data: Bytes, _presentation_time_us: u64) -> carlink_session::Result<()> {
        self.send_data(ServiceType::Pcm, data).await
    }

    fn add_service_listener(&self, listener: Arc<dyn ServiceListener>) {
        Session::add_service_listener(self, ServiceType::Pcm, listener)
    }

    fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        Session::remove_service_listener(self, ServiceType::Pcm, listener)
    }
}
