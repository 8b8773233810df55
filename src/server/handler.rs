use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::quic::stream::{Stream, StreamListener};

/// Writes every received byte back on the same stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl StreamListener for EchoHandler {
    async fn on_data(&self, stream: &Stream, data: Bytes, fin: bool) {
        debug!("Echoing {} bytes on stream {} (fin: {})", data.len(), stream.id(), fin);
        if let Ok(text) = std::str::from_utf8(&data) {
            info!("Stream {}: {}", stream.id(), text);
        }
        if let Err(e) = stream.write(data, fin).await {
            warn!("Echo on stream {} failed: {}", stream.id(), e);
        }
    }

    async fn on_reset(&self, stream: &Stream, error_code: u64) {
        info!("Stream {} reset by peer ({}), resetting ours", stream.id(), error_code);
        if let Err(e) = stream.reset(error_code).await {
            warn!("Reset of stream {} failed: {}", stream.id(), e);
        }
    }
}
