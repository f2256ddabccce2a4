//! Transport abstraction for the live chat session
//!
//! A [`Transport`] opens one full-duplex connection and hands back its two
//! halves. Reads stay with the supervisor; writes go through the
//! [`OutboundSender`], which serializes every writer behind a single send
//! mutex so two envelopes can never interleave on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::errors::TransportError;

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Opens connections to the chat endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `endpoint` with the given upgrade headers
    async fn open(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Connection, TransportError>;
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame; `None` once the connection is closed
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// An open connection split into its halves
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Connection {
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

// ----------------------------------------------------------------------------
// Serialized Outbound Sender
// ----------------------------------------------------------------------------

/// Shared write path for all logical tasks of a session.
///
/// The sink slot is replaced on every reconnect. Serialization and the socket
/// write happen while holding the same lock, so concurrent writers are fully
/// ordered.
#[derive(Clone, Default)]
pub struct OutboundSender {
    sink: Arc<Mutex<Option<Box<dyn FrameSink>>>>,
    frames_sent: Arc<AtomicU64>,
}

impl OutboundSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the write half of a freshly opened connection
    pub async fn attach(&self, sink: Box<dyn FrameSink>) {
        let previous = self.sink.lock().await.replace(sink);
        if previous.is_some() {
            warn!("Replaced an outbound sink that was never closed");
        }
    }

    /// Serialize and write one envelope
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut slot = self.sink.lock().await;
        let sink = slot.as_mut().ok_or(TransportError::NotConnected)?;
        let frame = envelope.to_json().map_err(|e| TransportError::SendFailed {
            reason: e.to_string(),
        })?;
        sink.send(frame).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close and drop the current sink. A no-op when detached.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("Error while closing connection: {}", e);
            }
        }
    }

    /// Whether a sink is currently attached
    pub async fn is_attached(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Total frames written over the lifetime of this sender
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
