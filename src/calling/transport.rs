//! The connection-establishment capability a negotiation session drives.
//!
//! A transport applies local/remote descriptions and remote candidates and
//! reports gathered candidates and connectivity changes as `TransportEvent`s.
//! Sessions never repair a transport in place; a broken one is closed and a
//! fresh one is built from the `TransportFactory`.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{IceCandidateInit, SessionDescription};

/// Errors reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation not valid in the transport's current state.
    #[error("invalid transport state: {0}")]
    InvalidState(String),
    /// The session description could not be understood.
    #[error("malformed session description: {0}")]
    MalformedDescription(String),
    /// A single remote candidate could not be applied.
    #[error("bad ICE candidate: {0}")]
    Candidate(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is closed")]
    Closed,
}

/// Low-level ICE connection state, as a peer-connection API reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Local candidate gathering progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Notifications a transport pushes to its owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidateInit),
    GatheringComplete,
    Connection(IceConnectionState),
}

/// The local media source. Survives session resets; everything else is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub codec: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
}

impl LocalMedia {
    /// Opus mono/stereo audio, the usual browser default.
    pub fn opus(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            codec: "opus".into(),
            payload_type: 111,
            clock_rate: 48000,
            channels: 2,
        }
    }
}

/// Offer/answer and candidate capability of one peer connection.
///
/// `create_offer` and `create_answer` also apply the result as the local
/// description and start candidate gathering.
#[async_trait]
pub trait PeerTransport: Send {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the remote offer already applied.
    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(
        &mut self,
        candidate: &IceCandidateInit,
    ) -> Result<(), TransportError>;

    /// Current local description, including candidates gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&mut self);
}

/// Builds transports for a session, and rebuilds them on reset.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
