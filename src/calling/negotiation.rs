//! Per-peer offer/answer state machine with an early-candidate queue.
//!
//! Remote candidates are never handed to the transport before a remote
//! description is set; they wait in `pending_candidates` and are flushed in
//! arrival order right after the remote description is accepted.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use super::transport::{PeerTransport, TransportError};
use super::{IceCandidateInit, SessionDescription};
use crate::signaling::protocol::CallerCode;

/// Signaling state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot {op} in signaling state {state:?}")]
    StateViolation {
        op: &'static str,
        state: SignalingState,
    },
    #[error("{0} already in progress")]
    Duplicate(&'static str),
    #[error("offer attempted {0:?} after the previous one")]
    Debounced(Duration),
    #[error("session was reset while the operation was in flight")]
    Superseded,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("negotiation failed after reset: {0}")]
    Failed(#[source] Box<NegotiationError>),
}

impl NegotiationError {
    /// State or description-shape errors, recovered by reset-and-retry-once.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StateViolation { .. }
                | Self::Transport(TransportError::InvalidState(_))
                | Self::Transport(TransportError::MalformedDescription(_))
        )
    }

    /// Duplicates and operations on a torn-down session are silent no-ops.
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            Self::Duplicate(_) | Self::Debounced(_) | Self::Superseded | Self::Closed
        )
    }

    pub(crate) fn after_retry(self) -> Self {
        match self {
            e if e.is_ignorable() => e,
            e => Self::Failed(Box::new(e)),
        }
    }
}

/// Outcome of `add_ice_candidate`. Candidate failures never abort a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Queued,
    Applied,
    Rejected,
}

/// Outcome of `set_remote_answer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAnswerOutcome {
    Applied,
    /// Session was already stable; duplicate or late answer ignored.
    AlreadyStable,
}

/// Which local description an operation is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOp {
    Offer,
    Answer,
}

/// In-flight flags for one session, plus the offer debounce timestamp.
#[derive(Debug, Default)]
pub struct OperationGuard {
    pub is_creating_offer: bool,
    pub is_creating_answer: bool,
    pub is_setting_remote_answer: bool,
    last_offer_attempt: Option<Instant>,
}

impl OperationGuard {
    fn begin_offer(&mut self, now: Instant, debounce: Duration) -> Result<(), NegotiationError> {
        if self.is_creating_offer {
            return Err(NegotiationError::Duplicate("create offer"));
        }
        if self.is_creating_answer {
            return Err(NegotiationError::Duplicate("create answer"));
        }
        if let Some(last) = self.last_offer_attempt {
            let since = now.saturating_duration_since(last);
            if since < debounce {
                return Err(NegotiationError::Debounced(since));
            }
        }
        self.is_creating_offer = true;
        self.last_offer_attempt = Some(now);
        Ok(())
    }

    fn clear(&mut self, op: LocalOp) {
        match op {
            LocalOp::Offer => self.is_creating_offer = false,
            LocalOp::Answer => self.is_creating_answer = false,
        }
    }
}

/// Negotiation with one remote peer. Owned by a `ConnectionSupervisor`,
/// which replaces it wholesale on reset.
pub struct NegotiationSession {
    remote_code: CallerCode,
    generation: u64,
    state: SignalingState,
    pending_candidates: Vec<IceCandidateInit>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    guard: OperationGuard,
    transport: Box<dyn PeerTransport>,
}

impl NegotiationSession {
    pub fn new(remote_code: CallerCode, generation: u64, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            remote_code,
            generation,
            state: SignalingState::Stable,
            pending_candidates: Vec::new(),
            local_description: None,
            remote_description: None,
            guard: OperationGuard::default(),
            transport,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    /// True while a local offer or answer is still gathering.
    pub fn local_op_in_flight(&self) -> bool {
        self.guard.is_creating_offer || self.guard.is_creating_answer
    }

    pub fn pending_candidates(&self) -> &[IceCandidateInit] {
        &self.pending_candidates
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    /// Create and apply a local offer. Leaves `is_creating_offer` set until
    /// `complete_local(LocalOp::Offer)` once gathering has settled.
    pub async fn begin_offer(
        &mut self,
        ice_restart: bool,
        debounce: Duration,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.guard.begin_offer(Instant::now(), debounce)?;

        if self.state != SignalingState::Stable {
            self.guard.clear(LocalOp::Offer);
            return Err(NegotiationError::StateViolation {
                op: "create offer",
                state: self.state,
            });
        }

        match self.transport.create_offer(ice_restart).await {
            Ok(offer) => {
                self.local_description = Some(offer.clone());
                self.state = SignalingState::HaveLocalOffer;
                tracing::debug!(remote = %self.remote_code, ice_restart, "Local offer applied");
                Ok(offer)
            }
            Err(e) => {
                self.guard.clear(LocalOp::Offer);
                Err(e.into())
            }
        }
    }

    /// Apply a remote offer, flush queued candidates, and create the answer.
    /// Leaves `is_creating_answer` set until `complete_local(LocalOp::Answer)`.
    pub async fn begin_answer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.guard.is_creating_answer {
            return Err(NegotiationError::Duplicate("create answer"));
        }
        if self.state != SignalingState::Stable {
            return Err(NegotiationError::StateViolation {
                op: "create answer",
                state: self.state,
            });
        }
        if !offer.is_offer() {
            return Err(TransportError::MalformedDescription(
                "expected an offer to answer".into(),
            )
            .into());
        }

        self.guard.is_creating_answer = true;
        let result = self.answer_offer(offer).await;
        if result.is_err() {
            self.guard.clear(LocalOp::Answer);
        }
        result
    }

    async fn answer_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.transport.apply_remote_description(offer).await?;
        self.remote_description = Some(offer.clone());
        self.state = SignalingState::HaveRemoteOffer;
        self.flush_pending().await;

        let answer = self.transport.create_answer().await?;
        self.local_description = Some(answer.clone());
        self.state = SignalingState::Stable;
        tracing::debug!(remote = %self.remote_code, "Local answer applied");
        Ok(answer)
    }

    /// Finish a local offer/answer: clear its guard and return the local
    /// description with whatever candidates the transport gathered.
    pub fn complete_local(&mut self, op: LocalOp) -> Result<SessionDescription, NegotiationError> {
        self.guard.clear(op);
        self.ensure_open()?;
        let desc = self
            .transport
            .local_description()
            .or_else(|| self.local_description.clone())
            .ok_or(NegotiationError::StateViolation {
                op: "complete local description",
                state: self.state,
            })?;
        self.local_description = Some(desc.clone());
        Ok(desc)
    }

    /// Apply the peer's answer to our offer. An answer arriving on an
    /// already-stable session is a no-op.
    pub async fn set_remote_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<RemoteAnswerOutcome, NegotiationError> {
        self.ensure_open()?;
        if self.state == SignalingState::Stable {
            tracing::debug!(remote = %self.remote_code, "Answer on stable session ignored (already connected)");
            return Ok(RemoteAnswerOutcome::AlreadyStable);
        }
        if self.guard.is_setting_remote_answer {
            return Err(NegotiationError::Duplicate("set remote answer"));
        }
        if self.state != SignalingState::HaveLocalOffer {
            return Err(NegotiationError::StateViolation {
                op: "set remote answer",
                state: self.state,
            });
        }

        self.guard.is_setting_remote_answer = true;
        let applied = self.transport.apply_remote_description(answer).await;
        self.guard.is_setting_remote_answer = false;
        applied?;

        self.remote_description = Some(answer.clone());
        self.state = SignalingState::Stable;
        self.flush_pending().await;
        Ok(RemoteAnswerOutcome::Applied)
    }

    /// Queue the candidate until a remote description exists, else apply it.
    pub async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<CandidateOutcome, NegotiationError> {
        self.ensure_open()?;
        if self.remote_description.is_none() {
            self.pending_candidates.push(candidate);
            tracing::debug!(
                remote = %self.remote_code,
                queued = self.pending_candidates.len(),
                "Queued ICE candidate until remote description is set"
            );
            return Ok(CandidateOutcome::Queued);
        }

        match self.transport.add_remote_candidate(&candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(e) => {
                tracing::warn!(remote = %self.remote_code, "Ignoring ICE candidate: {}", e);
                Ok(CandidateOutcome::Rejected)
            }
        }
    }

    async fn flush_pending(&mut self) -> usize {
        let queued = std::mem::take(&mut self.pending_candidates);
        if queued.is_empty() {
            return 0;
        }
        let total = queued.len();
        let mut applied = 0;
        for candidate in queued {
            match self.transport.add_remote_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(remote = %self.remote_code, "Queued ICE candidate rejected: {}", e)
                }
            }
        }
        tracing::debug!(remote = %self.remote_code, "Flushed {}/{} queued ICE candidates", applied, total);
        applied
    }

    /// Discard the session and its transport.
    pub async fn close(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }
        self.state = SignalingState::Closed;
        self.pending_candidates.clear();
        self.transport.close().await;
    }
}
