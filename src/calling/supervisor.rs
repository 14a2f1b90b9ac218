//! Supervision of one negotiation session: gathering waits, reset-and-retry,
//! connectivity tracking and a one-shot ICE restart.
//!
//! The session sits behind an async mutex. Gathering waits happen with the
//! lock released so remote candidates keep flowing into the session while
//! the local description is still collecting candidates. Every reset bumps
//! `generation`; operations that started on an older generation resolve to
//! `NegotiationError::Superseded` instead of touching the new session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use super::negotiation::{
    CandidateOutcome, LocalOp, NegotiationError, NegotiationSession, RemoteAnswerOutcome,
    SignalingState,
};
use super::transport::{GatheringState, IceConnectionState, LocalMedia, TransportEvent, TransportFactory};
use super::{IceCandidateInit, SessionDescription};
use crate::config::NegotiationConfig;
use crate::signaling::protocol::CallerCode;

/// Identifies one supervised leg inside a `CallAgent`.
pub type LegId = u64;

/// Coarse connectivity derived from the transport's ICE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<IceConnectionState> for Connectivity {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New => Self::New,
            IceConnectionState::Checking => Self::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => Self::Connected,
            IceConnectionState::Disconnected => Self::Disconnected,
            IceConnectionState::Failed => Self::Failed,
            IceConnectionState::Closed => Self::Closed,
        }
    }
}

/// Things a supervisor reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Trickle this candidate to the remote peer.
    LocalCandidate(IceCandidateInit),
    Connectivity(Connectivity),
    /// ICE restart offer to send to the remote peer.
    RestartOffer(SessionDescription),
    /// Unrecoverable; the owner should end the call.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorNotice {
    pub leg: LegId,
    pub event: SupervisorEvent,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ice_gathering_timeout: Duration,
    pub offer_debounce: Duration,
    /// How long the answering side waits for the peer's ICE restart offer
    /// after a connectivity failure before giving up.
    pub restart_wait: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout: Duration::from_secs(15),
            offer_debounce: Duration::from_secs(1),
            restart_wait: Duration::from_secs(20),
        }
    }
}

impl From<&NegotiationConfig> for SupervisorConfig {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            ice_gathering_timeout: Duration::from_millis(config.ice_gathering_timeout_ms),
            offer_debounce: Duration::from_millis(config.offer_debounce_ms),
            restart_wait: Duration::from_millis(config.restart_wait_ms),
        }
    }
}

pub struct ConnectionSupervisor {
    leg: LegId,
    remote_code: CallerCode,
    media: LocalMedia,
    factory: Arc<dyn TransportFactory>,
    config: SupervisorConfig,
    session: Mutex<NegotiationSession>,
    generation: AtomicU64,
    gathering: StdMutex<watch::Sender<GatheringState>>,
    connectivity: watch::Sender<Connectivity>,
    is_offerer: AtomicBool,
    restart_attempted: AtomicBool,
    /// Answers produced so far; a restart offer from the peer bumps it.
    answers: AtomicU64,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<SupervisorNotice>,
}

impl ConnectionSupervisor {
    pub fn new(
        leg: LegId,
        remote_code: CallerCode,
        media: LocalMedia,
        factory: Arc<dyn TransportFactory>,
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<SupervisorNotice>,
    ) -> Result<Arc<Self>, NegotiationError> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&media, transport_tx)?;
        let (gathering, _) = watch::channel(GatheringState::New);
        let (connectivity, _) = watch::channel(Connectivity::New);

        let supervisor = Arc::new(Self {
            leg,
            session: Mutex::new(NegotiationSession::new(remote_code.clone(), 0, transport)),
            remote_code,
            media,
            factory,
            config,
            generation: AtomicU64::new(0),
            gathering: StdMutex::new(gathering),
            connectivity,
            is_offerer: AtomicBool::new(false),
            restart_attempted: AtomicBool::new(false),
            answers: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events,
        });
        supervisor.spawn_pump(0, transport_rx);
        Ok(supervisor)
    }

    pub fn leg(&self) -> LegId {
        self.leg
    }

    pub fn remote_code(&self) -> &str {
        &self.remote_code
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    pub fn current_connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub async fn signaling_state(&self) -> SignalingState {
        self.session.lock().await.state()
    }

    /// Create an offer and return it once gathering completes or times out.
    pub async fn create_offer(self: &Arc<Self>) -> Result<SessionDescription, NegotiationError> {
        self.is_offerer.store(true, Ordering::SeqCst);
        match self.offer_once(false).await {
            Err(e) if e.is_recoverable() => {
                tracing::warn!(remote = %self.remote_code, "Offer failed ({}), resetting session", e);
                self.reset().await?;
                let retried = self.offer_once(false).await.map_err(NegotiationError::after_retry);
                self.close_if_failed(retried).await
            }
            other => other,
        }
    }

    /// Answer a remote offer, resetting and retrying once on state or SDP errors.
    pub async fn create_answer(
        self: &Arc<Self>,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let result = match self.answer_once(offer).await {
            Err(e) if e.is_recoverable() => {
                tracing::warn!(remote = %self.remote_code, "Answer failed ({}), resetting session", e);
                self.reset().await?;
                let retried = self.answer_once(offer).await.map_err(NegotiationError::after_retry);
                self.close_if_failed(retried).await
            }
            other => other,
        };
        if result.is_ok() {
            self.answers.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    /// Apply the remote answer. A transport failure here resets the session
    /// and is reported as `Failed`; there is no offer left to retry with.
    pub async fn set_remote_answer(
        self: &Arc<Self>,
        answer: &SessionDescription,
    ) -> Result<RemoteAnswerOutcome, NegotiationError> {
        let result = self.session.lock().await.set_remote_answer(answer).await;
        match result {
            Err(NegotiationError::Transport(e)) => {
                tracing::warn!(remote = %self.remote_code, "Remote answer rejected: {}", e);
                self.reset().await?;
                Err(NegotiationError::Failed(Box::new(e.into())))
            }
            other => other,
        }
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: IceCandidateInit,
    ) -> Result<CandidateOutcome, NegotiationError> {
        self.session.lock().await.add_ice_candidate(candidate).await
    }

    /// Offer with fresh ICE credentials on the current session.
    pub async fn restart_ice(self: &Arc<Self>) -> Result<SessionDescription, NegotiationError> {
        self.offer_once(true).await
    }

    /// Discard the session and transport and start over from `Stable`,
    /// keeping only the local media source.
    pub async fn reset(self: &Arc<Self>) -> Result<(), NegotiationError> {
        let mut session = self.session.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(&self.media, transport_tx)?;
        let generation = {
            let mut gathering = self.gathering_sender();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            // Dropping the old sender releases anyone waiting on its gathering.
            *gathering = watch::channel(GatheringState::New).0;
            generation
        };

        let mut old = std::mem::replace(
            &mut *session,
            NegotiationSession::new(self.remote_code.clone(), generation, transport),
        );
        old.close().await;
        drop(session);

        self.restart_attempted.store(false, Ordering::SeqCst);
        self.connectivity.send_replace(Connectivity::New);
        self.spawn_pump(generation, transport_rx);
        tracing::warn!(remote = %self.remote_code, generation, "Negotiation session reset");
        Ok(())
    }

    /// Tear down for good. In-flight operations resolve as no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut gathering = self.gathering_sender();
            self.generation.fetch_add(1, Ordering::SeqCst);
            *gathering = watch::channel(GatheringState::New).0;
        }
        self.session.lock().await.close().await;
        self.connectivity.send_replace(Connectivity::Closed);
        tracing::debug!(remote = %self.remote_code, "Supervisor closed");
    }

    /// A failed retry is final: the transport is released right away.
    async fn close_if_failed(
        &self,
        result: Result<SessionDescription, NegotiationError>,
    ) -> Result<SessionDescription, NegotiationError> {
        if let Err(NegotiationError::Failed(e)) = &result {
            tracing::warn!(remote = %self.remote_code, "Negotiation failed after reset: {}", e);
            self.close().await;
        }
        result
    }

    async fn offer_once(
        self: &Arc<Self>,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let generation = {
            let mut session = self.session.lock().await;
            if !session.local_op_in_flight() {
                self.gathering_sender().send_replace(GatheringState::New);
            }
            // A restart answers a failure, not a user action: never debounced.
            let debounce = if ice_restart {
                Duration::ZERO
            } else {
                self.config.offer_debounce
            };
            session.begin_offer(ice_restart, debounce).await?;
            session.generation()
        };
        self.wait_for_gathering().await;
        self.complete(generation, LocalOp::Offer).await
    }

    async fn answer_once(
        self: &Arc<Self>,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let generation = {
            let mut session = self.session.lock().await;
            if !session.local_op_in_flight() {
                self.gathering_sender().send_replace(GatheringState::New);
            }
            session.begin_answer(offer).await?;
            session.generation()
        };
        self.wait_for_gathering().await;
        self.complete(generation, LocalOp::Answer).await
    }

    async fn complete(
        &self,
        generation: u64,
        op: LocalOp,
    ) -> Result<SessionDescription, NegotiationError> {
        let mut session = self.session.lock().await;
        if session.generation() != generation || self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Superseded);
        }
        session.complete_local(op)
    }

    /// Wait for gathering to complete, bounded by the configured timeout.
    /// A timeout is not an error; whatever was gathered gets sent.
    async fn wait_for_gathering(&self) {
        let mut rx = self.gathering_sender().subscribe();
        let wait = async {
            rx.wait_for(|state| *state == GatheringState::Complete)
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(self.config.ice_gathering_timeout, wait).await {
            Ok(Ok(())) => tracing::debug!(remote = %self.remote_code, "ICE gathering complete"),
            Ok(Err(_)) => tracing::debug!(remote = %self.remote_code, "Gathering wait ended by reset"),
            Err(_) => tracing::warn!(
                remote = %self.remote_code,
                "ICE gathering timed out after {:?}, using candidates gathered so far",
                self.config.ice_gathering_timeout
            ),
        }
    }

    fn gathering_sender(&self) -> MutexGuard<'_, watch::Sender<GatheringState>> {
        self.gathering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: SupervisorEvent) {
        let _ = self.events.send(SupervisorNotice {
            leg: self.leg,
            event,
        });
    }

    /// Forward transport events of one generation until it is superseded.
    fn spawn_pump(self: &Arc<Self>, generation: u64, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                if this.generation() != generation {
                    break;
                }
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        this.gathering_sender().send_if_modified(|state| {
                            let started = *state == GatheringState::New;
                            if started {
                                *state = GatheringState::Gathering;
                            }
                            started
                        });
                        this.notify(SupervisorEvent::LocalCandidate(candidate));
                    }
                    TransportEvent::GatheringComplete => {
                        let gathering = this.gathering_sender();
                        if this.generation() == generation {
                            gathering.send_replace(GatheringState::Complete);
                        }
                    }
                    TransportEvent::Connection(state) => this.on_connection_state(state),
                }
            }
        });
    }

    fn on_connection_state(self: &Arc<Self>, state: IceConnectionState) {
        let coarse = Connectivity::from(state);
        let changed = self.connectivity.send_if_modified(|current| {
            let changed = *current != coarse;
            *current = coarse;
            changed
        });
        if !changed {
            return;
        }
        tracing::info!(remote = %self.remote_code, ?coarse, "Connectivity changed");
        self.notify(SupervisorEvent::Connectivity(coarse));
        if coarse == Connectivity::Failed {
            self.on_failed();
        }
    }

    /// The offering side restarts ICE once; the answering side waits for
    /// the peer's restart offer. A second failure, a failed restart or a
    /// restart that never arrives is surfaced.
    fn on_failed(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.restart_attempted.swap(true, Ordering::SeqCst) {
            tracing::warn!(remote = %self.remote_code, "ICE failed again after restart");
            self.notify(SupervisorEvent::Failed("ICE connectivity failed".into()));
            return;
        }
        if !self.is_offerer.load(Ordering::SeqCst) {
            tracing::info!(
                remote = %self.remote_code,
                "ICE failed, waiting {:?} for peer to restart",
                self.config.restart_wait
            );
            self.spawn_restart_watch();
            return;
        }

        tracing::warn!(remote = %self.remote_code, "ICE failed, attempting restart");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.restart_ice().await {
                Ok(offer) => this.notify(SupervisorEvent::RestartOffer(offer)),
                Err(e @ (NegotiationError::Superseded | NegotiationError::Closed)) => {
                    tracing::debug!(remote = %this.remote_code, "ICE restart abandoned: {}", e)
                }
                Err(e) => {
                    tracing::warn!(remote = %this.remote_code, "ICE restart failed: {}", e);
                    this.notify(SupervisorEvent::Failed(e.to_string()));
                }
            }
        });
    }

    /// Surface the failure unless a restart offer is answered in time.
    fn spawn_restart_watch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let generation = self.generation();
        let answers = self.answers.load(Ordering::SeqCst);
        let wait = self.config.restart_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(this) = weak.upgrade() else { return };
            if this.closed.load(Ordering::SeqCst)
                || this.generation() != generation
                || this.answers.load(Ordering::SeqCst) != answers
            {
                return;
            }
            tracing::warn!(remote = %this.remote_code, "Peer never restarted ICE");
            this.notify(SupervisorEvent::Failed("ICE restart never arrived".into()));
        });
    }
}
