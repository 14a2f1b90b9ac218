//! ICE-only peer transport over a single UDP socket.
//!
//! Gathers a host candidate and, when a STUN server is configured, a
//! server-reflexive one. Once a remote description is applied, a checker
//! task sends STUN connectivity checks to every remote candidate until one
//! answers or the connectivity timeout expires. The offering side is the
//! controlling agent and nominates with USE-CANDIDATE.
//!
//! Media payload is not carried; the transport is "connected" once a
//! connectivity check succeeds.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::ice::{self, Candidate, CandidateKind, IceCredentials, IceRole, StunClass, StunMessage};
use super::sdp::{self, AudioSdp, Setup};
use super::transport::{
    IceConnectionState, LocalMedia, PeerTransport, TransportError, TransportEvent, TransportFactory,
};
use super::{IceCandidateInit, SdpType, SessionDescription};
use crate::config::NegotiationConfig;

/// Interval between connectivity check rounds.
const CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// How long to wait for one STUN server reply.
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds `UdpIceTransport`s from the negotiation config.
#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    bind_ip: Option<IpAddr>,
    stun_server: Option<String>,
    connectivity_timeout: Duration,
}

impl UdpTransportFactory {
    pub fn new(config: &NegotiationConfig) -> Self {
        Self {
            bind_ip: config.bind_ip,
            stun_server: config.stun_server.clone().filter(|s| !s.is_empty()),
            connectivity_timeout: Duration::from_millis(config.connectivity_timeout_ms),
        }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let bind_ip = self.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);

        let base_ip = if bind_ip.is_unspecified() {
            ice::outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            bind_ip
        };

        let shared = Arc::new(Mutex::new(IceShared::new()));
        let reader = tokio::spawn(read_loop(socket.clone(), shared.clone(), events.clone()));
        tracing::debug!("UDP transport bound on {:?} (base {})", socket.local_addr().ok(), base_ip);

        Ok(Box::new(UdpIceTransport {
            socket,
            shared,
            events,
            media: media.clone(),
            base_ip,
            stun_server: self.stun_server.clone(),
            connectivity_timeout: self.connectivity_timeout,
            session_id: chrono::Utc::now().timestamp_millis().unsigned_abs(),
            version: 0,
            local_kind: None,
            regather_on_answer: false,
            reader,
            gatherer: None,
            checker: None,
            closed: false,
        }))
    }
}

enum Pending {
    Srflx(oneshot::Sender<SocketAddr>),
    Check { addr: SocketAddr, round: u64 },
}

/// ICE agent state shared between the transport and its socket tasks.
struct IceShared {
    local: IceCredentials,
    remote: Option<IceCredentials>,
    controlling: bool,
    tie_breaker: u64,
    local_candidates: Vec<Candidate>,
    gathering_complete: bool,
    remote_candidates: Vec<SocketAddr>,
    pending: HashMap<[u8; 12], Pending>,
    selected: Option<SocketAddr>,
    state: IceConnectionState,
}

impl IceShared {
    fn new() -> Self {
        Self {
            local: IceCredentials::generate(),
            remote: None,
            controlling: false,
            tie_breaker: ice::tie_breaker(),
            local_candidates: Vec::new(),
            gathering_complete: false,
            remote_candidates: Vec::new(),
            pending: HashMap::new(),
            selected: None,
            state: IceConnectionState::New,
        }
    }

    fn set_state(&mut self, state: IceConnectionState, events: &mpsc::UnboundedSender<TransportEvent>) {
        if self.state != state {
            self.state = state;
            let _ = events.send(TransportEvent::Connection(state));
        }
    }

    /// Forget every check and the selected pair, keeping gathered candidates.
    fn restart_checks(&mut self) {
        self.pending.retain(|_, p| matches!(p, Pending::Srflx(_)));
        self.remote_candidates.clear();
        self.selected = None;
        self.state = IceConnectionState::New;
    }

    fn add_remote(&mut self, addr: SocketAddr) -> bool {
        if self.remote_candidates.contains(&addr) {
            return false;
        }
        self.remote_candidates.push(addr);
        true
    }

    /// Process one inbound STUN message; returns the reply to send, if any.
    fn handle(
        &mut self,
        msg: StunMessage,
        raw: &[u8],
        from: SocketAddr,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Option<Vec<u8>> {
        match msg.class {
            StunClass::Request => {
                let for_us = msg
                    .username
                    .as_deref()
                    .and_then(|u| u.split(':').next())
                    .is_some_and(|ufrag| ufrag == self.local.ufrag);
                if !for_us || !ice::verify_integrity(raw, self.local.pwd.as_bytes()) {
                    tracing::debug!("Rejecting unauthenticated STUN request from {}", from);
                    return Some(StunMessage::error(msg.transaction_id, 401).encode(None));
                }
                if self.remote.is_some() && self.add_remote(from) {
                    tracing::debug!("Learned peer-reflexive address {}", from);
                }
                if msg.use_candidate && !self.controlling {
                    tracing::debug!("Peer nominated {}", from);
                }
                let reply = StunMessage::success(msg.transaction_id, from);
                Some(reply.encode(Some(self.local.pwd.as_bytes())))
            }
            StunClass::Success => {
                match self.pending.remove(&msg.transaction_id) {
                    Some(Pending::Srflx(tx)) => {
                        if let Some(mapped) = msg.mapped_address {
                            let _ = tx.send(mapped);
                        }
                    }
                    Some(Pending::Check { addr, .. }) if addr == from => {
                        let authentic = self
                            .remote
                            .as_ref()
                            .is_some_and(|r| ice::verify_integrity(raw, r.pwd.as_bytes()));
                        if authentic && self.selected.is_none() {
                            tracing::info!("ICE connectivity check succeeded via {}", addr);
                            self.selected = Some(addr);
                            self.set_state(IceConnectionState::Connected, events);
                        }
                    }
                    _ => {}
                }
                None
            }
            StunClass::Error => {
                self.pending.remove(&msg.transaction_id);
                tracing::debug!("STUN error {:?} from {}", msg.error_code, from);
                None
            }
        }
    }

    /// Build one round of connectivity checks.
    fn build_checks(
        &mut self,
        round: u64,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let Some(remote) = self.remote.clone() else {
            return Vec::new();
        };
        if self.remote_candidates.is_empty() {
            return Vec::new();
        }
        self.set_state(IceConnectionState::Checking, events);
        self.pending.retain(|_, p| match p {
            Pending::Check { round: r, .. } => *r + 2 >= round,
            Pending::Srflx(_) => true,
        });

        let role = if self.controlling {
            IceRole::Controlling(self.tie_breaker)
        } else {
            IceRole::Controlled(self.tie_breaker)
        };
        let username = format!("{}:{}", remote.ufrag, self.local.ufrag);
        let prio = ice::priority(CandidateKind::PeerReflexive, 65535, 1);

        self.remote_candidates
            .clone()
            .into_iter()
            .map(|addr| {
                let msg = StunMessage::connectivity_check(username.clone(), prio, role);
                self.pending
                    .insert(msg.transaction_id, Pending::Check { addr, round });
                (addr, msg.encode(Some(remote.pwd.as_bytes())))
            })
            .collect()
    }
}

fn lock(shared: &Mutex<IceShared>) -> MutexGuard<'_, IceShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<IceShared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms.
                tracing::debug!("UDP recv error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let data = &buf[..len];
        let Ok(msg) = StunMessage::parse(data) else {
            continue;
        };
        let reply = lock(&shared).handle(msg, data, from, &events);
        if let Some(reply) = reply {
            if let Err(e) = socket.send_to(&reply, from).await {
                tracing::debug!("STUN reply to {} failed: {}", from, e);
            }
        }
    }
}

async fn check_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<IceShared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    let mut round = 0u64;
    loop {
        ticker.tick().await;
        round += 1;
        let checks = {
            let mut ice = lock(&shared);
            if matches!(
                ice.state,
                IceConnectionState::Connected | IceConnectionState::Completed | IceConnectionState::Closed
            ) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "ICE connectivity checks failed after {:?} ({} remote candidates)",
                    timeout,
                    ice.remote_candidates.len()
                );
                ice.set_state(IceConnectionState::Failed, &events);
                return;
            }
            ice.build_checks(round, &events)
        };
        for (addr, bytes) in checks {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                tracing::debug!("ICE check to {} failed to send: {}", addr, e);
            }
        }
    }
}

async fn gather(
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<IceShared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    base_ip: IpAddr,
    stun_server: Option<String>,
) {
    let emit = |candidate: &Candidate| {
        lock(&shared).local_candidates.push(candidate.clone());
        let _ = events.send(TransportEvent::LocalCandidate(IceCandidateInit::for_audio(
            candidate.to_string(),
        )));
    };

    match socket.local_addr() {
        Ok(bound) => {
            let host_addr = SocketAddr::new(base_ip, bound.port());
            emit(&Candidate::host(host_addr));

            if let Some(server) = stun_server {
                match query_stun(&socket, &shared, &server).await {
                    Some(mapped) if mapped != host_addr => {
                        emit(&Candidate::server_reflexive(mapped, host_addr))
                    }
                    Some(_) => tracing::debug!("STUN mapped address equals host address"),
                    None => tracing::debug!("No server-reflexive candidate from {}", server),
                }
            }
        }
        Err(e) => tracing::warn!("Cannot read local socket address: {}", e),
    }

    lock(&shared).gathering_complete = true;
    let _ = events.send(TransportEvent::GatheringComplete);
}

async fn query_stun(socket: &UdpSocket, shared: &Mutex<IceShared>, server: &str) -> Option<SocketAddr> {
    let server_addr = match tokio::time::timeout(STUN_TIMEOUT, tokio::net::lookup_host(server)).await {
        Ok(Ok(mut addrs)) => addrs.find(|a| a.is_ipv4())?,
        Ok(Err(e)) => {
            tracing::debug!("Failed to resolve STUN server {}: {}", server, e);
            return None;
        }
        Err(_) => {
            tracing::debug!("Resolving STUN server {} timed out", server);
            return None;
        }
    };

    for attempt in 1..=2 {
        let request = StunMessage::binding_request();
        let (tx, rx) = oneshot::channel();
        lock(shared)
            .pending
            .insert(request.transaction_id, Pending::Srflx(tx));
        if let Err(e) = socket.send_to(&request.encode(None), server_addr).await {
            tracing::debug!("STUN send to {} failed: {}", server_addr, e);
            return None;
        }
        match tokio::time::timeout(STUN_TIMEOUT, rx).await {
            Ok(Ok(mapped)) => return Some(mapped),
            _ => {
                lock(shared).pending.remove(&request.transaction_id);
                tracing::debug!("STUN attempt {} to {} timed out", attempt, server_addr);
            }
        }
    }
    None
}

pub struct UdpIceTransport {
    socket: Arc<UdpSocket>,
    shared: Arc<Mutex<IceShared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    media: LocalMedia,
    base_ip: IpAddr,
    stun_server: Option<String>,
    connectivity_timeout: Duration,
    session_id: u64,
    version: u64,
    local_kind: Option<SdpType>,
    /// Remote offer restarted ICE; our answer needs fresh credentials.
    regather_on_answer: bool,
    reader: JoinHandle<()>,
    gatherer: Option<JoinHandle<()>>,
    checker: Option<JoinHandle<()>>,
    closed: bool,
}

impl UdpIceTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn start_gathering(&mut self, fresh_credentials: bool) {
        {
            let mut ice = lock(&self.shared);
            if fresh_credentials {
                ice.local = IceCredentials::generate();
                ice.local_candidates.clear();
                ice.gathering_complete = false;
            } else if self.gatherer.is_some() {
                return;
            }
        }
        if let Some(old) = self.gatherer.take() {
            old.abort();
        }
        self.gatherer = Some(tokio::spawn(gather(
            self.socket.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.base_ip,
            self.stun_server.clone(),
        )));
    }

    fn start_checks(&mut self, force: bool) {
        let running = self.checker.as_ref().is_some_and(|h| !h.is_finished());
        if running && !force {
            return;
        }
        if let Some(old) = self.checker.take() {
            old.abort();
        }
        self.checker = Some(tokio::spawn(check_loop(
            self.socket.clone(),
            self.shared.clone(),
            self.events.clone(),
            self.connectivity_timeout,
        )));
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let ice = lock(&self.shared);
        let sdp = sdp::build_audio_sdp(&AudioSdp {
            session_id: self.session_id,
            version: self.version,
            address: self.base_ip,
            credentials: &ice.local,
            setup: match kind {
                SdpType::Offer => Setup::ActPass,
                SdpType::Answer => Setup::Active,
            },
            media: &self.media,
            candidates: &ice.local_candidates,
            complete: ice.gathering_complete,
        });
        SessionDescription { kind, sdp }
    }
}

#[async_trait]
impl PeerTransport for UdpIceTransport {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        {
            let mut ice = lock(&self.shared);
            ice.controlling = true;
            if ice_restart {
                ice.restart_checks();
            }
        }
        if ice_restart {
            if let Some(checker) = self.checker.take() {
                checker.abort();
            }
        }
        self.start_gathering(ice_restart);
        self.version += 1;
        self.local_kind = Some(SdpType::Offer);
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        {
            let mut ice = lock(&self.shared);
            if ice.remote.is_none() {
                return Err(TransportError::InvalidState("no remote offer to answer".into()));
            }
            ice.controlling = false;
        }
        let fresh = std::mem::take(&mut self.regather_on_answer);
        self.start_gathering(fresh);
        self.version += 1;
        self.local_kind = Some(SdpType::Answer);
        Ok(self.describe(SdpType::Answer))
    }

    async fn apply_remote_description(&mut self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        if desc.kind == SdpType::Answer && self.local_kind != Some(SdpType::Offer) {
            return Err(TransportError::InvalidState("answer without a local offer".into()));
        }
        let remote = sdp::parse_remote_sdp(&desc.sdp)?;

        let restarted = {
            let mut ice = lock(&self.shared);
            let restarted = ice
                .remote
                .as_ref()
                .is_some_and(|old| *old != remote.credentials);
            if restarted {
                tracing::debug!("Remote ICE credentials changed, restarting checks");
                ice.restart_checks();
            }
            ice.remote = Some(remote.credentials);
            for candidate in &remote.candidates {
                ice.add_remote(candidate.addr);
            }
            restarted
        };
        if restarted && desc.is_offer() {
            self.regather_on_answer = true;
        }
        self.start_checks(restarted);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        self.ensure_open()?;
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        let parsed: Candidate = candidate.candidate.parse()?;
        if parsed.component != 1 {
            return Ok(());
        }
        let state = {
            let mut ice = lock(&self.shared);
            if ice.remote.is_none() {
                return Err(TransportError::InvalidState(
                    "candidate before remote description".into(),
                ));
            }
            ice.add_remote(parsed.addr);
            ice.state
        };
        if matches!(state, IceConnectionState::New | IceConnectionState::Checking) {
            self.start_checks(false);
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local_kind.map(|kind| self.describe(kind))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.abort_tasks();
        lock(&self.shared).state = IceConnectionState::Closed;
    }
}

impl UdpIceTransport {
    fn abort_tasks(&mut self) {
        self.reader.abort();
        if let Some(gatherer) = self.gatherer.take() {
            gatherer.abort();
        }
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
    }
}

impl Drop for UdpIceTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
