//! Signaling coordinator: routes call setup messages between endpoints.
//!
//! One task owns the `IdentityRegistry` and `CallLedger` and applies every
//! input in order, so registration, call setup and disconnect cleanup never
//! race each other. Socket tasks talk to it through a `CoordinatorHandle`.
//! The coordinator only relays and keeps books; it never waits on
//! negotiation, which lives entirely on the endpoints.

pub mod ledger;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod websocket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::calling::{IceCandidateInit, SessionDescription};
use crate::config::ServerConfig;
use ledger::{Call, CallLedger, CallPhase};
use protocol::{CallId, CallerCode, ClientMessage, ServerMessage};
use registry::{ConnectionId, Endpoint, EndpointKind, IdentityRegistry};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("target {0} is not reachable")]
    TargetUnreachable(CallerCode),
    #[error("target {0} is already in a call")]
    TargetBusy(CallerCode),
    #[error("endpoint on connection {0} is gone")]
    EndpointGone(ConnectionId),
    #[error("connection {0} has not joined")]
    NotJoined(ConnectionId),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum CoordinatorInput {
    /// A socket was accepted; `sender` feeds its outbound half.
    Attach {
        conn: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
    /// Bot injection timer fired for this call.
    InjectBot {
        call_id: CallId,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bot_code: CallerCode,
    pub bot_enabled: bool,
    pub bot_injection_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bot_code: "000".into(),
            bot_enabled: true,
            bot_injection_delay: Duration::from_secs(1),
        }
    }
}

impl From<&ServerConfig> for CoordinatorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            bot_code: config.bot_code.clone(),
            bot_enabled: config.bot_enabled,
            bot_injection_delay: Duration::from_millis(config.bot_injection_delay_ms),
        }
    }
}

/// Counts for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub connections: usize,
    pub registered: usize,
    pub active_calls: usize,
}

pub struct SignalingCoordinator {
    config: CoordinatorConfig,
    registry: IdentityRegistry,
    ledger: CallLedger,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    inbox: mpsc::UnboundedSender<CoordinatorInput>,
}

impl SignalingCoordinator {
    /// `inbox` is the coordinator's own input channel, used for timers.
    pub fn new(config: CoordinatorConfig, inbox: mpsc::UnboundedSender<CoordinatorInput>) -> Self {
        Self {
            ledger: CallLedger::new(config.bot_code.clone()),
            config,
            registry: IdentityRegistry::new(),
            connections: HashMap::new(),
            inbox,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &CallLedger {
        &self.ledger
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self.connections.len(),
            registered: self.registry.len(),
            active_calls: self.ledger.len(),
        }
    }

    pub fn handle(&mut self, input: CoordinatorInput) {
        match input {
            CoordinatorInput::Attach { conn, sender } => {
                tracing::debug!(conn, "Connection attached");
                self.connections.insert(conn, sender);
            }
            CoordinatorInput::Message { conn, message } => self.on_message(conn, message),
            CoordinatorInput::Disconnected { conn } => self.on_disconnect(conn),
            CoordinatorInput::InjectBot { call_id } => self.inject_bot(&call_id),
        }
    }

    fn on_message(&mut self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Join { code } => self.on_join(conn, code),
            ClientMessage::CallInitiate {
                target_code,
                caller_code,
                offer,
            } => {
                if let Some(from) = self.sender_code(conn, Some(&caller_code)) {
                    self.on_call_initiate(conn, from, target_code, offer);
                }
            }
            ClientMessage::Answer {
                caller_code,
                answer,
            } => {
                if let Some(from) = self.sender_code(conn, None) {
                    self.on_answer(from, caller_code, answer);
                }
            }
            ClientMessage::Decline { caller_code } => {
                if let Some(from) = self.sender_code(conn, None) {
                    self.on_decline(from, caller_code);
                }
            }
            ClientMessage::EndCall {
                target_code,
                caller_code,
            } => {
                if let Some(from) = self.sender_code(conn, Some(&caller_code)) {
                    self.on_end_call(from, target_code);
                }
            }
            ClientMessage::IceCandidate {
                candidate,
                target_code,
            } => {
                if let Some(from) = self.sender_code(conn, None) {
                    self.relay_candidate(from, target_code, candidate);
                }
            }
            ClientMessage::Renegotiate {
                target_code,
                description,
            } => {
                if let Some(from) = self.sender_code(conn, None) {
                    self.relay_renegotiate(from, target_code, description);
                }
            }
        }
    }

    /// The code a message is from: the connection's registration. Messages
    /// from connections that have not joined are refused with an `error`.
    fn sender_code(&self, conn: ConnectionId, claimed: Option<&str>) -> Option<CallerCode> {
        let Some(code) = self.registry.code_for(conn) else {
            let error = SignalingError::NotJoined(conn);
            tracing::debug!(conn, "Refusing message: {}", error);
            self.reply(
                conn,
                ServerMessage::Error {
                    message: error.to_string(),
                },
            );
            return None;
        };
        if let Some(claimed) = claimed.filter(|c| *c != code.as_str()) {
            tracing::debug!(conn, registered = %code, claimed, "Message claims another code");
        }
        Some(code.clone())
    }

    fn on_join(&mut self, conn: ConnectionId, code: CallerCode) {
        let Some(sender) = self.connections.get(&conn).cloned() else {
            tracing::warn!(conn, "Join from unknown connection");
            return;
        };
        let kind = if self.config.bot_enabled && code == self.config.bot_code {
            EndpointKind::Bot
        } else {
            EndpointKind::Human
        };

        let registration = self
            .registry
            .register(code.clone(), Endpoint::new(conn, kind, sender));
        for released in registration.released {
            tracing::info!(conn, code = %released, "Connection switched codes, ending its call");
            self.teardown_call(&released);
        }
        tracing::info!(conn, code = %code, ?kind, "Endpoint registered");
        self.reply(conn, ServerMessage::Joined { code });
    }

    fn on_call_initiate(
        &mut self,
        conn: ConnectionId,
        caller: CallerCode,
        target: CallerCode,
        offer: SessionDescription,
    ) {
        if caller == self.config.bot_code {
            self.relay_bot_leg(target, offer);
            return;
        }

        if self.ledger.find_by_code(&caller).is_some() {
            tracing::info!(caller = %caller, "Caller started a new call, ending the previous one");
            self.teardown_call(&caller);
        }

        let call_id = match self.ledger.begin_call(&self.registry, &caller, &target) {
            Ok(call_id) => call_id,
            Err(e) => {
                tracing::info!(caller = %caller, target = %target, "Call declined: {}", e);
                self.reply(conn, ServerMessage::CallDeclined { from_code: target });
                return;
            }
        };

        let incoming = ServerMessage::IncomingCall {
            caller_code: caller.clone(),
            offer,
            call_id: Some(call_id.clone()),
        };
        if let Err(e) = self.deliver_to(&target, incoming) {
            tracing::info!(caller = %caller, target = %target, "Call declined: {}", e);
            self.ledger.set_phase(&call_id, CallPhase::Failed);
            self.ledger.end_call(&caller);
            self.reply(conn, ServerMessage::CallDeclined { from_code: target });
            return;
        }

        self.ledger.set_phase(&call_id, CallPhase::Ringing);
        tracing::info!(call_id = %call_id, caller = %caller, target = %target, "Call ringing");

        if self.config.bot_enabled && target != self.config.bot_code {
            self.schedule_bot_injection(call_id);
        }
    }

    /// The bot dialing a participant. Bot legs are relayed, not recorded.
    fn relay_bot_leg(&mut self, target: CallerCode, offer: SessionDescription) {
        let bot = self.config.bot_code.clone();
        let incoming = ServerMessage::IncomingCall {
            caller_code: bot.clone(),
            offer,
            call_id: None,
        };
        if let Err(e) = self.deliver_to(&target, incoming) {
            tracing::debug!(target = %target, "Bot leg declined: {}", e);
            let _ = self.deliver_to(&bot, ServerMessage::CallDeclined { from_code: target });
        }
    }

    fn on_answer(&mut self, from: CallerCode, caller: CallerCode, answer: SessionDescription) {
        if caller == self.config.bot_code {
            let answered = ServerMessage::CallAnswered {
                answer,
                from_code: from,
            };
            if let Err(e) = self.deliver_to(&caller, answered) {
                tracing::debug!("Bot leg answer dropped: {}", e);
            }
            return;
        }

        let call_id = match self.ledger.find_by_code(&caller) {
            Some(call)
                if call.caller_code == caller
                    && call.target_code == from
                    && call.phase.accepts_answer() =>
            {
                call.call_id.clone()
            }
            _ => {
                tracing::debug!(from = %from, caller = %caller, "Dropping late or duplicate answer");
                return;
            }
        };

        self.ledger.set_phase(&call_id, CallPhase::Answered);
        let answered = ServerMessage::CallAnswered {
            answer,
            from_code: from.clone(),
        };
        match self.deliver_to(&caller, answered) {
            Ok(()) => {
                self.ledger.set_phase(&call_id, CallPhase::Connected);
                tracing::info!(call_id = %call_id, caller = %caller, target = %from, "Call answered");
            }
            Err(e) => tracing::debug!(caller = %caller, "Answer not delivered: {}", e),
        }
    }

    fn on_decline(&mut self, from: CallerCode, caller: CallerCode) {
        if let Err(e) = self.deliver_to(
            &caller,
            ServerMessage::CallDeclined {
                from_code: from.clone(),
            },
        ) {
            tracing::debug!(caller = %caller, "Decline not delivered: {}", e);
        }
        if caller == self.config.bot_code {
            return;
        }

        let ours = self
            .ledger
            .find_by_code(&caller)
            .filter(|call| call.caller_code == caller && call.target_code == from)
            .map(|call| call.call_id.clone());
        if let Some(call_id) = ours {
            self.ledger.set_phase(&call_id, CallPhase::Declined);
            if let Some(call) = self.ledger.end_call(&caller) {
                self.release_bot(&call);
            }
            tracing::info!(call_id = %call_id, caller = %caller, target = %from, "Call declined");
        }
    }

    fn on_end_call(&mut self, from: CallerCode, target: CallerCode) {
        if from == self.config.bot_code {
            // The bot hanging up one of its legs.
            let _ = self.deliver_to(&target, ServerMessage::CallEnded { from_code: from });
            return;
        }
        if target == self.config.bot_code {
            let direct = self
                .ledger
                .find_by_code(&from)
                .is_some_and(|call| call.target_code == target);
            if !direct {
                // A participant hanging up only its bot leg.
                let _ = self.deliver_to(&target, ServerMessage::CallEnded { from_code: from });
                return;
            }
        }
        self.teardown_call(&from);
    }

    fn relay_candidate(&mut self, from: CallerCode, target: CallerCode, candidate: IceCandidateInit) {
        let message = ServerMessage::IceCandidate {
            candidate,
            from_code: from,
        };
        if let Err(e) = self.deliver_to(&target, message) {
            tracing::debug!(target = %target, "Dropping ICE candidate: {}", e);
        }
    }

    fn relay_renegotiate(
        &mut self,
        from: CallerCode,
        target: CallerCode,
        description: SessionDescription,
    ) {
        let message = ServerMessage::Renegotiate {
            description,
            from_code: from,
        };
        if let Err(e) = self.deliver_to(&target, message) {
            tracing::debug!(target = %target, "Dropping renegotiation: {}", e);
        }
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        let codes = self.registry.unregister(conn);
        for code in &codes {
            if *code == self.config.bot_code {
                self.on_bot_gone();
            } else {
                self.teardown_call(code);
            }
        }
        let snapshot = self.snapshot();
        tracing::info!(
            conn,
            codes = ?codes,
            registered = snapshot.registered,
            active_calls = snapshot.active_calls,
            "Endpoint disconnected"
        );
    }

    /// The bot endpoint vanished: its legs end for every participant.
    fn on_bot_gone(&mut self) {
        let bot = self.config.bot_code.clone();
        for call in self.ledger.calls_with_bot() {
            if call.target_code == bot {
                self.ledger.end_call(&call.caller_code);
                let _ = self.deliver_to(&call.caller_code, ServerMessage::CallEnded { from_code: bot.clone() });
                continue;
            }
            self.ledger.detach_bot(&call.call_id);
            for party in [&call.caller_code, &call.target_code] {
                let _ = self.deliver_to(party, ServerMessage::CallEnded { from_code: bot.clone() });
            }
        }
    }

    /// End the call `code` is in: the other party gets exactly one
    /// `call-ended` and the bot is told to leave.
    fn teardown_call(&mut self, code: &str) -> Option<Call> {
        let call = self.ledger.end_call(code)?;
        let other = call.other_party(code).to_string();
        if let Err(e) = self.deliver_to(
            &other,
            ServerMessage::CallEnded {
                from_code: code.to_string(),
            },
        ) {
            tracing::debug!(other = %other, "call-ended not delivered: {}", e);
        }
        self.release_bot(&call);
        tracing::info!(call_id = %call.call_id, ended_by = %code, phase = ?call.phase, "Call ended");
        Some(call)
    }

    fn release_bot(&mut self, call: &Call) {
        if !call.bot_attached {
            return;
        }
        let leave = ServerMessage::BotLeave {
            codes: vec![call.caller_code.clone(), call.target_code.clone()],
        };
        let bot = self.config.bot_code.clone();
        if let Err(e) = self.deliver_to(&bot, leave) {
            tracing::debug!("bot-leave not delivered: {}", e);
        }
    }

    fn schedule_bot_injection(&self, call_id: CallId) {
        let inbox = self.inbox.clone();
        let delay = self.config.bot_injection_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(CoordinatorInput::InjectBot { call_id });
        });
    }

    /// Failure here is logged only; the primary call is unaffected.
    fn inject_bot(&mut self, call_id: &str) {
        let Some(call) = self.ledger.get(call_id).filter(|c| !c.bot_attached).cloned() else {
            tracing::debug!(call_id, "Call gone before bot injection");
            return;
        };
        let join = ServerMessage::BotJoin {
            call_id: call.call_id.clone(),
            caller_code: call.caller_code.clone(),
            target_code: call.target_code.clone(),
        };
        let bot = self.config.bot_code.clone();
        match self.deliver_to(&bot, join) {
            Ok(()) => {
                self.ledger.attach_bot(call_id);
                tracing::info!(call_id, "Bot joined call");
            }
            Err(e) => tracing::warn!(call_id, "Bot injection failed: {}", e),
        }
    }

    fn deliver_to(&self, code: &str, message: ServerMessage) -> Result<(), SignalingError> {
        let endpoint = self
            .registry
            .resolve(code)
            .ok_or_else(|| SignalingError::TargetUnreachable(code.to_string()))?;
        tracing::debug!(to = %code, conn = endpoint.conn, kind = message.kind(), "Routing");
        endpoint.deliver(message)
    }

    fn reply(&self, conn: ConnectionId, message: ServerMessage) {
        if let Some(sender) = self.connections.get(&conn) {
            let _ = sender.send(message);
        }
    }
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorInput>,
    next_conn: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Register a new connection; returns its id and outbound message stream.
    pub fn attach(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(CoordinatorInput::Attach { conn, sender });
        (conn, rx)
    }

    pub fn send(&self, conn: ConnectionId, message: ClientMessage) {
        let _ = self.tx.send(CoordinatorInput::Message { conn, message });
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(CoordinatorInput::Disconnected { conn });
    }

    /// An endpoint link that skips the socket, for endpoints hosted in the
    /// server process.
    pub fn local_link(&self) -> LocalLink {
        let (conn, inbox) = self.attach();
        LocalLink {
            conn,
            coordinator: self.clone(),
            inbox,
        }
    }
}

/// Message path between an endpoint and the coordinator.
#[async_trait]
pub trait SignalLink: Send {
    async fn send(&mut self, message: &ClientMessage) -> anyhow::Result<()>;

    /// `None` once the coordinator side has gone away.
    async fn recv(&mut self) -> anyhow::Result<Option<ServerMessage>>;
}

/// In-process link straight into the coordinator's inbox. Dropping it
/// counts as a disconnect.
pub struct LocalLink {
    conn: ConnectionId,
    coordinator: CoordinatorHandle,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
impl SignalLink for LocalLink {
    async fn send(&mut self, message: &ClientMessage) -> anyhow::Result<()> {
        self.coordinator.send(self.conn, message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ServerMessage>> {
        Ok(self.inbox.recv().await)
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.coordinator.disconnect(self.conn);
    }
}

/// Start the coordinator task.
pub fn spawn(config: CoordinatorConfig) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut coordinator = SignalingCoordinator::new(config, tx.clone());
    let task = tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            coordinator.handle(input);
        }
        tracing::debug!("Coordinator stopped");
    });
    let handle = CoordinatorHandle {
        tx,
        next_conn: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "000";

    struct Harness {
        coordinator: SignalingCoordinator,
        inbox: mpsc::UnboundedReceiver<CoordinatorInput>,
        next_conn: ConnectionId,
    }

    type Rx = mpsc::UnboundedReceiver<ServerMessage>;

    impl Harness {
        fn new() -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            Self {
                coordinator: SignalingCoordinator::new(CoordinatorConfig::default(), tx),
                inbox,
                next_conn: 1,
            }
        }

        fn attach(&mut self) -> (ConnectionId, Rx) {
            let conn = self.next_conn;
            self.next_conn += 1;
            let (sender, rx) = mpsc::unbounded_channel();
            self.coordinator.handle(CoordinatorInput::Attach { conn, sender });
            (conn, rx)
        }

        fn join(&mut self, code: &str) -> (ConnectionId, Rx) {
            let (conn, mut rx) = self.attach();
            self.send(conn, ClientMessage::Join { code: code.into() });
            assert_eq!(rx.try_recv().unwrap(), ServerMessage::Joined { code: code.into() });
            (conn, rx)
        }

        fn send(&mut self, conn: ConnectionId, message: ClientMessage) {
            self.coordinator.handle(CoordinatorInput::Message { conn, message });
        }

        fn disconnect(&mut self, conn: ConnectionId) {
            self.coordinator.handle(CoordinatorInput::Disconnected { conn });
        }

        fn call(&mut self, conn: ConnectionId, from: &str, to: &str) {
            self.send(
                conn,
                ClientMessage::CallInitiate {
                    target_code: to.into(),
                    caller_code: from.into(),
                    offer: SessionDescription::offer(format!("offer {from}")),
                },
            );
        }

        /// Let bot injection timers fire and feed them back in.
        async fn fire_timers(&mut self) {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            while let Ok(input) = self.inbox.try_recv() {
                self.coordinator.handle(input);
            }
        }
    }

    fn drain(rx: &mut Rx) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_call_and_answer_are_forwarded() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (b, mut b_rx) = h.join("B");

        h.call(a, "A", "B");
        let call_id = match b_rx.try_recv().unwrap() {
            ServerMessage::IncomingCall {
                caller_code,
                offer,
                call_id,
            } => {
                assert_eq!(caller_code, "A");
                assert_eq!(offer, SessionDescription::offer("offer A"));
                call_id.unwrap()
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(h.coordinator.ledger().get(&call_id).unwrap().phase, CallPhase::Ringing);

        let answer = SessionDescription::answer("R1");
        h.send(
            b,
            ClientMessage::Answer {
                caller_code: "A".into(),
                answer: answer.clone(),
            },
        );
        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerMessage::CallAnswered {
                answer,
                from_code: "B".into()
            }
        );
        assert_eq!(h.coordinator.ledger().get(&call_id).unwrap().phase, CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_declined() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        h.call(a, "A", "unknown");

        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::CallDeclined {
                from_code: "unknown".into()
            }]
        );
        assert!(h.coordinator.ledger().is_empty());
        assert!(h.coordinator.ledger().find_by_code("A").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_ringing_ends_call_once() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        assert!(matches!(b_rx.try_recv().unwrap(), ServerMessage::IncomingCall { .. }));

        h.disconnect(a);
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::CallEnded {
                from_code: "A".into()
            }]
        );
        assert!(h.coordinator.registry().resolve("A").is_none());
        assert!(h.coordinator.registry().code_for(a).is_none());
        assert!(h.coordinator.ledger().is_empty());
        assert!(h.coordinator.ledger().find_by_code("B").is_none());

        // A second disconnect notice changes nothing.
        h.disconnect(a);
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(h.coordinator.snapshot().registered, 1);
    }

    #[tokio::test]
    async fn test_reconnect_with_same_code_supersedes() {
        let mut h = Harness::new();
        let (old, mut old_rx) = h.join("A");
        let (new, mut new_rx) = h.join("A");
        let (b, mut b_rx) = h.join("B");

        assert_eq!(h.coordinator.registry().len(), 2);
        assert_eq!(h.coordinator.registry().resolve("A").unwrap().conn, new);

        h.call(b, "B", "A");
        assert!(drain(&mut old_rx).is_empty());
        assert!(matches!(new_rx.try_recv().unwrap(), ServerMessage::IncomingCall { .. }));

        // The stale socket closing must not tear down the live registration.
        h.disconnect(old);
        assert_eq!(h.coordinator.registry().resolve("A").unwrap().conn, new);
        assert!(h.coordinator.ledger().find_by_code("A").is_some());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_dropped() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (b, _b_rx) = h.join("B");
        h.call(a, "A", "B");

        for _ in 0..2 {
            h.send(
                b,
                ClientMessage::Answer {
                    caller_code: "A".into(),
                    answer: SessionDescription::answer("R1"),
                },
            );
        }
        assert_eq!(drain(&mut a_rx).len(), 1);

        // An answer for a call that never existed goes nowhere.
        let (c, _c_rx) = h.join("C");
        h.send(
            c,
            ClientMessage::Answer {
                caller_code: "A".into(),
                answer: SessionDescription::answer("bogus"),
            },
        );
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_decline_is_forwarded_and_ends_call() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (b, _b_rx) = h.join("B");
        h.call(a, "A", "B");
        h.send(b, ClientMessage::Decline { caller_code: "A".into() });

        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::CallDeclined { from_code: "B".into() }]
        );
        assert!(h.coordinator.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_busy_target_is_declined() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.join("A");
        let (_b, _b_rx) = h.join("B");
        let (c, mut c_rx) = h.join("C");
        h.call(a, "A", "B");
        h.call(c, "C", "B");

        assert_eq!(
            drain(&mut c_rx),
            vec![ServerMessage::CallDeclined { from_code: "B".into() }]
        );
        assert_eq!(h.coordinator.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_reinitiating_ends_previous_call() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        let (_c, mut c_rx) = h.join("C");
        h.call(a, "A", "B");
        drain(&mut b_rx);

        h.call(a, "A", "C");
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::CallEnded { from_code: "A".into() }]
        );
        assert!(matches!(c_rx.try_recv().unwrap(), ServerMessage::IncomingCall { .. }));
        assert_eq!(h.coordinator.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_ice_candidates_are_relayed_with_sender() {
        let mut h = Harness::new();
        let (a, _a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        let candidate = IceCandidateInit::for_audio("candidate:1 1 udp 1 10.0.0.1 5000 typ host");

        h.send(
            a,
            ClientMessage::IceCandidate {
                candidate: candidate.clone(),
                target_code: "B".into(),
            },
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::IceCandidate {
                candidate: candidate.clone(),
                from_code: "A".into()
            }]
        );

        // Unknown targets are dropped silently.
        h.send(
            a,
            ClientMessage::IceCandidate {
                candidate,
                target_code: "nobody".into(),
            },
        );
    }

    #[tokio::test]
    async fn test_unjoined_connection_cannot_answer() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (_b, _b_rx) = h.join("B");
        h.call(a, "A", "B");

        let (stranger, _rx) = h.attach();
        h.send(
            stranger,
            ClientMessage::Answer {
                caller_code: "A".into(),
                answer: SessionDescription::answer("x"),
            },
        );
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unjoined_connection_cannot_start_calls() {
        let mut h = Harness::new();
        let (_b, mut b_rx) = h.join("B");

        let (stranger, mut stranger_rx) = h.attach();
        h.call(stranger, "X", "B");
        assert!(matches!(
            drain(&mut stranger_rx).as_slice(),
            [ServerMessage::Error { .. }]
        ));
        assert!(drain(&mut b_rx).is_empty());
        assert!(h.coordinator.ledger().is_empty());

        h.disconnect(stranger);
        assert!(h.coordinator.ledger().is_empty());

        // B is still free to take calls.
        let (c, mut c_rx) = h.join("C");
        h.call(c, "C", "B");
        assert!(matches!(b_rx.try_recv().unwrap(), ServerMessage::IncomingCall { .. }));
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unjoined_connection_cannot_end_calls() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        drain(&mut b_rx);

        let (stranger, mut stranger_rx) = h.attach();
        h.send(
            stranger,
            ClientMessage::EndCall {
                target_code: "B".into(),
                caller_code: "A".into(),
            },
        );
        assert!(matches!(
            drain(&mut stranger_rx).as_slice(),
            [ServerMessage::Error { .. }]
        ));
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
        assert!(h.coordinator.ledger().find_by_code("A").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bot_does_not_affect_call() {
        let mut h = Harness::new();
        let (a, mut a_rx) = h.join("A");
        let (b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        h.fire_timers().await;

        let call = h.coordinator.ledger().find_by_code("A").unwrap().clone();
        assert!(!call.bot_attached);

        h.send(
            b,
            ClientMessage::Answer {
                caller_code: "A".into(),
                answer: SessionDescription::answer("R1"),
            },
        );
        assert!(matches!(a_rx.try_recv().unwrap(), ServerMessage::CallAnswered { .. }));

        h.send(
            a,
            ClientMessage::EndCall {
                target_code: "B".into(),
                caller_code: "A".into(),
            },
        );
        let tail = drain(&mut b_rx);
        assert_eq!(tail.last(), Some(&ServerMessage::CallEnded { from_code: "A".into() }));
        assert!(h.coordinator.ledger().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_injected_and_released() {
        let mut h = Harness::new();
        let (_bot, mut bot_rx) = h.join(BOT);
        let (a, mut a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        assert!(drain(&mut bot_rx).is_empty());

        h.fire_timers().await;
        let call_id = h.coordinator.ledger().find_by_code("A").unwrap().call_id.clone();
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::BotJoin {
                call_id: call_id.clone(),
                caller_code: "A".into(),
                target_code: "B".into(),
            }]
        );
        assert!(h.coordinator.ledger().get(&call_id).unwrap().bot_attached);

        h.send(
            a,
            ClientMessage::EndCall {
                target_code: "B".into(),
                caller_code: "A".into(),
            },
        );
        let to_b = drain(&mut b_rx);
        assert_eq!(to_b.last(), Some(&ServerMessage::CallEnded { from_code: "A".into() }));
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::BotLeave {
                codes: vec!["A".into(), "B".into()]
            }]
        );
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_ended_before_injection_skips_bot() {
        let mut h = Harness::new();
        let (_bot, mut bot_rx) = h.join(BOT);
        let (a, _a_rx) = h.join("A");
        let (_b, _b_rx) = h.join("B");
        h.call(a, "A", "B");
        h.disconnect(a);
        h.fire_timers().await;
        assert!(drain(&mut bot_rx).is_empty());
    }

    #[tokio::test]
    async fn test_bot_legs_are_relayed_without_ledger() {
        let mut h = Harness::new();
        let (bot, mut bot_rx) = h.join(BOT);
        let (a, mut a_rx) = h.join("A");

        h.call(bot, BOT, "A");
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::IncomingCall {
                caller_code: BOT.into(),
                offer: SessionDescription::offer("offer 000"),
                call_id: None,
            }]
        );
        assert!(h.coordinator.ledger().is_empty());

        h.send(
            a,
            ClientMessage::Answer {
                caller_code: BOT.into(),
                answer: SessionDescription::answer("bot leg"),
            },
        );
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::CallAnswered {
                answer: SessionDescription::answer("bot leg"),
                from_code: "A".into(),
            }]
        );

        h.call(bot, BOT, "gone");
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::CallDeclined { from_code: "gone".into() }]
        );
    }

    #[tokio::test]
    async fn test_direct_call_to_bot() {
        let mut h = Harness::new();
        let (_bot, mut bot_rx) = h.join(BOT);
        let (a, mut a_rx) = h.join("A");

        h.call(a, "A", BOT);
        assert!(matches!(
            bot_rx.try_recv().unwrap(),
            ServerMessage::IncomingCall { call_id: Some(_), .. }
        ));
        h.disconnect(a);
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::CallEnded { from_code: "A".into() }]
        );
        assert!(drain(&mut a_rx).is_empty());
        assert!(h.coordinator.ledger().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_disconnect_ends_bot_legs_only() {
        let mut h = Harness::new();
        let (bot, _bot_rx) = h.join(BOT);
        let (a, mut a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        h.fire_timers().await;
        drain(&mut b_rx);

        h.disconnect(bot);
        let bot_ended = ServerMessage::CallEnded { from_code: BOT.into() };
        assert_eq!(drain(&mut a_rx), vec![bot_ended.clone()]);
        assert_eq!(drain(&mut b_rx), vec![bot_ended]);

        let call = h.coordinator.ledger().find_by_code("A").unwrap();
        assert!(!call.bot_attached);
    }

    #[tokio::test]
    async fn test_hanging_up_bot_leg_keeps_primary_call() {
        let mut h = Harness::new();
        let (_bot, mut bot_rx) = h.join(BOT);
        let (a, _a_rx) = h.join("A");
        let (_b, mut b_rx) = h.join("B");
        h.call(a, "A", "B");
        drain(&mut b_rx);

        h.send(
            a,
            ClientMessage::EndCall {
                target_code: BOT.into(),
                caller_code: "A".into(),
            },
        );
        assert_eq!(
            drain(&mut bot_rx),
            vec![ServerMessage::CallEnded { from_code: "A".into() }]
        );
        assert!(drain(&mut b_rx).is_empty());
        assert!(h.coordinator.ledger().find_by_code("A").is_some());
    }

    #[tokio::test]
    async fn test_local_link_disconnects_on_drop() {
        let (handle, _task) = spawn(CoordinatorConfig::default());
        let mut a = handle.local_link();
        let mut b = handle.local_link();
        a.send(&ClientMessage::Join { code: "A".into() }).await.unwrap();
        b.send(&ClientMessage::Join { code: "B".into() }).await.unwrap();
        assert!(matches!(a.recv().await.unwrap(), Some(ServerMessage::Joined { .. })));
        assert!(matches!(b.recv().await.unwrap(), Some(ServerMessage::Joined { .. })));

        a.send(&ClientMessage::CallInitiate {
            target_code: "B".into(),
            caller_code: "A".into(),
            offer: SessionDescription::offer("o"),
        })
        .await
        .unwrap();
        assert!(matches!(b.recv().await.unwrap(), Some(ServerMessage::IncomingCall { .. })));

        drop(a);
        assert_eq!(
            b.recv().await.unwrap(),
            Some(ServerMessage::CallEnded { from_code: "A".into() })
        );
    }
}
