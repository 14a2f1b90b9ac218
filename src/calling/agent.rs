//! Endpoint runtime shared by the bot and the phone.
//!
//! A `CallAgent` keeps one `ConnectionSupervisor` per remote code and turns
//! coordinator messages into negotiation operations. Operations that wait on
//! ICE gathering run on their own tasks and report back through a channel,
//! so the loop keeps applying remote candidates while a description is
//! still being prepared. Local candidates are held back until the
//! description they belong to has been sent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use super::negotiation::{CandidateOutcome, NegotiationError, RemoteAnswerOutcome};
use super::supervisor::{
    Connectivity, ConnectionSupervisor, LegId, SupervisorConfig, SupervisorEvent, SupervisorNotice,
};
use super::transport::{LocalMedia, TransportFactory};
use super::{IceCandidateInit, SessionDescription};
use crate::signaling::protocol::{CallerCode, ClientMessage, ServerMessage};
use crate::signaling::SignalLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// A person's endpoint: one primary call, plus the bot's leg.
    Human { auto_answer: bool },
    /// The bot: any number of legs, all driven by the coordinator.
    Bot,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub code: CallerCode,
    pub role: AgentRole,
    /// Incoming calls from this code are always accepted.
    pub bot_code: CallerCode,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    Dial(CallerCode),
    HangUp,
    Shutdown,
}

/// Why `CallAgent::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    LinkClosed,
    Shutdown,
}

/// What happened, for whoever drives the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Joined(CallerCode),
    Ringing(CallerCode),
    Answered(CallerCode),
    Declined(CallerCode),
    Connectivity {
        remote: CallerCode,
        state: Connectivity,
    },
    Ended {
        remote: CallerCode,
        reason: String,
    },
}

/// A local description being prepared on a background task.
#[derive(Debug, Clone)]
enum Job {
    Offer,
    Answer(SessionDescription),
    RenegotiationAnswer(SessionDescription),
}

struct Completion {
    leg: LegId,
    remote: CallerCode,
    job: Job,
    result: Result<SessionDescription, NegotiationError>,
}

struct Leg {
    id: LegId,
    supervisor: Arc<ConnectionSupervisor>,
    /// Set once our description reached the coordinator.
    signaled: bool,
    held_candidates: Vec<IceCandidateInit>,
}

pub struct CallAgent {
    config: AgentConfig,
    media: LocalMedia,
    factory: Arc<dyn TransportFactory>,
    legs: HashMap<CallerCode, Leg>,
    primary: Option<CallerCode>,
    next_leg: LegId,
    outgoing: Vec<ClientMessage>,
    notices_tx: mpsc::UnboundedSender<SupervisorNotice>,
    notices: mpsc::UnboundedReceiver<SupervisorNotice>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    observer: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl CallAgent {
    pub fn new(config: AgentConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            media: LocalMedia::opus(format!("peercall-{}", config.code)),
            config,
            factory,
            legs: HashMap::new(),
            primary: None,
            next_leg: 1,
            outgoing: Vec::new(),
            notices_tx,
            notices,
            completions_tx,
            completions,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Join under our code and serve until the link closes or `Shutdown`.
    /// Every leg is closed on the way out.
    pub async fn run<L: SignalLink + ?Sized>(
        &mut self,
        link: &mut L,
        commands: &mut mpsc::UnboundedReceiver<AgentCommand>,
    ) -> Result<AgentExit> {
        link.send(&ClientMessage::Join {
            code: self.config.code.clone(),
        })
        .await?;

        let result = loop {
            tokio::select! {
                incoming = link.recv() => match incoming {
                    Ok(Some(message)) => self.on_server_message(message).await,
                    Ok(None) => {
                        tracing::info!(code = %self.config.code, "Signaling link closed");
                        break Ok(AgentExit::LinkClosed);
                    }
                    Err(e) => break Err(e),
                },
                Some(notice) = self.notices.recv() => self.on_notice(notice).await,
                Some(done) = self.completions.recv() => self.on_completion(done).await,
                command = commands.recv() => match command {
                    Some(AgentCommand::Shutdown) | None => {
                        self.hang_up().await;
                        break self.flush(link).await.map(|()| AgentExit::Shutdown);
                    }
                    Some(command) => self.on_command(command).await,
                },
            }
            if let Err(e) = self.flush(link).await {
                break Err(e);
            }
        };

        self.close_all("agent stopped").await;
        result
    }

    async fn flush<L: SignalLink + ?Sized>(&mut self, link: &mut L) -> Result<()> {
        for message in std::mem::take(&mut self.outgoing) {
            link.send(&message).await?;
        }
        Ok(())
    }

    async fn on_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Dial(target) => {
                if self.primary.is_some() {
                    self.hang_up().await;
                }
                if self.start_leg(&target, Job::Offer) {
                    self.primary = Some(target);
                }
            }
            AgentCommand::HangUp => self.hang_up().await,
            AgentCommand::Shutdown => {}
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Joined { code } => {
                tracing::info!(code = %code, "Joined");
                self.emit(AgentEvent::Joined(code));
            }
            ServerMessage::IncomingCall {
                caller_code, offer, ..
            } => self.on_incoming_call(caller_code, offer).await,
            ServerMessage::CallAnswered { answer, from_code } => {
                self.on_remote_answer(from_code, answer).await
            }
            ServerMessage::CallDeclined { from_code } => {
                tracing::info!(remote = %from_code, "Call declined");
                self.emit(AgentEvent::Declined(from_code.clone()));
                self.on_remote_gone(&from_code, "declined").await;
            }
            ServerMessage::CallEnded { from_code } => {
                self.on_remote_gone(&from_code, "remote hung up").await
            }
            ServerMessage::IceCandidate {
                candidate,
                from_code,
            } => self.on_remote_candidate(from_code, candidate).await,
            ServerMessage::Renegotiate {
                description,
                from_code,
            } => self.on_renegotiate(from_code, description).await,
            ServerMessage::BotJoin {
                call_id,
                caller_code,
                target_code,
            } => {
                if self.config.role != AgentRole::Bot {
                    tracing::debug!("Ignoring bot-join on a human endpoint");
                    return;
                }
                tracing::info!(call_id = %call_id, caller = %caller_code, target = %target_code, "Joining call");
                for code in [caller_code, target_code] {
                    self.close_leg(&code, "replaced").await;
                    self.start_leg(&code, Job::Offer);
                }
            }
            ServerMessage::BotLeave { codes } => {
                for code in codes {
                    self.close_leg(&code, "bot released").await;
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Coordinator rejected a message: {}", message)
            }
        }
    }

    async fn on_incoming_call(&mut self, caller: CallerCode, offer: SessionDescription) {
        if self.legs.contains_key(&caller) {
            tracing::debug!(remote = %caller, "Duplicate incoming call ignored");
            return;
        }

        if let AgentRole::Human { auto_answer } = self.config.role {
            if caller != self.config.bot_code {
                self.emit(AgentEvent::Ringing(caller.clone()));
                let busy = self.primary.is_some();
                if busy || !auto_answer {
                    tracing::info!(remote = %caller, busy, "Declining call");
                    self.outgoing.push(ClientMessage::Decline {
                        caller_code: caller,
                    });
                    return;
                }
                self.primary = Some(caller.clone());
            }
        }

        tracing::info!(remote = %caller, "Answering call");
        if !self.start_leg(&caller, Job::Answer(offer)) {
            if self.primary.as_deref() == Some(caller.as_str()) {
                self.primary = None;
            }
            self.outgoing.push(ClientMessage::Decline {
                caller_code: caller,
            });
        }
    }

    async fn on_remote_answer(&mut self, remote: CallerCode, answer: SessionDescription) {
        let Some(supervisor) = self.supervisor(&remote) else {
            tracing::debug!(remote = %remote, "Answer for unknown leg dropped");
            return;
        };
        match supervisor.set_remote_answer(&answer).await {
            Ok(RemoteAnswerOutcome::Applied) => {
                tracing::info!(remote = %remote, "Call answered");
                self.emit(AgentEvent::Answered(remote));
            }
            Ok(RemoteAnswerOutcome::AlreadyStable) => {
                tracing::debug!(remote = %remote, "Late answer ignored, already stable")
            }
            Err(e) if e.is_ignorable() || matches!(e, NegotiationError::StateViolation { .. }) => {
                tracing::debug!(remote = %remote, "Answer ignored: {}", e)
            }
            Err(e) => self.fail_leg(&remote, &e.to_string()).await,
        }
    }

    async fn on_remote_candidate(&mut self, remote: CallerCode, candidate: IceCandidateInit) {
        let Some(supervisor) = self.supervisor(&remote) else {
            tracing::debug!(remote = %remote, "Candidate for unknown leg dropped");
            return;
        };
        match supervisor.add_ice_candidate(candidate).await {
            Ok(CandidateOutcome::Queued) => tracing::debug!(remote = %remote, "Candidate queued"),
            Ok(_) => {}
            Err(e) => tracing::debug!(remote = %remote, "Candidate ignored: {}", e),
        }
    }

    async fn on_renegotiate(&mut self, remote: CallerCode, description: SessionDescription) {
        if description.is_offer() {
            if !self.legs.contains_key(&remote) {
                tracing::debug!(remote = %remote, "Renegotiation for unknown leg dropped");
                return;
            }
            tracing::info!(remote = %remote, "Peer restarted ICE, answering");
            self.spawn_job(&remote, Job::RenegotiationAnswer(description));
        } else {
            self.on_remote_answer(remote, description).await;
        }
    }

    /// `remote` declined or hung up. Losing the primary call ends everything.
    async fn on_remote_gone(&mut self, remote: &str, reason: &str) {
        if self.primary.as_deref() == Some(remote) {
            self.primary = None;
            self.close_all(reason).await;
        } else {
            self.close_leg(remote, reason).await;
        }
    }

    async fn on_notice(&mut self, notice: SupervisorNotice) {
        let Some(remote) = self.remote_for(notice.leg) else {
            return;
        };
        match notice.event {
            SupervisorEvent::LocalCandidate(candidate) => {
                let Some(leg) = self.legs.get_mut(&remote) else {
                    return;
                };
                if leg.signaled {
                    self.outgoing.push(ClientMessage::IceCandidate {
                        candidate,
                        target_code: remote,
                    });
                } else {
                    leg.held_candidates.push(candidate);
                }
            }
            SupervisorEvent::Connectivity(state) => {
                self.emit(AgentEvent::Connectivity { remote, state });
            }
            SupervisorEvent::RestartOffer(offer) => {
                self.outgoing.push(ClientMessage::Renegotiate {
                    target_code: remote,
                    description: offer,
                });
            }
            SupervisorEvent::Failed(reason) => self.fail_leg(&remote, &reason).await,
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        let Some(leg) = self.legs.get_mut(&done.remote).filter(|leg| leg.id == done.leg) else {
            tracing::debug!(remote = %done.remote, "Negotiation finished for a closed leg");
            return;
        };

        let description = match done.result {
            Ok(description) => description,
            Err(e) if e.is_ignorable() => {
                tracing::debug!(remote = %done.remote, "Negotiation step skipped: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!(remote = %done.remote, "Negotiation failed: {}", e);
                self.fail_leg(&done.remote, &e.to_string()).await;
                return;
            }
        };

        let remote = done.remote;
        self.outgoing.push(match done.job {
            Job::Offer => ClientMessage::CallInitiate {
                target_code: remote.clone(),
                caller_code: self.config.code.clone(),
                offer: description,
            },
            Job::Answer(_) => ClientMessage::Answer {
                caller_code: remote.clone(),
                answer: description,
            },
            Job::RenegotiationAnswer(_) => ClientMessage::Renegotiate {
                target_code: remote.clone(),
                description,
            },
        });
        leg.signaled = true;
        for candidate in leg.held_candidates.drain(..) {
            self.outgoing.push(ClientMessage::IceCandidate {
                candidate,
                target_code: remote.clone(),
            });
        }
    }

    /// Create a supervised leg towards `remote` and start `job` on it.
    fn start_leg(&mut self, remote: &str, job: Job) -> bool {
        let id = self.next_leg;
        self.next_leg += 1;
        let supervisor = match ConnectionSupervisor::new(
            id,
            remote.to_string(),
            self.media.clone(),
            Arc::clone(&self.factory),
            self.config.supervisor.clone(),
            self.notices_tx.clone(),
        ) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                tracing::error!(remote, "Could not set up a transport: {}", e);
                self.emit(AgentEvent::Ended {
                    remote: remote.to_string(),
                    reason: e.to_string(),
                });
                return false;
            }
        };
        self.legs.insert(
            remote.to_string(),
            Leg {
                id,
                supervisor,
                signaled: false,
                held_candidates: Vec::new(),
            },
        );
        self.spawn_job(remote, job);
        true
    }

    fn spawn_job(&self, remote: &str, job: Job) {
        let Some(leg) = self.legs.get(remote) else {
            return;
        };
        let supervisor = Arc::clone(&leg.supervisor);
        let done = self.completions_tx.clone();
        let leg = leg.id;
        let remote = remote.to_string();
        tokio::spawn(async move {
            let result = match &job {
                Job::Offer => supervisor.create_offer().await,
                Job::Answer(offer) | Job::RenegotiationAnswer(offer) => {
                    supervisor.create_answer(offer).await
                }
            };
            let _ = done.send(Completion {
                leg,
                remote,
                job,
                result,
            });
        });
    }

    /// End our side of the call through the normal end-call path.
    async fn fail_leg(&mut self, remote: &str, reason: &str) {
        tracing::warn!(remote, "Ending call after negotiation failure: {}", reason);
        self.outgoing.push(ClientMessage::EndCall {
            target_code: remote.to_string(),
            caller_code: self.config.code.clone(),
        });
        if self.primary.as_deref() == Some(remote) {
            self.primary = None;
            self.close_all(reason).await;
        } else {
            self.close_leg(remote, reason).await;
        }
    }

    async fn hang_up(&mut self) {
        if let Some(primary) = self.primary.take() {
            tracing::info!(remote = %primary, "Hanging up");
            self.outgoing.push(ClientMessage::EndCall {
                target_code: primary,
                caller_code: self.config.code.clone(),
            });
        }
        self.close_all("hung up").await;
    }

    async fn close_leg(&mut self, remote: &str, reason: &str) {
        let Some(leg) = self.legs.remove(remote) else {
            return;
        };
        leg.supervisor.close().await;
        tracing::info!(remote, reason, "Leg closed");
        self.emit(AgentEvent::Ended {
            remote: remote.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn close_all(&mut self, reason: &str) {
        let remotes: Vec<CallerCode> = self.legs.keys().cloned().collect();
        for remote in remotes {
            self.close_leg(&remote, reason).await;
        }
    }

    fn supervisor(&self, remote: &str) -> Option<Arc<ConnectionSupervisor>> {
        self.legs.get(remote).map(|leg| Arc::clone(&leg.supervisor))
    }

    fn remote_for(&self, leg: LegId) -> Option<CallerCode> {
        self.legs
            .iter()
            .find(|(_, l)| l.id == leg)
            .map(|(code, _)| code.clone())
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::calling::transport::testing::{Script, ScriptedFactory};
    use crate::signaling::{self, CoordinatorConfig, CoordinatorHandle};

    struct Peer {
        commands: mpsc::UnboundedSender<AgentCommand>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        factory: Arc<ScriptedFactory>,
    }

    impl Peer {
        async fn expect(&mut self, wanted: AgentEvent) {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, async {
                loop {
                    match self.events.recv().await {
                        Some(event) if event == wanted => return,
                        Some(_) => continue,
                        None => panic!("agent stopped before {wanted:?}"),
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
        }
    }

    fn coordinator(bot_enabled: bool) -> CoordinatorHandle {
        let (handle, _task) = signaling::spawn(CoordinatorConfig {
            bot_code: "000".into(),
            bot_enabled,
            bot_injection_delay: Duration::from_millis(20),
        });
        handle
    }

    fn agent_config(code: &str, role: AgentRole) -> AgentConfig {
        AgentConfig {
            code: code.into(),
            role,
            bot_code: "000".into(),
            supervisor: SupervisorConfig {
                ice_gathering_timeout: Duration::from_secs(15),
                offer_debounce: Duration::ZERO,
                restart_wait: Duration::from_secs(20),
            },
        }
    }

    async fn start(coordinator: &CoordinatorHandle, code: &str, role: AgentRole, script: Script) -> Peer {
        let factory = Arc::new(ScriptedFactory::new(script));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        let mut agent = CallAgent::new(agent_config(code, role), factory.clone()).with_observer(events_tx);
        let mut link = coordinator.local_link();
        tokio::spawn(async move {
            let _ = agent.run(&mut link, &mut commands_rx).await;
        });
        assert_eq!(events.recv().await, Some(AgentEvent::Joined(code.into())));
        Peer {
            commands,
            events,
            factory,
        }
    }

    fn human(auto_answer: bool) -> AgentRole {
        AgentRole::Human { auto_answer }
    }

    fn ended(remote: &str, reason: &str) -> AgentEvent {
        AgentEvent::Ended {
            remote: remote.into(),
            reason: reason.into(),
        }
    }

    #[tokio::test]
    async fn test_dial_answer_and_hang_up() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let mut b = start(&coordinator, "B", human(true), Script::default()).await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        b.expect(AgentEvent::Ringing("A".into())).await;
        a.expect(AgentEvent::Answered("B".into())).await;
        {
            let script = a.factory.script.lock().unwrap();
            assert_eq!(script.offers_created, 1);
            assert_eq!(script.remote, vec![SessionDescription::answer("answer from transport 0")]);
        }
        assert_eq!(b.factory.script.lock().unwrap().answers_created, 1);

        a.commands.send(AgentCommand::HangUp).unwrap();
        a.expect(ended("B", "hung up")).await;
        b.expect(ended("A", "remote hung up")).await;
    }

    #[tokio::test]
    async fn test_candidates_follow_the_description() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let mut b = start(&coordinator, "B", human(true), Script::default()).await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        a.expect(AgentEvent::Answered("B".into())).await;
        b.expect(AgentEvent::Ringing("A".into())).await;

        // A's host candidate reaches B's session, B's reaches A's.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let b_has = b.factory.script.lock().unwrap().applied.iter().any(|c| c.contains("40000"));
                let a_has = a.factory.script.lock().unwrap().applied.iter().any(|c| c.contains("40000"));
                if a_has && b_has {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_without_auto_answer_calls_are_declined() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let mut b = start(&coordinator, "B", human(false), Script::default()).await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        b.expect(AgentEvent::Ringing("A".into())).await;
        a.expect(AgentEvent::Declined("B".into())).await;
        a.expect(ended("B", "declined")).await;
        assert_eq!(b.factory.script.lock().unwrap().created, 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_declined() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        a.commands.send(AgentCommand::Dial("nobody".into())).unwrap();
        a.expect(AgentEvent::Declined("nobody".into())).await;
    }

    #[tokio::test]
    async fn test_failed_answer_ends_call_for_both() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let mut b = start(
            &coordinator,
            "B",
            human(true),
            Script {
                fail_answers: 2,
                ..Default::default()
            },
        )
        .await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        a.expect(ended("B", "remote hung up")).await;
        b.expect(AgentEvent::Ringing("A".into())).await;
        assert_eq!(b.factory.script.lock().unwrap().created, 2);
    }

    #[tokio::test]
    async fn test_answer_recovers_after_one_failure() {
        let coordinator = coordinator(false);
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let b = start(
            &coordinator,
            "B",
            human(true),
            Script {
                fail_answers: 1,
                ..Default::default()
            },
        )
        .await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        a.expect(AgentEvent::Answered("B".into())).await;
        assert_eq!(b.factory.script.lock().unwrap().created, 2);
    }

    #[tokio::test]
    async fn test_bot_joins_both_parties_and_leaves_with_them() {
        let coordinator = coordinator(true);
        let mut bot = start(&coordinator, "000", AgentRole::Bot, Script::default()).await;
        let mut a = start(&coordinator, "A", human(false), Script::default()).await;
        let mut b = start(&coordinator, "B", human(true), Script::default()).await;

        a.commands.send(AgentCommand::Dial("B".into())).unwrap();
        a.expect(AgentEvent::Answered("B".into())).await;
        bot.expect(AgentEvent::Answered("A".into())).await;
        bot.expect(AgentEvent::Answered("B".into())).await;
        assert_eq!(bot.factory.script.lock().unwrap().offers_created, 2);

        b.commands.send(AgentCommand::HangUp).unwrap();
        a.expect(ended("000", "remote hung up")).await;
        bot.expect(ended("A", "bot released")).await;
    }
}
