//! In-flight and active calls, indexed by both participants' codes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::protocol::{CallId, CallerCode};
use super::registry::IdentityRegistry;
use super::SignalingError;

/// Lifecycle of a call as the coordinator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Initiated,
    Ringing,
    Answered,
    Connected,
    Ended,
    Declined,
    Failed,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Failed)
    }

    /// Whether an answer from the target is still expected.
    pub fn accepts_answer(self) -> bool {
        matches!(self, Self::Ringing | Self::Answered)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub call_id: CallId,
    pub caller_code: CallerCode,
    pub target_code: CallerCode,
    pub bot_attached: bool,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
}

impl Call {
    /// The participant on the other side from `code`.
    pub fn other_party(&self, code: &str) -> &str {
        if self.caller_code == code {
            &self.target_code
        } else {
            &self.caller_code
        }
    }
}

/// Calls owned by the coordinator. Each human participant code maps to at
/// most one call; the bot code is never indexed since it joins many calls.
#[derive(Debug)]
pub struct CallLedger {
    bot_code: CallerCode,
    calls: HashMap<CallId, Call>,
    by_code: HashMap<CallerCode, CallId>,
}

impl CallLedger {
    pub fn new(bot_code: impl Into<CallerCode>) -> Self {
        Self {
            bot_code: bot_code.into(),
            calls: HashMap::new(),
            by_code: HashMap::new(),
        }
    }

    pub fn begin_call(
        &mut self,
        registry: &IdentityRegistry,
        caller_code: &str,
        target_code: &str,
    ) -> Result<CallId, SignalingError> {
        let to_bot = target_code == self.bot_code;
        if !to_bot && registry.resolve(target_code).is_none() {
            return Err(SignalingError::TargetUnreachable(target_code.to_string()));
        }
        if caller_code == target_code || self.by_code.contains_key(target_code) {
            return Err(SignalingError::TargetBusy(target_code.to_string()));
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let call = Call {
            call_id: call_id.clone(),
            caller_code: caller_code.to_string(),
            target_code: target_code.to_string(),
            bot_attached: false,
            phase: CallPhase::Initiated,
            started_at: Utc::now(),
        };
        self.calls.insert(call_id.clone(), call);
        self.by_code.insert(caller_code.to_string(), call_id.clone());
        if !to_bot {
            self.by_code.insert(target_code.to_string(), call_id.clone());
        }
        Ok(call_id)
    }

    pub fn set_phase(&mut self, call_id: &str, phase: CallPhase) {
        if let Some(call) = self.calls.get_mut(call_id) {
            tracing::debug!(call_id, from = ?call.phase, to = ?phase, "Call phase");
            call.phase = phase;
        }
    }

    /// Mark the bot as attached. No-op if the call has already ended.
    pub fn attach_bot(&mut self, call_id: &str) -> bool {
        match self.calls.get_mut(call_id) {
            Some(call) => {
                call.bot_attached = true;
                true
            }
            None => false,
        }
    }

    /// Clear the bot flag, e.g. when the bot endpoint went away.
    pub fn detach_bot(&mut self, call_id: &str) {
        if let Some(call) = self.calls.get_mut(call_id) {
            call.bot_attached = false;
        }
    }

    /// Calls the bot takes part in, either attached or dialed directly.
    pub fn calls_with_bot(&self) -> Vec<Call> {
        self.calls
            .values()
            .filter(|c| c.bot_attached || c.target_code == self.bot_code)
            .cloned()
            .collect()
    }

    /// Remove the call `code` participates in, along with both index
    /// entries. Returns the removed call in its terminal phase (`Ended`
    /// unless it was already declined or failed); ending twice is a no-op.
    pub fn end_call(&mut self, code: &str) -> Option<Call> {
        let call_id = self.by_code.get(code)?.clone();
        let mut call = self.calls.remove(&call_id)?;
        if !call.phase.is_terminal() {
            call.phase = CallPhase::Ended;
        }
        for party in [&call.caller_code, &call.target_code] {
            if self.by_code.get(party.as_str()) == Some(&call_id) {
                self.by_code.remove(party.as_str());
            }
        }
        Some(call)
    }

    pub fn find_by_code(&self, code: &str) -> Option<&Call> {
        self.by_code.get(code).and_then(|id| self.calls.get(id))
    }

    pub fn get(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
