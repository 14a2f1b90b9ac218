//! JSON wire messages exchanged with endpoints over the signaling socket.
//!
//! Frames are internally tagged by `type` with kebab-case event names and
//! camelCase fields, matching what browser clients send.

use serde::{Deserialize, Serialize};

use crate::calling::{IceCandidateInit, SessionDescription};

/// Opaque routing identifier for a participant.
pub type CallerCode = String;

/// Opaque identifier of one call.
pub type CallId = String;

/// Endpoint → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    CallInitiate {
        target_code: CallerCode,
        caller_code: CallerCode,
        offer: SessionDescription,
    },
    /// `caller_code` is the party that placed the call being answered.
    #[serde(rename_all = "camelCase")]
    Answer {
        caller_code: CallerCode,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Decline {
        caller_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    EndCall {
        target_code: CallerCode,
        caller_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        target_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    Renegotiate {
        target_code: CallerCode,
        description: SessionDescription,
    },
}

/// Coordinator → endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Joined {
        code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        caller_code: CallerCode,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    #[serde(rename_all = "camelCase")]
    CallAnswered {
        answer: SessionDescription,
        from_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    CallDeclined {
        from_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        from_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        from_code: CallerCode,
    },
    #[serde(rename_all = "camelCase")]
    Renegotiate {
        description: SessionDescription,
        from_code: CallerCode,
    },
    /// Sent to the bot: join the call by dialing both participants.
    #[serde(rename_all = "camelCase")]
    BotJoin {
        call_id: CallId,
        caller_code: CallerCode,
        target_code: CallerCode,
    },
    /// Sent to the bot: drop every leg with these codes.
    BotLeave {
        codes: Vec<CallerCode>,
    },
    Error {
        message: String,
    },
}

impl ClientMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAnswered { .. } => "call-answered",
            Self::CallDeclined { .. } => "call-declined",
            Self::CallEnded { .. } => "call-ended",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Renegotiate { .. } => "renegotiate",
            Self::BotJoin { .. } => "bot-join",
            Self::BotLeave { .. } => "bot-leave",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_browser_call_initiate() {
        let text = r#"{"type":"call-initiate","targetCode":"222","callerCode":"111","offer":{"type":"offer","sdp":"v=0\r\n"}}"#;
        let msg = ClientMessage::from_json(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CallInitiate {
                target_code: "222".into(),
                caller_code: "111".into(),
                offer: SessionDescription::offer("v=0\r\n"),
            }
        );
    }

    #[test]
    fn test_parse_ice_candidate_from_browser() {
        let text = r#"{"type":"ice-candidate","targetCode":"222","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#;
        match ClientMessage::from_json(text).unwrap() {
            ClientMessage::IceCandidate { candidate, target_code } => {
                assert_eq!(target_code, "222");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_server_message_shapes() {
        let incoming = ServerMessage::IncomingCall {
            caller_code: "111".into(),
            offer: SessionDescription::offer("o"),
            call_id: Some("c1".into()),
        };
        assert_eq!(
            serde_json::to_value(&incoming).unwrap(),
            json!({"type":"incoming-call","callerCode":"111","offer":{"type":"offer","sdp":"o"},"callId":"c1"})
        );

        let leave = ServerMessage::BotLeave {
            codes: vec!["1".into(), "2".into()],
        };
        assert_eq!(
            serde_json::to_value(&leave).unwrap(),
            json!({"type":"bot-leave","codes":["1","2"]})
        );

        let ended = ServerMessage::CallEnded { from_code: "111".into() };
        assert_eq!(
            ended.to_json().unwrap(),
            r#"{"type":"call-ended","fromCode":"111"}"#
        );
        assert_eq!(ended.kind(), "call-ended");
    }

    #[test]
    fn test_incoming_call_without_call_id() {
        let text = r#"{"type":"incoming-call","callerCode":"000","offer":{"type":"offer","sdp":"o"}}"#;
        match ServerMessage::from_json(text).unwrap() {
            ServerMessage::IncomingCall { call_id, .. } => assert!(call_id.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"hello"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"join"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }
}
