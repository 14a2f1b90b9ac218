//! Caller code ↔ live connection map.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::protocol::{CallerCode, ServerMessage};
use super::SignalingError;

/// Identifies one accepted signaling connection.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Human,
    Bot,
}

/// A live participant: its connection and the channel feeding its socket.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub conn: ConnectionId,
    pub kind: EndpointKind,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Endpoint {
    pub fn new(
        conn: ConnectionId,
        kind: EndpointKind,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self { conn, kind, sender }
    }

    /// Queue a message for this endpoint's socket task.
    pub fn deliver(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.sender
            .send(message)
            .map_err(|_| SignalingError::EndpointGone(self.conn))
    }
}

/// Outcome of `IdentityRegistry::register`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registration {
    /// Connection that previously held the code, if a different one did.
    pub superseded: Option<ConnectionId>,
    /// Codes the registering connection held before and released.
    pub released: Vec<CallerCode>,
}

/// Bidirectional map from caller code to the endpoint currently holding it.
///
/// Last registration wins. A connection holds at most one code at a time.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_code: HashMap<CallerCode, Endpoint>,
    by_conn: HashMap<ConnectionId, CallerCode>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: CallerCode, endpoint: Endpoint) -> Registration {
        let mut registration = Registration::default();

        if let Some(previous) = self.by_conn.remove(&endpoint.conn) {
            if previous != code {
                self.by_code.remove(&previous);
                registration.released.push(previous);
            }
        }

        let conn = endpoint.conn;
        if let Some(old) = self.by_code.insert(code.clone(), endpoint) {
            if old.conn != conn {
                self.by_conn.remove(&old.conn);
                registration.superseded = Some(old.conn);
                tracing::info!(code = %code, old = old.conn, new = conn, "Registration superseded");
            }
        }
        self.by_conn.insert(conn, code);
        registration
    }

    pub fn resolve(&self, code: &str) -> Option<&Endpoint> {
        self.by_code.get(code)
    }

    pub fn code_for(&self, conn: ConnectionId) -> Option<&CallerCode> {
        self.by_conn.get(&conn)
    }

    /// Remove every code pointing at `conn`; returns the removed codes.
    pub fn unregister(&mut self, conn: ConnectionId) -> Vec<CallerCode> {
        self.by_conn.remove(&conn);
        let codes: Vec<CallerCode> = self
            .by_code
            .iter()
            .filter(|(_, ep)| ep.conn == conn)
            .map(|(code, _)| code.clone())
            .collect();
        for code in &codes {
            self.by_code.remove(code);
        }
        codes
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(conn: ConnectionId) -> (Endpoint, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Endpoint::new(conn, EndpointKind::Human, tx), rx)
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = IdentityRegistry::new();
        let (first, _rx1) = endpoint(1);
        let (second, _rx2) = endpoint(2);

        assert_eq!(registry.register("A".into(), first), Registration::default());
        let reg = registry.register("A".into(), second);
        assert_eq!(reg.superseded, Some(1));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("A").unwrap().conn, 2);
        assert!(registry.code_for(1).is_none());
        // The orphaned connection going away must not remove the new mapping.
        assert!(registry.unregister(1).is_empty());
        assert_eq!(registry.resolve("A").unwrap().conn, 2);
    }

    #[test]
    fn test_reregistering_same_connection_is_idempotent() {
        let mut registry = IdentityRegistry::new();
        let (ep, _rx) = endpoint(1);
        registry.register("A".into(), ep.clone());
        assert_eq!(registry.register("A".into(), ep), Registration::default());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_connection_switching_codes_releases_old_code() {
        let mut registry = IdentityRegistry::new();
        let (ep, _rx) = endpoint(1);
        registry.register("A".into(), ep.clone());
        let reg = registry.register("B".into(), ep);
        assert_eq!(reg.released, vec!["A".to_string()]);
        assert!(registry.resolve("A").is_none());
        assert_eq!(registry.code_for(1).map(String::as_str), Some("B"));
    }

    #[test]
    fn test_unregister_removes_everything() {
        let mut registry = IdentityRegistry::new();
        let (a, _rxa) = endpoint(1);
        let (b, _rxb) = endpoint(2);
        registry.register("A".into(), a);
        registry.register("B".into(), b);

        assert_eq!(registry.unregister(1), vec!["A".to_string()]);
        assert!(registry.resolve("A").is_none());
        assert!(registry.code_for(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(1).is_empty());
    }

    #[test]
    fn test_deliver_to_closed_endpoint() {
        let (ep, rx) = endpoint(5);
        drop(rx);
        let err = ep
            .deliver(ServerMessage::Joined { code: "A".into() })
            .unwrap_err();
        assert!(matches!(err, SignalingError::EndpointGone(5)));
    }
}
