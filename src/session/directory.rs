//! Identity bookkeeping: who we are, and who the one in-progress call is
//! with. The local identifier is assigned at startup and stays stable for
//! the process lifetime; the peer identifier exists only while a call is
//! pending or active.

use crate::signaling::SignalingMessage;

#[derive(Debug, Clone)]
pub struct CallDirectory {
    local: String,
    peer: Option<String>,
}

impl CallDirectory {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            peer: None,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn set_peer(&mut self, peer: impl Into<String>) {
        self.peer = Some(peer.into());
    }

    pub fn clear_peer(&mut self) {
        self.peer = None;
    }

    /// Whether an inbound message is addressed to us. Messages without a
    /// target were routed here by the relay and are accepted as ours.
    pub fn is_for_us(&self, message: &SignalingMessage) -> bool {
        message
            .target
            .as_deref()
            .map_or(true, |target| target == self.local)
    }

    /// Whether an inbound message comes from the current call peer.
    pub fn is_from_peer(&self, message: &SignalingMessage) -> bool {
        match (self.peer.as_deref(), message.name.as_deref()) {
            (Some(peer), Some(name)) => peer == name,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peer_lifecycle() {
        let mut directory = CallDirectory::new("alice");
        assert_eq!(directory.local_name(), "alice");
        assert_eq!(directory.peer(), None);

        directory.set_peer("bob");
        assert_eq!(directory.peer(), Some("bob"));

        directory.clear_peer();
        assert_eq!(directory.peer(), None);
    }

    #[test]
    fn test_routing_checks() {
        let mut directory = CallDirectory::new("alice");
        directory.set_peer("bob");

        let from_bob = SignalingMessage::end_call("bob", "alice");
        let from_carol = SignalingMessage::end_call("carol", "alice");
        let for_other = SignalingMessage::end_call("bob", "dave");

        assert!(directory.is_from_peer(&from_bob));
        assert!(!directory.is_from_peer(&from_carol));
        assert!(directory.is_for_us(&from_bob));
        assert!(!directory.is_for_us(&for_other));

        // Untargeted messages were routed here by the relay.
        let untargeted = SignalingMessage {
            target: None,
            ..SignalingMessage::ice_candidate("bob", "alice", json!({"candidate": "c"}))
        };
        assert!(directory.is_for_us(&untargeted));
    }

    #[test]
    fn test_no_peer_means_nothing_matches() {
        let directory = CallDirectory::new("alice");
        let message = SignalingMessage::end_call("bob", "alice");
        assert!(!directory.is_from_peer(&message));
    }
}
