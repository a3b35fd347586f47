use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::peer::{ConnId, PeerConnection};

/// Remote participants we are subscribed to, keyed by participant id.
///
/// Owned by the orchestrator and only touched from its scheduler loop, so
/// no locking.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    peers: HashMap<String, PeerConnection>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `DuplicateEvent` if the participant is already present;
    /// the existing entry is left untouched.
    pub fn add(&mut self, conn: PeerConnection) -> Result<()> {
        let participant = conn.participant().to_owned();
        if self.peers.contains_key(&participant) {
            return Err(Error::DuplicateEvent(participant));
        }
        self.peers.insert(participant, conn);
        Ok(())
    }

    pub fn remove(&mut self, participant: &str) -> Option<PeerConnection> {
        self.peers.remove(participant)
    }

    pub fn get(&self, participant: &str) -> Option<&PeerConnection> {
        self.peers.get(participant)
    }

    pub fn contains(&self, participant: &str) -> bool {
        self.peers.contains_key(participant)
    }

    pub fn find_by_conn_mut(&mut self, conn: ConnId) -> Option<&mut PeerConnection> {
        self.peers.values_mut().find(|peer| peer.id() == conn)
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerConnection> + '_ {
        self.peers.drain().map(|(_, conn)| conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testing::NullLink;
    use crate::peer::Role;

    fn conn(id: ConnId, participant: &str) -> PeerConnection {
        PeerConnection::new(id, participant, Role::Subscriber, Box::new(NullLink::default()))
    }

    #[test]
    fn add_is_a_noop_for_existing_keys() {
        let mut registry = ParticipantRegistry::new();
        registry.add(conn(1, "p2")).unwrap();
        let err = registry.add(conn(2, "p2")).unwrap_err();
        assert!(matches!(err, Error::DuplicateEvent(ref id) if id == "p2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("p2").unwrap().id(), 1);
    }

    #[test]
    fn remove_of_absent_key_changes_nothing() {
        let mut registry = ParticipantRegistry::new();
        registry.add(conn(1, "p2")).unwrap();
        assert!(registry.remove("p9").is_none());
        assert_eq!(registry.participants().collect::<Vec<_>>(), vec!["p2"]);
    }

    #[test]
    fn lookup_by_connection_id() {
        let mut registry = ParticipantRegistry::new();
        registry.add(conn(1, "p2")).unwrap();
        registry.add(conn(2, "p3")).unwrap();
        assert_eq!(registry.find_by_conn_mut(2).unwrap().participant(), "p3");
        assert!(registry.find_by_conn_mut(3).is_none());
        assert_eq!(registry.drain().count(), 2);
        assert!(registry.is_empty());
    }
}
