//! Peer registry: node id → address routing, self id, current leader, quorum.
//!
//! Only voting members live here; a learner is registered by the replication
//! tracker and joins the registry when it is promoted. Quorum size follows
//! the registry, so learners never count toward a majority.

use crate::error::Result;
use crate::types::{NodeAddr, NodeId, PeerMap};
use bytes::Bytes;
use parking_lot::Mutex;

/// Cluster routing table and leader bookkeeping for one node.
pub struct PeerRegistry {
    me: NodeId,
    inner: Mutex<Inner>,
}

struct Inner {
    peers: PeerMap,
    leader: Option<NodeId>,
}

impl PeerRegistry {
    pub fn new(peers: PeerMap, me: NodeId) -> Self {
        Self {
            me,
            inner: Mutex::new(Inner {
                peers,
                leader: None,
            }),
        }
    }

    pub fn me(&self) -> &NodeId {
        &self.me
    }

    pub fn is_me(&self, id: &NodeId) -> bool {
        *id == self.me
    }

    pub fn peers(&self) -> PeerMap {
        self.inner.lock().peers.clone()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.lock().peers.contains_key(id)
    }

    pub fn addr_of(&self, id: &NodeId) -> Option<NodeAddr> {
        self.inner.lock().peers.get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// Quorum size of the current configuration: ⌊N/2⌋ + 1.
    pub fn majority(&self) -> usize {
        self.inner.lock().peers.len() / 2 + 1
    }

    pub fn set_leader(&self, id: NodeId) {
        self.inner.lock().leader = Some(id);
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.lock().leader.clone()
    }

    pub fn leader_is_me(&self) -> bool {
        self.inner.lock().leader.as_ref() == Some(&self.me)
    }

    /// Admit a promoted learner into the routing table.
    pub fn add_peer(&self, id: NodeId, addr: NodeAddr) {
        self.inner.lock().peers.insert(id, addr);
    }

    /// Replace the whole configuration (membership change).
    pub fn replace(&self, peers: PeerMap) {
        self.inner.lock().peers = peers;
    }

    /// Replace the configuration from a serialized peer map carried by a
    /// ChangeConf entry.
    pub fn replace_from_bytes(&self, data: &[u8]) -> Result<()> {
        let peers = decode_peer_map(data)?;
        self.inner.lock().peers = peers;
        Ok(())
    }
}

/// Serialize a peer map for a ChangeConf entry payload.
pub fn encode_peer_map(peers: &PeerMap) -> Result<Bytes> {
    let encoded = bincode::serialize(peers)?;
    Ok(Bytes::from(encoded))
}

/// Decode a ChangeConf entry payload back into a peer map.
pub fn decode_peer_map(data: &[u8]) -> Result<PeerMap> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn registry(n: usize) -> PeerRegistry {
        let peers: PeerMap = (1..=n)
            .map(|i| {
                (
                    NodeId::new(format!("n{}", i)),
                    NodeAddr::new(format!("addr{}", i)),
                )
            })
            .collect();
        PeerRegistry::new(peers, NodeId::new("n1"))
    }

    #[test]
    fn test_majority() {
        assert_eq!(registry(1).majority(), 1);
        assert_eq!(registry(3).majority(), 2);
        assert_eq!(registry(4).majority(), 3);
        assert_eq!(registry(5).majority(), 3);
    }

    #[test]
    fn test_leader_tracking() {
        let reg = registry(3);
        assert_eq!(reg.leader(), None);
        assert!(!reg.leader_is_me());

        reg.set_leader(NodeId::new("n1"));
        assert!(reg.leader_is_me());

        reg.set_leader(NodeId::new("n2"));
        assert!(!reg.leader_is_me());
    }

    #[test]
    fn test_peer_map_codec_roundtrip() {
        let reg = registry(3);
        let encoded = encode_peer_map(&reg.peers()).unwrap();
        let decoded = decode_peer_map(&encoded).unwrap();
        assert_eq!(decoded, reg.peers());
    }

    #[test]
    fn test_replace_from_bytes() {
        let reg = registry(3);
        let mut smaller: PeerMap = HashMap::new();
        smaller.insert(NodeId::new("n1"), NodeAddr::new("addr1"));
        let encoded = encode_peer_map(&smaller).unwrap();

        reg.replace_from_bytes(&encoded).unwrap();
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.majority(), 1);
    }

    #[test]
    fn test_replace_from_garbage_fails() {
        let reg = registry(3);
        assert!(reg.replace_from_bytes(&[0xff, 0x01]).is_err());
        assert_eq!(reg.count(), 3);
    }
}
