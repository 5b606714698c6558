//! Cluster roster: current voting members and tombstoned IDs.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::transport::PeerClient;

/// One member of the raft group. The transport handle is absent for the
/// local node.
#[derive(Clone)]
pub struct Member {
    pub id: u64,
    pub addr: String,
    pub(crate) client: Option<PeerClient>,
}

#[derive(Default)]
struct Roster {
    members: HashMap<u64, Member>,
    removed: HashSet<u64>,
}

/// Membership view shared between the driver (sole writer) and RPC
/// handlers (concurrent readers).
#[derive(Default)]
pub struct Cluster {
    roster: RwLock<Roster>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member. An ID that was removed during the cluster's
    /// lifetime is never re-admitted.
    pub fn add_member(&self, member: Member) -> Result<()> {
        let mut roster = self.roster.write().unwrap();
        if roster.removed.contains(&member.id) {
            return Err(Error::IdRemoved);
        }
        roster.members.insert(member.id, member);
        Ok(())
    }

    /// Moves the ID to the tombstone set and drops its transport handle.
    pub fn remove_member(&self, id: u64) -> Result<()> {
        let mut roster = self.roster.write().unwrap();
        if roster.members.remove(&id).is_none() {
            return Err(Error::IdNotFound);
        }
        roster.removed.insert(id);
        Ok(())
    }

    pub fn get_member(&self, id: u64) -> Option<Member> {
        self.roster.read().unwrap().members.get(&id).cloned()
    }

    pub fn is_id_removed(&self, id: u64) -> bool {
        self.roster.read().unwrap().removed.contains(&id)
    }

    /// Snapshot copy of the current membership.
    pub fn members(&self) -> HashMap<u64, Member> {
        self.roster.read().unwrap().members.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64) -> Member {
        Member {
            id,
            addr: format!("127.0.0.1:{}", 4000 + id),
            client: None,
        }
    }

    #[test]
    fn add_and_get() {
        let cluster = Cluster::new();
        cluster.add_member(member(1)).unwrap();
        let got = cluster.get_member(1).unwrap();
        assert_eq!(got.addr, "127.0.0.1:4001");
        assert!(cluster.get_member(2).is_none());
    }

    #[test]
    fn removed_id_is_tombstoned() {
        let cluster = Cluster::new();
        cluster.add_member(member(1)).unwrap();
        cluster.remove_member(1).unwrap();

        assert!(cluster.is_id_removed(1));
        assert!(cluster.get_member(1).is_none());
        assert!(matches!(cluster.add_member(member(1)), Err(Error::IdRemoved)));
    }

    #[test]
    fn remove_unknown_member_fails() {
        let cluster = Cluster::new();
        assert!(matches!(cluster.remove_member(9), Err(Error::IdNotFound)));
    }

    #[test]
    fn members_returns_a_snapshot() {
        let cluster = Cluster::new();
        cluster.add_member(member(1)).unwrap();
        let snapshot = cluster.members();

        cluster.add_member(member(2)).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(cluster.members().len(), 2);
    }
}
