//! Device-wide session index table
//!
//! Every in-flight handshake and every live keypair owns a random
//! 32-bit local index; inbound handshake responses and data packets are
//! demultiplexed to their peer through this table.

use std::collections::HashMap;
use std::sync::{RwLock, Weak};

use rand::Rng;

use crate::device::keypair::Keypair;
use crate::device::peer::Peer;

/// What a local index currently refers to
#[derive(Clone)]
pub enum IndexKind {
    /// An in-flight handshake
    Handshake,
    /// An established session
    Keypair(Weak<Keypair>),
}

#[derive(Clone)]
pub struct IndexEntry {
    pub peer: Weak<Peer>,
    pub kind: IndexKind,
}

#[derive(Default)]
pub struct IndexTable {
    entries: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    /// Allocate a fresh random index for a handshake
    pub fn new_index(&self, peer: Weak<Peer>) -> u32 {
        let mut entries = self.entries.write().expect("index table lock");
        loop {
            let index: u32 = rand::thread_rng().gen();
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(index) {
                slot.insert(IndexEntry {
                    peer,
                    kind: IndexKind::Handshake,
                });
                return index;
            }
        }
    }

    /// Re-point a handshake's index at the keypair it produced
    pub fn swap_to_keypair(&self, index: u32, keypair: Weak<Keypair>) {
        let mut entries = self.entries.write().expect("index table lock");
        if let Some(entry) = entries.get_mut(&index) {
            entry.kind = IndexKind::Keypair(keypair);
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.entries
            .read()
            .expect("index table lock")
            .get(&index)
            .cloned()
    }

    pub fn delete(&self, index: u32) {
        self.entries.write().expect("index table lock").remove(&index);
    }

    #[cfg(test)]
    pub fn contains(&self, index: u32) -> bool {
        self.entries.read().unwrap().contains_key(&index)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_indices_unique_and_present() {
        let table = IndexTable::default();
        let a = table.new_index(Weak::new());
        let b = table.new_index(Weak::new());

        assert_ne!(a, b);
        assert!(table.contains(a));
        assert!(table.contains(b));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_delete_removes_entry() {
        let table = IndexTable::default();
        let index = table.new_index(Weak::new());
        table.delete(index);
        assert!(table.lookup(index).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_swap_to_keypair_changes_kind() {
        let table = IndexTable::default();
        let index = table.new_index(Weak::new());
        table.swap_to_keypair(index, Weak::new());

        match table.lookup(index).unwrap().kind {
            IndexKind::Keypair(_) => {}
            IndexKind::Handshake => panic!("expected keypair entry"),
        }
    }
}
