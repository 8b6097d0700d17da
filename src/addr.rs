//! Peer address book.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::op::OpRecord;
use crate::type_alias::Tag;

/// Opaque identifier of a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrId(pub(crate) u64);

/// An expected message that arrived before its receive was posted.
pub(crate) struct EarlyMsg {
    pub tag: Tag,
    pub data: Vec<u8>,
}

/// Per-peer matching state: posted expected receives and early arrivals.
///
/// A posted receive never coexists with an early arrival of the same tag;
/// whichever side shows up second consumes the other immediately.
#[derive(Default)]
pub(crate) struct MatchLists {
    /// Posted expected receives, in post order.
    pub rxs: VecDeque<OpRecord>,

    /// Expected arrivals without a matching post yet, in arrival order.
    pub early: VecDeque<EarlyMsg>,
}

impl MatchLists {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rxs.is_empty() && self.early.is_empty()
    }
}

/// One peer known to the endpoint.
pub(crate) struct AddrEntry<C> {
    pub id: AddrId,

    /// Transport connection identity. Self addresses have none.
    pub conn: Option<C>,

    /// Peer URI.
    pub uri: String,

    /// Address materialized from an unexpected receive rather than a lookup.
    pub unexpected_origin: bool,

    pub is_self: bool,

    pub lists: Mutex<MatchLists>,
}

/// Address registry: id allocation plus a reverse map from connection
/// identities for incoming messages.
pub(crate) struct AddrBook<C> {
    entries: Mutex<HashMap<AddrId, Arc<AddrEntry<C>>, RandomState>>,
    by_conn: Mutex<HashMap<C, AddrId, RandomState>>,
    next: AtomicU64,
}

impl<C: Clone + Eq + Hash> AddrBook<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_hasher(RandomState::new())),
            by_conn: Mutex::new(HashMap::with_hasher(RandomState::new())),
            next: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> AddrId {
        AddrId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a connected peer. A connection identity that is already known
    /// resolves to its existing address.
    pub fn insert_connected(
        &self,
        conn: C,
        uri: String,
        unexpected_origin: bool,
    ) -> Arc<AddrEntry<C>> {
        let mut by_conn = self.by_conn.lock().unwrap();
        if let Some(id) = by_conn.get(&conn) {
            if let Some(entry) = self.entries.lock().unwrap().get(id) {
                return entry.clone();
            }
        }

        let id = self.next_id();
        let entry = Arc::new(AddrEntry {
            id,
            conn: Some(conn.clone()),
            uri,
            unexpected_origin,
            is_self: false,
            lists: Mutex::new(MatchLists::default()),
        });
        by_conn.insert(conn, id);
        self.entries.lock().unwrap().insert(id, entry.clone());
        entry
    }

    /// Insert an address for this process itself.
    pub fn insert_self(&self, uri: String) -> Arc<AddrEntry<C>> {
        let id = self.next_id();
        let entry = Arc::new(AddrEntry {
            id,
            conn: None,
            uri,
            unexpected_origin: false,
            is_self: true,
            lists: Mutex::new(MatchLists::default()),
        });
        self.entries.lock().unwrap().insert(id, entry.clone());
        entry
    }

    pub fn get(&self, id: AddrId) -> Option<Arc<AddrEntry<C>>> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub fn lookup_conn(&self, conn: &C) -> Option<Arc<AddrEntry<C>>> {
        let id = *self.by_conn.lock().unwrap().get(conn)?;
        self.get(id)
    }

    /// Free an address. Rejected while the peer still has posted receives
    /// or cached early arrivals.
    pub fn remove(&self, id: AddrId) -> Result<()> {
        let entry = self.get(id).ok_or(Error::InvalidParam)?;
        if !entry.lists.lock().unwrap().is_empty() {
            log::error!("freeing address {:?} with non-empty matching queues", id);
            return Err(Error::Protocol);
        }
        log::trace!(
            "freeing address {:?} (uri {:?}, unexpected origin: {})",
            id,
            entry.uri,
            entry.unexpected_origin
        );
        self.entries.lock().unwrap().remove(&id);
        if let Some(conn) = &entry.conn {
            self.by_conn.lock().unwrap().remove(conn);
        }
        Ok(())
    }

    /// Snapshot of all known addresses.
    pub fn snapshot(&self) -> Vec<Arc<AddrEntry<C>>> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}
