use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::codec::ProcFn;
use crate::error::{Error, Result};
use crate::type_alias::FnId;

/// Encode/decode routine pair stored for a registered function.
#[derive(Clone)]
pub(crate) struct ProcPair {
    pub enc: ProcFn,
    pub dec: ProcFn,
}

/// Map from call identifiers (hashed function names) to codec pairs.
pub(crate) struct Registry {
    map: DashMap<FnId, ProcPair, RandomState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Register `name` and return its identifier. A colliding identifier
    /// (including a re-registration of the same name) is a fatal error.
    pub fn register(&self, name: &str, enc: ProcFn, dec: ProcFn) -> Result<FnId> {
        let id = hash_name(name);
        match self.map.entry(id) {
            Entry::Occupied(_) => {
                log::error!("function id {:#x} ({:?}) is already registered", id, name);
                Err(Error::Protocol)
            }
            Entry::Vacant(slot) => {
                slot.insert(ProcPair { enc, dec });
                Ok(id)
            }
        }
    }

    /// Report whether `name` is registered, and under which identifier.
    pub fn registered(&self, name: &str) -> Option<FnId> {
        let id = hash_name(name);
        self.map.contains_key(&id).then_some(id)
    }

    /// Fetch the codec pair for an identifier.
    pub fn lookup(&self, id: FnId) -> Option<ProcPair> {
        self.map.get(&id).map(|entry| entry.value().clone())
    }
}

/// djb-style string hash, stable across processes so both sides derive the
/// same identifier from a function name.
fn hash_name(name: &str) -> FnId {
    name.bytes().fold(5381u32, |hash, byte| {
        hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte as u32)
    })
}
