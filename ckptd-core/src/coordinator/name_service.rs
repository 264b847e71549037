use ahash::AHashMap;

use crate::protocol::NsId;

/// Coordinator-resident key-value registry used by workers to rendezvous at
/// restart and to elect leaders for shared resources.
///
/// Entries live for the lifetime of one restart group; `clear` wipes them at
/// group teardown.
#[derive(Debug, Default)]
pub struct NameService {
    entries: AHashMap<NsId, AHashMap<Vec<u8>, Vec<u8>>>,
    next_unique_id: AHashMap<NsId, u64>,
}

impl NameService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key -> value` in `nsid`. When several workers register the
    /// same key, the smallest value bytes win; callers that encode ordered
    /// identifiers big-endian get a deterministic election out of this.
    pub fn register(&mut self, nsid: NsId, key: Vec<u8>, value: Vec<u8>) {
        let ns = self.entries.entry(nsid).or_default();
        match ns.get_mut(&key) {
            Some(existing) => {
                if value < *existing {
                    *existing = value;
                }
            }
            None => {
                ns.insert(key, value);
            }
        }
    }

    pub fn query(&self, nsid: &NsId, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .get(nsid)
            .and_then(|ns| ns.get(key))
            .map(Vec::as_slice)
    }

    /// Allocate `span` consecutive ids in `nsid` and return the first.
    /// Ids start at 1 and are monotonically increasing per namespace.
    pub fn get_unique_ids(&mut self, nsid: NsId, span: u32) -> u64 {
        let span = span.max(1) as u64;
        let next = self.next_unique_id.entry(nsid).or_insert(1);
        let base = *next;
        *next += span;
        base
    }

    pub fn entry_count(&self, nsid: &NsId) -> usize {
        self.entries.get(nsid).map(|m| m.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_unique_id.clear();
    }
}
