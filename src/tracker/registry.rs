use std::collections::{HashMap, HashSet};

use crate::models::{FileRecord, PeerAddress};

/// In-memory directory of live peers and the files they offer.
///
/// Invariant: records whose owner is no longer in `known_peers` are never
/// served; the liveness sweep prunes them via [`TrackerDirectory::retain_alive`].
#[derive(Debug, Default)]
pub struct TrackerDirectory {
    known_peers: HashSet<PeerAddress>,
    /// fileName -> records offered under that name, one per owner.
    public_files: HashMap<String, HashSet<FileRecord>>,
    /// private record -> peers allowed to see and fetch it.
    private_files: HashMap<FileRecord, HashSet<PeerAddress>>,
}

impl TrackerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the peer and hand back everything visible to it.
    pub fn register(&mut self, peer: PeerAddress) -> Vec<FileRecord> {
        self.known_peers.insert(peer.clone());
        self.visible_to(&peer)
    }

    pub fn share_public(&mut self, records: Vec<FileRecord>) {
        for record in records {
            self.public_files
                .entry(record.file_name.clone())
                .or_default()
                .insert(record);
        }
    }

    pub fn share_private(&mut self, record: FileRecord, allowed: HashSet<PeerAddress>) {
        self.private_files.entry(record).or_default().extend(allowed);
    }

    /// Remove the exact-match record; an emptied name bucket is dropped.
    pub fn unshare(&mut self, record: &FileRecord) {
        if let Some(bucket) = self.public_files.get_mut(&record.file_name) {
            bucket.remove(record);
            if bucket.is_empty() {
                self.public_files.remove(&record.file_name);
            }
        }
        self.private_files.remove(record);
    }

    /// Case-insensitive substring match on file name, deduplicated by
    /// `(fileName, owner)`. Private records only match for an authorized
    /// requester.
    pub fn query(&self, keyword: &str, requester: Option<&PeerAddress>) -> Vec<FileRecord> {
        let needle = keyword.to_lowercase();
        let mut seen: HashSet<(String, PeerAddress)> = HashSet::new();
        let mut hits = vec![];
        for record in self.public_files.values().flatten() {
            if self.serveable(record) && record.file_name.to_lowercase().contains(&needle) {
                let key = (record.file_name.clone(), record.owner.clone());
                if seen.insert(key) {
                    hits.push(record.clone());
                }
            }
        }
        if let Some(requester) = requester {
            for (record, allowed) in self.private_files.iter() {
                if self.serveable(record)
                    && allowed.contains(requester)
                    && record.file_name.to_lowercase().contains(&needle)
                {
                    let key = (record.file_name.clone(), record.owner.clone());
                    if seen.insert(key) {
                        hits.push(record.clone());
                    }
                }
            }
        }
        hits
    }

    /// Full recomputation of everything `peer` may see: all public records
    /// plus private records granting it access.
    pub fn visible_to(&self, peer: &PeerAddress) -> Vec<FileRecord> {
        let mut records = vec![];
        for record in self.public_files.values().flatten() {
            if self.serveable(record) {
                records.push(record.clone());
            }
        }
        for (record, allowed) in self.private_files.iter() {
            if self.serveable(record) && allowed.contains(peer) {
                records.push(record.clone());
            }
        }
        records
    }

    /// Owners offering the given content hash, restricted to records the
    /// requester may see.
    pub fn peers_for(&self, file_hash: &str, requester: &PeerAddress) -> Vec<PeerAddress> {
        let mut owners: HashSet<PeerAddress> = HashSet::new();
        for record in self.public_files.values().flatten() {
            if self.serveable(record) && record.file_hash == file_hash {
                owners.insert(record.owner.clone());
            }
        }
        for (record, allowed) in self.private_files.iter() {
            if self.serveable(record)
                && record.file_hash == file_hash
                && allowed.contains(requester)
            {
                owners.insert(record.owner.clone());
            }
        }
        owners.into_iter().collect()
    }

    pub fn known_peers(&self) -> Vec<PeerAddress> {
        self.known_peers.iter().cloned().collect()
    }

    /// The responding set becomes the new known-peer set; file records
    /// owned by anyone else are pruned, as are stale grant entries.
    pub fn retain_alive(&mut self, alive: &HashSet<PeerAddress>) {
        self.known_peers = alive.clone();
        self.public_files.retain(|_name, bucket| {
            bucket.retain(|record| alive.contains(&record.owner));
            !bucket.is_empty()
        });
        self.private_files.retain(|record, allowed| {
            if !alive.contains(&record.owner) {
                return false;
            }
            allowed.retain(|peer| alive.contains(peer));
            true
        });
    }

    fn serveable(&self, record: &FileRecord) -> bool {
        self.known_peers.contains(&record.owner)
    }
}
