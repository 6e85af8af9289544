use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use crate::models::{FileRecord, Visibility};

/// A file this node offers: its directory record, the staged copy on disk
/// and who may fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub record: FileRecord,
    pub path: PathBuf,
    pub visibility: Visibility,
}

/// Why a chunk request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServeRefusal {
    #[error("file not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
}

/// The node's own shares, keyed by file name. Chunk serving resolves by
/// content hash across both public and private entries.
#[derive(Debug, Default)]
pub struct ShareStore {
    files: Mutex<HashMap<String, SharedFile>>,
}

impl ShareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file: SharedFile) {
        self.files
            .lock()
            .unwrap()
            .insert(file.record.file_name.clone(), file);
    }

    pub fn remove(&self, file_name: &str) -> Option<SharedFile> {
        self.files.lock().unwrap().remove(file_name)
    }

    pub fn get(&self, file_name: &str) -> Option<SharedFile> {
        self.files.lock().unwrap().get(file_name).cloned()
    }

    pub fn by_hash(&self, file_hash: &str) -> Option<SharedFile> {
        self.files
            .lock()
            .unwrap()
            .values()
            .find(|file| file.record.file_hash == file_hash)
            .cloned()
    }

    /// Resolve a chunk request against both public and private shares. The
    /// requester is identified by the address the secure channel attests;
    /// for a private share it must appear in the allowed-peer set.
    pub fn authorize(
        &self,
        file_hash: &str,
        requester_ip: &str,
    ) -> Result<SharedFile, ServeRefusal> {
        let file = self.by_hash(file_hash).ok_or(ServeRefusal::NotFound)?;
        match &file.visibility {
            Visibility::Public => Ok(file),
            Visibility::Private(allowed) => {
                if allowed.iter().any(|peer| peer.ip == requester_ip) {
                    Ok(file)
                } else {
                    Err(ServeRefusal::AccessDenied)
                }
            }
        }
    }

    pub fn all(&self) -> Vec<SharedFile> {
        self.files.lock().unwrap().values().cloned().collect()
    }
}
