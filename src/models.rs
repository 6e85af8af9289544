use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Network identity of a peer. Equality and hashing cover `(ip, port)` only;
/// the display name is advertisement, not identity.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
    pub name: Option<String>,
}

impl PeerAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            name: None,
        }
    }

    pub fn named(ip: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            name: Some(name.into()),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One directory entry: a file offered by one owner. Two records with the
/// same hash but different owners are distinct entries (replication).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRecord {
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub owner: PeerAddress,
}

impl FileRecord {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        file_hash: impl Into<String>,
        owner: PeerAddress,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            file_hash: file_hash.into(),
            owner,
        }
    }
}

/// Who may see and fetch a shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private(HashSet<PeerAddress>),
}

impl Visibility {
    pub fn allows(&self, requester: &PeerAddress) -> bool {
        match self {
            Visibility::Public => true,
            Visibility::Private(allowed) => allowed.contains(requester),
        }
    }
}

/// One contiguous byte range of a file; the unit of transfer and retry.
/// `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

pub fn chunk_count(file_size: u64, chunk_size: u64) -> u32 {
    file_size.div_ceil(chunk_size) as u32
}

/// Deterministic split of `[0, file_size)` into chunks of `chunk_size`
/// bytes; only the last chunk may be shorter.
pub fn chunk_specs(file_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    let mut specs = vec![];
    let mut index = 0_u32;
    let mut start = 0_u64;
    while start < file_size {
        let end = (start + chunk_size - 1).min(file_size - 1);
        specs.push(ChunkSpec { index, start, end });
        start = end + 1;
        index += 1;
    }
    specs
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::models::{chunk_count, chunk_specs, PeerAddress, Visibility};

    #[test]
    fn peer_address_identity_ignores_name() {
        let plain = PeerAddress::new("10.0.0.1", 9000);
        let named = PeerAddress::named("10.0.0.1", 9000, "alice");
        assert_eq!(plain, named);
        let mut set = HashSet::new();
        set.insert(plain);
        assert!(set.contains(&named));
    }

    #[test]
    fn chunk_specs_cover_file_exactly() {
        for (file_size, chunk_size) in [
            (1_u64, 1_u64),
            (10, 3),
            (10, 10),
            (10, 4),
            (5 * 1024 * 1024, 2 * 1024 * 1024),
            (7, 100),
        ] {
            let specs = chunk_specs(file_size, chunk_size);
            assert_eq!(specs.len() as u32, chunk_count(file_size, chunk_size));
            // Contiguous, non-overlapping, starting at zero.
            let mut expected_start = 0_u64;
            for (i, spec) in specs.iter().enumerate() {
                assert_eq!(spec.index as usize, i);
                assert_eq!(spec.start, expected_start);
                assert!(spec.end >= spec.start);
                expected_start = spec.end + 1;
            }
            // Cover exactly [0, file_size).
            assert_eq!(expected_start, file_size);
            // Only the last chunk may be short.
            for spec in &specs[..specs.len() - 1] {
                assert_eq!(spec.len(), chunk_size);
            }
            assert!(specs[specs.len() - 1].len() <= chunk_size);
        }
    }

    #[test]
    fn chunks_written_in_any_order_reassemble_the_file() {
        use std::io::{Seek as _, SeekFrom, Write as _};

        let chunk_size = 7_u64;
        let data = (0..100_u8).collect::<Vec<u8>>();
        let specs = chunk_specs(data.len() as u64, chunk_size);

        // Write the chunks back-to-front into a preallocated file.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(data.len() as u64).unwrap();
        for spec in specs.iter().rev() {
            file.seek(SeekFrom::Start(spec.start)).unwrap();
            file.write_all(&data[spec.start as usize..=spec.end as usize])
                .unwrap();
        }
        file.flush().unwrap();

        assert_eq!(
            crate::utils::hash_file(file.path()).unwrap(),
            crate::utils::hash_bytes(&data)
        );
    }

    #[test]
    fn chunk_specs_empty_file_has_no_chunks() {
        assert!(chunk_specs(0, 4).is_empty());
        assert_eq!(chunk_count(0, 4), 0);
    }

    #[test]
    fn visibility_allows_works() {
        let alice = PeerAddress::new("10.0.0.1", 9000);
        let bob = PeerAddress::new("10.0.0.2", 9000);
        assert!(Visibility::Public.allows(&alice));
        let private = Visibility::Private(HashSet::from([alice.clone()]));
        assert!(private.allows(&alice));
        assert!(!private.allows(&bob));
    }
}
