use std::fs;
use std::io::{self, Read as _};
use std::path::Path;

use sha2::{Digest, Sha256};

const HASH_BUF_LEN: usize = 1 << 16;

pub fn bytes_to_hex_encoding(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut current, b| {
        current.push_str(format!("{:02x}", b).as_str());
        current
    })
}

/// Streaming SHA-256 of a whole file, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::OpenOptions::new().read(true).open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; HASH_BUF_LEN];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(bytes_to_hex_encoding(hasher.finalize().as_slice()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    bytes_to_hex_encoding(hasher.finalize().as_slice())
}
