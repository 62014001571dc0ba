//! Content fingerprints: lowercase hex SHA-256 of the file bytes.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Stream `path` through SHA-256 without loading it into memory.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `source` to `dest` and fingerprint the bytes that were copied.
/// Returns the fingerprint and the byte count, which describe `dest` even
/// if `source` keeps changing afterwards.
pub fn copy_with_fingerprint(source: &Path, dest: &Path) -> std::io::Result<(String, u64)> {
    let mut reader = BufReader::with_capacity(READ_BUFFER, File::open(source)?);
    let mut writer = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    writer.sync_all()?;
    Ok((hex::encode(hasher.finalize()), copied))
}

pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
