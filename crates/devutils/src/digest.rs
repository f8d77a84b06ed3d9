use std::{
    fmt::Write,
    fs::File,
    io::{self, Read},
    path::Path,
};

use anyhow::{Context, Error};
use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of a whole file, as a lowercase hex string.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String, Error> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("Failed to open '{}'", path.as_ref().display()))?;
    sha256_reader(file)
}

/// Computes the SHA-256 digest of everything a reader yields, as a lowercase
/// hex string.
pub fn sha256_reader(mut reader: impl Read) -> Result<String, Error> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).context("Failed to read data for digest")?;
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_reader() {
        // Well-known digest of the empty input
        assert_eq!(
            sha256_reader(io::empty()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_reader("abc".as_bytes()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
