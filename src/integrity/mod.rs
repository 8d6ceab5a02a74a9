//! Integrity Verifier
//!
//! Gates the launch: the target executable is hashed with SHA-1 in
//! fixed-size chunks and the printable digest is compared with the
//! caller-supplied one by exact, case-sensitive string equality.
//!
//! Digests print as 40 uppercase hex characters, the format launchers of
//! this tool already pass in `/ExecutableHash`.

use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::core::error::IntegrityError;

/// Read size used while hashing the executable
pub const DIGEST_CHUNK_SIZE: usize = 256 * 1024;

/// Raw 160-bit digest
pub type DigestBytes = [u8; 20];

/// Printable form of a digest
pub fn digest_to_hex(digest: &DigestBytes) -> String {
    hex::encode_upper(digest)
}

/// Printable digest of an in-memory buffer
pub fn digest_hex(data: &[u8]) -> String {
    let digest: DigestBytes = Sha1::digest(data).into();
    digest_to_hex(&digest)
}

/// Compute the digest of a file's full contents
pub fn compute_file_digest(path: &Path) -> io::Result<DigestBytes> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// Printable digest of a file, or an empty string when it cannot be read.
///
/// An empty digest never equals a supplied one, so an unreadable executable
/// is treated as a mismatch.
pub fn file_digest_string(path: &Path) -> String {
    match compute_file_digest(path) {
        Ok(digest) => digest_to_hex(&digest),
        Err(e) => {
            tracing::warn!("Failed to hash {:?}: {}", path, e);
            String::new()
        }
    }
}

/// Verify an executable against the supplied digest.
///
/// Returns the computed digest on success.
pub fn verify_executable(path: &Path, expected: &str) -> Result<String, IntegrityError> {
    let actual = file_digest_string(path);
    if actual.is_empty() || actual != expected {
        return Err(IntegrityError::Mismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_empty_input() {
        assert_eq!(digest_hex(b""), "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709");
    }

    #[test]
    fn test_abc() {
        assert_eq!(digest_hex(b"abc"), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn test_two_block_message() {
        let input = b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq";
        assert_eq!(digest_hex(input), "84983E441C3BD26EBAAE4AA1F95129E5E54670F1");
    }

    #[test]
    fn test_tail_lengths_around_length_field() {
        // 55 bytes pads within one block, 56 needs a second block
        assert_eq!(digest_hex(&[b'a'; 55]), "C1C8BBDC22796E28C0E15163D20899B65621D65A");
        assert_eq!(digest_hex(&[b'a'; 56]), "C2DB330F6083854C99D4B5BFB6E8F29F201BE699");
    }

    #[test]
    fn test_one_million_a_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let chunk = [b'a'; 1000];
        for _ in 0..1000 {
            file.write_all(&chunk).unwrap();
        }

        let digest = compute_file_digest(file.path()).unwrap();
        assert_eq!(digest_to_hex(&digest), "34AA973CD4C4DAA4F61EEB2BDBAD27316534016F");
    }

    #[test]
    fn test_file_larger_than_chunk() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..DIGEST_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        let digest = compute_file_digest(file.path()).unwrap();
        assert_eq!(digest_to_hex(&digest), digest_hex(&data));
    }

    #[test]
    fn test_verify_accepts_exact_match() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let result = verify_executable(file.path(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert_eq!(result.unwrap(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn test_verify_is_case_sensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let result = verify_executable(file.path(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(matches!(result, Err(IntegrityError::Mismatch { .. })));
    }

    #[test]
    fn test_missing_file_yields_empty_digest_and_mismatch() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.exe");

        assert_eq!(file_digest_string(&missing), "");
        match verify_executable(&missing, "") {
            Err(IntegrityError::Mismatch { actual, .. }) => assert!(actual.is_empty()),
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Splitting the input at any point must not change the digest
        #[test]
        fn chunked_update_matches_one_shot(
            data in proptest::collection::vec(any::<u8>(), 0..600),
            split in 0usize..600
        ) {
            let split = split.min(data.len());
            let mut hasher = Sha1::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            let digest: DigestBytes = hasher.finalize().into();
            prop_assert_eq!(digest_to_hex(&digest), digest_hex(&data));
        }

        #[test]
        fn printable_digest_is_forty_uppercase_hex(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            let text = digest_hex(&data);
            prop_assert_eq!(text.len(), 40);
            prop_assert!(text.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }
}
