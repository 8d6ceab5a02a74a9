//! Obfuscation Channel
//!
//! Small payloads crossing shared memory or the telemetry wire are passed
//! through a keyed stream cipher and Base16-encoded so they are printable.
//! The key is usually a kernel object name that anything inspecting the
//! handle table can see: this keeps casual readers out, nothing more.

use thiserror::Error;

/// Errors decoding an obfuscated token
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObfuscationError {
    #[error("Invalid base16 token: {0}")]
    InvalidEncoding(String),
}

/// Build the 256-entry permutation table from the key.
///
/// An empty key behaves like a single zero byte.
fn permutation_table(key: &[u8]) -> [u8; 256] {
    let key: &[u8] = if key.is_empty() { &[0] } else { key };

    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = i as u8;
    }

    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(table[i]).wrapping_add(key[i % key.len()]);
        table.swap(i, j as usize);
    }
    table
}

/// Encrypt `buffer` in place. Applying it twice with the same key restores the input.
pub fn encrypt(key: &[u8], buffer: &mut [u8]) {
    let mut table = permutation_table(key);
    let mut i: u8 = 0;
    let mut j: u8 = 0;

    for byte in buffer.iter_mut() {
        i = i.wrapping_add(1);
        j = j.wrapping_add(table[i as usize]);
        table.swap(i as usize, j as usize);
        let keystream = table[table[i as usize].wrapping_add(table[j as usize]) as usize];
        *byte ^= keystream;
    }
}

/// Two uppercase hex characters per byte, most-significant nibble first
pub fn base16_encode(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Inverse of [`base16_encode`]; accepts either case
pub fn base16_decode(token: &str) -> Result<Vec<u8>, ObfuscationError> {
    hex::decode(token).map_err(|e| ObfuscationError::InvalidEncoding(e.to_string()))
}

/// Encrypt a copy of `payload` and encode it as a printable token
pub fn encrypt_and_encode(key: &str, payload: &[u8]) -> String {
    let mut buffer = payload.to_vec();
    encrypt(key.as_bytes(), &mut buffer);
    base16_encode(&buffer)
}

/// Decode a token produced by [`encrypt_and_encode`] and decrypt it
pub fn decode_and_decrypt(key: &str, token: &str) -> Result<Vec<u8>, ObfuscationError> {
    let mut buffer = base16_decode(token)?;
    encrypt(key.as_bytes(), &mut buffer);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_keystream_vectors() {
        let mut buffer = b"Plaintext".to_vec();
        encrypt(b"Key", &mut buffer);
        assert_eq!(base16_encode(&buffer), "BBF316E8D940AF0AD3");

        let mut buffer = b"Attack at dawn".to_vec();
        encrypt(b"Secret", &mut buffer);
        assert_eq!(base16_encode(&buffer), "45A01F645FC35B383552544B9BF5");
    }

    #[test]
    fn test_base16_nibble_order() {
        assert_eq!(base16_encode(&[0x00, 0x0F, 0xA5, 0xFF]), "000FA5FF");
        assert_eq!(base16_decode("000fa5FF").unwrap(), vec![0x00, 0x0F, 0xA5, 0xFF]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(base16_decode("ABC"), Err(ObfuscationError::InvalidEncoding(_))));
        assert!(base16_decode("ZZ").is_err());
    }

    #[test]
    fn test_token_round_trip_with_segment_name_key() {
        let key = "Local\\Watchdog-4242-Args";
        let token = encrypt_and_encode(key, b"hello");
        assert_eq!(token.len(), 10);
        assert_eq!(decode_and_decrypt(key, &token).unwrap(), b"hello");
        assert_ne!(decode_and_decrypt("other", &token).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_key_is_usable() {
        let mut buffer = b"data".to_vec();
        encrypt(b"", &mut buffer);
        assert_ne!(buffer, b"data");
        encrypt(b"", &mut buffer);
        assert_eq!(buffer, b"data");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn encrypt_is_self_inverse(
            key in proptest::collection::vec(any::<u8>(), 0..40),
            data in proptest::collection::vec(any::<u8>(), 0..256)
        ) {
            let mut buffer = data.clone();
            encrypt(&key, &mut buffer);
            encrypt(&key, &mut buffer);
            prop_assert_eq!(buffer, data);
        }
    }
}
