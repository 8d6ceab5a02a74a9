//! Hidden launch arguments
//!
//! Before the child is resumed the supervisor writes four little-endian
//! words `{byte count, supervisor pid, child pid, nonce}` into a segment named
//! after the child's pid. The words are encrypted with the segment name as the
//! key, Base16-encoded and NUL-terminated. The nonce also travels on the
//! command line as `"wseed <nonce>"` so the child can check it owns the
//! segment it found.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::shared_memory::{SharedMemory, SharedMemoryError};
use crate::obfuscation;

/// Size of the launch-args segment
pub const LAUNCH_ARGS_SEGMENT_SIZE: usize = 4096;

/// Encoded length of [`HiddenLaunchArgs`] before encryption
pub const HIDDEN_ARGS_LEN: usize = 16;

/// Prefix of the command-line token carrying the nonce
pub const SEED_ARG_PREFIX: &str = "wseed ";

/// Parameters handed to the child out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenLaunchArgs {
    pub supervisor_pid: u32,
    pub child_pid: u32,
    pub nonce: u32,
}

impl HiddenLaunchArgs {
    pub fn new(supervisor_pid: u32, child_pid: u32, nonce: u32) -> Self {
        Self {
            supervisor_pid,
            child_pid,
            nonce,
        }
    }

    pub fn to_bytes(&self) -> [u8; HIDDEN_ARGS_LEN] {
        let mut out = [0u8; HIDDEN_ARGS_LEN];
        out[0..4].copy_from_slice(&(HIDDEN_ARGS_LEN as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.supervisor_pid.to_le_bytes());
        out[8..12].copy_from_slice(&self.child_pid.to_le_bytes());
        out[12..16].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SharedMemoryError> {
        if bytes.len() < HIDDEN_ARGS_LEN {
            return Err(SharedMemoryError::InvalidData(format!(
                "launch args are {} bytes, expected {}",
                bytes.len(),
                HIDDEN_ARGS_LEN
            )));
        }

        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let byte_count = word(0);
        if byte_count as usize != HIDDEN_ARGS_LEN {
            return Err(SharedMemoryError::InvalidData(format!(
                "launch args byte count is {}",
                byte_count
            )));
        }

        Ok(Self {
            supervisor_pid: word(4),
            child_pid: word(8),
            nonce: word(12),
        })
    }

    /// Encrypt and encode with `key`
    pub fn encode(&self, key: &str) -> String {
        obfuscation::encrypt_and_encode(key, &self.to_bytes())
    }

    pub fn decode(key: &str, token: &str) -> Result<Self, SharedMemoryError> {
        let bytes = obfuscation::decode_and_decrypt(key, token)
            .map_err(|e| SharedMemoryError::InvalidData(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Write the encoded token into `segment`, keyed by the segment's name
    pub fn write_to(&self, segment: &dyn SharedMemory) -> Result<(), SharedMemoryError> {
        let mut token = self.encode(segment.name()).into_bytes();
        token.push(0);

        if token.len() > segment.size() {
            return Err(SharedMemoryError::WriteFailed(format!(
                "token of {} bytes does not fit segment {}",
                token.len(),
                segment.name()
            )));
        }
        segment.write(0, &token)
    }

    /// Read and decode the token from `segment`
    pub fn read_from(segment: &dyn SharedMemory) -> Result<Self, SharedMemoryError> {
        let raw = segment.read(0, segment.size())?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let token = std::str::from_utf8(&raw[..end])
            .map_err(|e| SharedMemoryError::InvalidData(e.to_string()))?;

        if token.is_empty() {
            return Err(SharedMemoryError::InvalidData(format!(
                "segment {} holds no launch args",
                segment.name()
            )));
        }
        Self::decode(segment.name(), token)
    }
}

/// Draw a nonce from a generator seeded with the launch time and our pid
pub fn generate_nonce() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seed = nanos ^ ((std::process::id() as u64) << 32);
    StdRng::seed_from_u64(seed).gen()
}

/// `wseed <nonce>`
pub fn seed_argument(nonce: u32) -> String {
    format!("{}{}", SEED_ARG_PREFIX, nonce)
}

/// Parse a single `wseed <nonce>` argument
pub fn parse_seed_argument(arg: &str) -> Option<u32> {
    arg.trim()
        .strip_prefix(SEED_ARG_PREFIX)
        .and_then(|rest| rest.trim().parse().ok())
}

/// Find the nonce among already-split process arguments
pub fn find_seed<I, S>(args: I) -> Option<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().find_map(|a| parse_seed_argument(a.as_ref()))
}

/// Command line for the child: `"<exe>" "wseed <nonce>" <args>`
pub fn build_command_line(executable: &Path, nonce: u32, args: &str) -> String {
    let mut line = format!("\"{}\" \"{}\"", executable.display(), seed_argument(nonce));
    if !args.is_empty() {
        line.push(' ');
        line.push_str(args);
    }
    line
}
