//! Crash relay record
//!
//! Fixed 272-byte layout written by the target into the crash segment before
//! it signals the crash event. All fields are little-endian.
//!
//! | offset | size | field                                          |
//! |--------|------|------------------------------------------------|
//! | 0      | 4    | faulting thread id                             |
//! | 4      | 4    | reserved, zero                                 |
//! | 8      | 8    | exception pointers, valid in the target only   |
//! | 16     | 256  | NUL-terminated path of a dump the target wrote |

use std::path::{Path, PathBuf};

use super::shared_memory::{SharedMemory, SharedMemoryError};

/// Size of the crash segment and of an encoded record
pub const CRASH_RECORD_SIZE: usize = 272;

/// Room for the dump path including its terminator
pub const DUMP_PATH_CAPACITY: usize = 256;

const DUMP_PATH_OFFSET: usize = 16;

/// Fault description relayed from the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    /// Faulting thread, zero when the target wrote its own dump
    pub thread_id: u32,
    /// Address of the exception pointers in the target's address space
    pub exception_pointers: u64,
    /// Dump the target already wrote, if any
    pub dump_path: Option<PathBuf>,
}

impl CrashRecord {
    /// Record describing a live fault for the supervisor to dump
    pub fn fault(thread_id: u32, exception_pointers: u64) -> Self {
        Self {
            thread_id,
            exception_pointers,
            dump_path: None,
        }
    }

    /// Record pointing at a dump the target wrote itself
    pub fn prewritten_dump(path: impl Into<PathBuf>) -> Self {
        Self {
            thread_id: 0,
            exception_pointers: 0,
            dump_path: Some(path.into()),
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; CRASH_RECORD_SIZE], SharedMemoryError> {
        let mut out = [0u8; CRASH_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.thread_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.exception_pointers.to_le_bytes());

        if let Some(ref path) = self.dump_path {
            let text = path.to_string_lossy();
            let bytes = text.as_bytes();
            if bytes.len() >= DUMP_PATH_CAPACITY {
                return Err(SharedMemoryError::WriteFailed(format!(
                    "dump path of {} bytes exceeds {}",
                    bytes.len(),
                    DUMP_PATH_CAPACITY - 1
                )));
            }
            out[DUMP_PATH_OFFSET..DUMP_PATH_OFFSET + bytes.len()].copy_from_slice(bytes);
        }

        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SharedMemoryError> {
        if bytes.len() < CRASH_RECORD_SIZE {
            return Err(SharedMemoryError::InvalidData(format!(
                "crash record is {} bytes, expected {}",
                bytes.len(),
                CRASH_RECORD_SIZE
            )));
        }

        let thread_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pointer = [0u8; 8];
        pointer.copy_from_slice(&bytes[8..16]);
        let exception_pointers = u64::from_le_bytes(pointer);

        let path_field = &bytes[DUMP_PATH_OFFSET..DUMP_PATH_OFFSET + DUMP_PATH_CAPACITY];
        let dump_path = match path_field.iter().position(|&b| b == 0) {
            Some(0) => None,
            Some(end) => Some(PathBuf::from(String::from_utf8_lossy(&path_field[..end]).to_string())),
            None => {
                return Err(SharedMemoryError::InvalidData(
                    "dump path is not terminated".to_string(),
                ))
            }
        };

        Ok(Self {
            thread_id,
            exception_pointers,
            dump_path,
        })
    }

    /// Dump to reuse verbatim instead of writing a new one.
    ///
    /// Only a record with no thread and no pointers qualifies, and only when
    /// the named file exists.
    pub fn reusable_dump(&self) -> Option<&Path> {
        if self.thread_id != 0 || self.exception_pointers != 0 {
            return None;
        }
        self.dump_path.as_deref().filter(|p| p.is_file())
    }

    pub fn write_to(&self, segment: &dyn SharedMemory) -> Result<(), SharedMemoryError> {
        segment.write(0, &self.to_bytes()?)
    }

    pub fn read_from(segment: &dyn SharedMemory) -> Result<Self, SharedMemoryError> {
        Self::from_bytes(&segment.read(0, CRASH_RECORD_SIZE)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::shared_memory::FileSharedMemory;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_fault_record_layout() {
        let record = CrashRecord::fault(0x1234, 0x0000_7FF6_0000_1000);
        let bytes = record.to_bytes().unwrap();

        assert_eq!(&bytes[0..4], &[0x34, 0x12, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &0x0000_7FF6_0000_1000u64.to_le_bytes());
        assert!(bytes[16..].iter().all(|&b| b == 0));
        assert_eq!(CrashRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_dump_path_round_trip() {
        let record = CrashRecord::prewritten_dump("C:\\Temp\\self.dmp");
        let bytes = record.to_bytes().unwrap();

        assert_eq!(&bytes[16..32], b"C:\\Temp\\self.dmp");
        assert_eq!(bytes[32], 0);
        assert_eq!(CrashRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_path_too_long() {
        let long = "x".repeat(DUMP_PATH_CAPACITY);
        assert!(CrashRecord::prewritten_dump(long).to_bytes().is_err());

        let fits = "x".repeat(DUMP_PATH_CAPACITY - 1);
        assert!(CrashRecord::prewritten_dump(fits).to_bytes().is_ok());
    }

    #[test]
    fn test_unterminated_path_rejected() {
        let mut bytes = [0u8; CRASH_RECORD_SIZE];
        for b in bytes[DUMP_PATH_OFFSET..].iter_mut() {
            *b = b'a';
        }
        assert!(CrashRecord::from_bytes(&bytes).is_err());
        assert!(CrashRecord::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn test_reuse_requires_existing_file() {
        let file = NamedTempFile::new().unwrap();
        let record = CrashRecord::prewritten_dump(file.path());
        assert_eq!(record.reusable_dump(), Some(file.path()));

        let missing = CrashRecord::prewritten_dump("/definitely/not/here.dmp");
        assert_eq!(missing.reusable_dump(), None);
    }

    #[test]
    fn test_reuse_requires_empty_fault_fields() {
        let file = NamedTempFile::new().unwrap();
        let mut record = CrashRecord::prewritten_dump(file.path());
        record.thread_id = 9;
        assert_eq!(record.reusable_dump(), None);

        let mut record = CrashRecord::prewritten_dump(file.path());
        record.exception_pointers = 1;
        assert_eq!(record.reusable_dump(), None);

        assert_eq!(CrashRecord::fault(0, 0).reusable_dump(), None);
    }

    #[test]
    fn test_segment_write_then_read() {
        let dir = TempDir::new().unwrap();
        let segment = FileSharedMemory::create_in(dir.path(), "crash", CRASH_RECORD_SIZE).unwrap();

        let record = CrashRecord::fault(77, 0xDEAD_BEEF);
        record.write_to(&segment).unwrap();
        assert_eq!(CrashRecord::read_from(&segment).unwrap(), record);
    }
}
