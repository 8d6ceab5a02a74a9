//! Shared Memory Module
//!
//! Named, fixed-size byte segments shared between the supervisor and the
//! target. Two channels are built on top: hidden launch arguments and the
//! crash relay record.
//!
//! - Windows: named page-file backed mapping via CreateFileMappingW
//! - All platforms: file-backed segment for development and testing

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::utils::sanitize_object_name;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    #[error("Failed to create shared memory {0}")]
    CreateFailed(String),

    #[error("Failed to open shared memory: {0}")]
    OpenFailed(String),

    #[error("Shared memory {0} does not exist")]
    NotFound(String),

    #[error("Failed to map shared memory: {0}")]
    MapFailed(String),

    #[error("Failed to write to shared memory: {0}")]
    WriteFailed(String),

    #[error("Failed to read from shared memory: {0}")]
    ReadFailed(String),

    #[error("Access of {len} bytes at offset {offset} exceeds segment size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("Invalid segment contents: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named, fixed-size shared segment.
///
/// Access is unsynchronized: each side touches the segment in a disjoint
/// phase, writer first, then a signal, then the reader.
pub trait SharedMemory: Send + Sync {
    /// Object name the segment was created or opened with
    fn name(&self) -> &str;

    /// Segment size in bytes
    fn size(&self) -> usize;

    /// Copy `bytes` into the segment at `offset`
    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), SharedMemoryError>;

    /// Copy `len` bytes out of the segment starting at `offset`
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, SharedMemoryError>;

    /// Unmap and release the segment
    fn close(&mut self);

    /// Check if the segment is open
    fn is_open(&self) -> bool;
}

fn check_bounds(size: usize, offset: usize, len: usize) -> Result<(), SharedMemoryError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(SharedMemoryError::OutOfBounds { offset, len, size }),
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::ptr;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::Security::SECURITY_ATTRIBUTES;
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
        MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
    };

    /// Named mapping backed by the system paging file
    pub struct WindowsSharedMemory {
        name: String,
        size: usize,
        handle: Option<HANDLE>,
        view: Option<*mut u8>,
    }

    // SAFETY: the view is only touched through bounds-checked copies and the
    // handle is owned exclusively by this value
    unsafe impl Send for WindowsSharedMemory {}
    unsafe impl Sync for WindowsSharedMemory {}

    fn wide_name(name: &str) -> Vec<u16> {
        name.encode_utf16().chain(std::iter::once(0)).collect()
    }

    impl WindowsSharedMemory {
        /// Create (or attach to) a named mapping of `size` bytes
        pub fn create(name: &str, size: usize, inheritable: bool) -> Result<Self, SharedMemoryError> {
            let wide = wide_name(name);
            let attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: ptr::null_mut(),
                bInheritHandle: inheritable.into(),
            };

            let handle = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    Some(&attributes as *const _),
                    PAGE_READWRITE,
                    0,
                    size as u32,
                    PCWSTR(wide.as_ptr()),
                )
            }
            .map_err(|e| SharedMemoryError::CreateFailed(format!("{}: {}", name, e)))?;
            Self::map(name, size, handle)
        }

        /// Open a mapping that some other process already created
        pub fn open_existing(name: &str, size: usize) -> Result<Self, SharedMemoryError> {
            let wide = wide_name(name);
            let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(wide.as_ptr())) }
                .map_err(|_| SharedMemoryError::NotFound(name.to_string()))?;

            Self::map(name, size, handle)
        }

        fn map(name: &str, size: usize, handle: HANDLE) -> Result<Self, SharedMemoryError> {
            let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };

            if view.Value.is_null() {
                unsafe { CloseHandle(handle).ok() };
                return Err(SharedMemoryError::MapFailed(format!(
                    "MapViewOfFile returned null for {}",
                    name
                )));
            }

            Ok(Self {
                name: name.to_string(),
                size,
                handle: Some(handle),
                view: Some(view.Value as *mut u8),
            })
        }
    }

    impl SharedMemory for WindowsSharedMemory {
        fn name(&self) -> &str {
            &self.name
        }

        fn size(&self) -> usize {
            self.size
        }

        fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), SharedMemoryError> {
            let view = self.view.ok_or(SharedMemoryError::WriteFailed(
                "Shared memory not open".to_string(),
            ))?;
            check_bounds(self.size, offset, bytes.len())?;

            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), view.add(offset), bytes.len());
            }
            Ok(())
        }

        fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, SharedMemoryError> {
            let view = self.view.ok_or(SharedMemoryError::ReadFailed(
                "Shared memory not open".to_string(),
            ))?;
            check_bounds(self.size, offset, len)?;

            let mut out = vec![0u8; len];
            unsafe {
                ptr::copy_nonoverlapping(view.add(offset) as *const u8, out.as_mut_ptr(), len);
            }
            Ok(out)
        }

        fn close(&mut self) {
            if let Some(view) = self.view.take() {
                unsafe {
                    let _ = UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                        Value: view as *mut _,
                    });
                }
            }

            if let Some(handle) = self.handle.take() {
                unsafe {
                    let _ = CloseHandle(handle);
                }
            }
        }

        fn is_open(&self) -> bool {
            self.handle.is_some() && self.view.is_some()
        }
    }

    impl Drop for WindowsSharedMemory {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(windows)]
pub use windows_impl::WindowsSharedMemory;

// ============================================================================
// File-backed Implementation
// ============================================================================

mod file_impl {
    use super::*;
    use parking_lot::Mutex;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};

    /// File-backed segment. The object name maps to a file under a root
    /// directory, so any process that knows the root can open it.
    pub struct FileSharedMemory {
        name: String,
        size: usize,
        path: PathBuf,
        file: Option<Mutex<File>>,
        is_creator: bool,
    }

    impl FileSharedMemory {
        /// Location of the backing file for `name` under `root`
        pub fn segment_path(root: &Path, name: &str) -> PathBuf {
            root.join(format!("{}.segment", sanitize_object_name(name)))
        }

        /// Create a zero-filled segment, replacing any stale file
        pub fn create_in(root: &Path, name: &str, size: usize) -> Result<Self, SharedMemoryError> {
            std::fs::create_dir_all(root)
                .map_err(|e| SharedMemoryError::CreateFailed(format!("{}: {}", name, e)))?;
            let path = Self::segment_path(root, name);

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| SharedMemoryError::CreateFailed(format!("{}: {}", name, e)))?;

            file.set_len(size as u64)
                .map_err(|e| SharedMemoryError::CreateFailed(format!("{}: {}", name, e)))?;

            Ok(Self {
                name: name.to_string(),
                size,
                path,
                file: Some(Mutex::new(file)),
                is_creator: true,
            })
        }

        /// Open a segment some other process created
        pub fn open_in(root: &Path, name: &str, size: usize) -> Result<Self, SharedMemoryError> {
            let path = Self::segment_path(root, name);

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => SharedMemoryError::NotFound(name.to_string()),
                    _ => SharedMemoryError::OpenFailed(format!("{}: {}", name, e)),
                })?;

            let actual = file.metadata()?.len();
            if actual < size as u64 {
                return Err(SharedMemoryError::InvalidData(format!(
                    "{} is {} bytes, expected {}",
                    name, actual, size
                )));
            }

            Ok(Self {
                name: name.to_string(),
                size,
                path,
                file: Some(Mutex::new(file)),
                is_creator: false,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SharedMemory for FileSharedMemory {
        fn name(&self) -> &str {
            &self.name
        }

        fn size(&self) -> usize {
            self.size
        }

        fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), SharedMemoryError> {
            let file_mutex = self.file.as_ref().ok_or(SharedMemoryError::WriteFailed(
                "Shared memory not open".to_string(),
            ))?;
            check_bounds(self.size, offset, bytes.len())?;

            let mut file = file_mutex.lock();
            file.seek(SeekFrom::Start(offset as u64))
                .map_err(|e| SharedMemoryError::WriteFailed(e.to_string()))?;
            file.write_all(bytes)
                .map_err(|e| SharedMemoryError::WriteFailed(e.to_string()))?;
            file.sync_all()
                .map_err(|e| SharedMemoryError::WriteFailed(e.to_string()))?;

            Ok(())
        }

        fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, SharedMemoryError> {
            let file_mutex = self.file.as_ref().ok_or(SharedMemoryError::ReadFailed(
                "Shared memory not open".to_string(),
            ))?;
            check_bounds(self.size, offset, len)?;

            let mut file = file_mutex.lock();
            file.seek(SeekFrom::Start(offset as u64))
                .map_err(|e| SharedMemoryError::ReadFailed(e.to_string()))?;

            let mut bytes = vec![0u8; len];
            file.read_exact(&mut bytes)
                .map_err(|e| SharedMemoryError::ReadFailed(e.to_string()))?;

            Ok(bytes)
        }

        fn close(&mut self) {
            self.file = None;

            // Only delete the file if we created it
            if self.is_creator {
                let _ = std::fs::remove_file(&self.path);
            }

            self.is_creator = false;
        }

        fn is_open(&self) -> bool {
            self.file.is_some()
        }
    }

    impl Drop for FileSharedMemory {
        fn drop(&mut self) {
            self.close();
        }
    }
}

pub use file_impl::FileSharedMemory;

/// Directory holding file-backed segments, events and timers
pub fn default_object_root() -> PathBuf {
    std::env::temp_dir().join("watchdog-objects")
}

// ============================================================================
// Platform-agnostic factory functions
// ============================================================================

/// Open a segment that must already exist
#[cfg(windows)]
pub fn open_shared_memory(name: &str, size: usize) -> Result<Box<dyn SharedMemory>, SharedMemoryError> {
    Ok(Box::new(WindowsSharedMemory::open_existing(name, size)?))
}

#[cfg(not(windows))]
pub fn open_shared_memory(name: &str, size: usize) -> Result<Box<dyn SharedMemory>, SharedMemoryError> {
    Ok(Box::new(FileSharedMemory::open_in(&default_object_root(), name, size)?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bounds_check() {
        assert!(check_bounds(16, 0, 16).is_ok());
        assert!(check_bounds(16, 8, 8).is_ok());
        assert!(matches!(
            check_bounds(16, 8, 9),
            Err(SharedMemoryError::OutOfBounds { offset: 8, len: 9, size: 16 })
        ));
        assert!(check_bounds(16, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_file_segment_is_zero_filled() {
        let dir = TempDir::new().unwrap();
        let segment = FileSharedMemory::create_in(dir.path(), "Local\\Test-1-Args", 64).unwrap();

        assert_eq!(segment.size(), 64);
        assert_eq!(segment.read(0, 64).unwrap(), vec![0u8; 64]);
        assert!(segment.path().starts_with(dir.path()));
        assert!(!segment
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains('\\'));
    }

    #[test]
    fn test_file_segment_shared_between_handles() {
        let dir = TempDir::new().unwrap();
        let writer = FileSharedMemory::create_in(dir.path(), "seg", 32).unwrap();
        let reader = FileSharedMemory::open_in(dir.path(), "seg", 32).unwrap();

        writer.write(4, b"ping").unwrap();
        assert_eq!(reader.read(4, 4).unwrap(), b"ping");

        reader.write(0, b"ok").unwrap();
        assert_eq!(writer.read(0, 2).unwrap(), b"ok");
    }

    #[test]
    fn test_file_segment_rejects_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let segment = FileSharedMemory::create_in(dir.path(), "seg", 8).unwrap();

        assert!(matches!(
            segment.write(6, b"abc"),
            Err(SharedMemoryError::OutOfBounds { .. })
        ));
        assert!(segment.read(0, 9).is_err());
    }

    #[test]
    fn test_open_missing_segment() {
        let dir = TempDir::new().unwrap();
        let result = FileSharedMemory::open_in(dir.path(), "absent", 8);
        assert!(matches!(result, Err(SharedMemoryError::NotFound(name)) if name == "absent"));
    }

    #[test]
    fn test_open_undersized_segment() {
        let dir = TempDir::new().unwrap();
        let _small = FileSharedMemory::create_in(dir.path(), "small", 4).unwrap();
        let result = FileSharedMemory::open_in(dir.path(), "small", 16);
        assert!(matches!(result, Err(SharedMemoryError::InvalidData(_))));
    }

    #[test]
    fn test_creator_removes_file_on_close() {
        let dir = TempDir::new().unwrap();
        let mut segment = FileSharedMemory::create_in(dir.path(), "temp", 8).unwrap();
        let path = segment.path().to_path_buf();
        assert!(path.exists());

        segment.close();
        assert!(!segment.is_open());
        assert!(!path.exists());
        assert!(segment.read(0, 1).is_err());
    }

    #[test]
    fn test_opener_leaves_file_on_drop() {
        let dir = TempDir::new().unwrap();
        let creator = FileSharedMemory::create_in(dir.path(), "kept", 8).unwrap();
        {
            let _opener = FileSharedMemory::open_in(dir.path(), "kept", 8).unwrap();
        }
        assert!(creator.path().exists());
    }
}
