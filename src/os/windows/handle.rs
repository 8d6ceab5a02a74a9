//! Scoped kernel handles and string helpers

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};

/// A kernel handle closed exactly once, when the guard is dropped
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    /// Take ownership of a handle returned by a successful create/open call
    pub fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// NUL-terminated UTF-16 copy of `text`
pub fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// NUL-terminated UTF-16 copy of an OS string
pub fn wide_os(text: &OsStr) -> Vec<u16> {
    text.encode_wide().chain(std::iter::once(0)).collect()
}

/// Win32 error code carried by a `windows` error
pub fn win32_code(error: &windows::core::Error) -> u32 {
    let hresult = error.code().0 as u32;
    // HRESULT_FROM_WIN32 packs the code under FACILITY_WIN32
    if hresult & 0xFFFF_0000 == 0x8007_0000 {
        hresult & 0xFFFF
    } else {
        hresult
    }
}

pub fn last_error() -> u32 {
    unsafe { GetLastError() }.0
}

/// Convert a `windows` error into an `io::Error` with the same OS code
pub fn io_error(error: windows::core::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(win32_code(&error) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_is_nul_terminated() {
        assert_eq!(wide("ab"), vec![b'a' as u16, b'b' as u16, 0]);
        assert_eq!(wide_os(OsStr::new("")), vec![0]);
    }

    #[test]
    fn test_win32_code_unpacks_hresult() {
        let error = windows::core::Error::from(windows::core::HRESULT(0x8007_0002u32 as i32));
        assert_eq!(win32_code(&error), 2);
    }
}
