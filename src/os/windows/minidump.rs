//! Minidump writer

use std::fs::File;
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    MiniDumpWithDataSegs, MiniDumpWriteDump, EXCEPTION_POINTERS, MINIDUMP_EXCEPTION_INFORMATION,
};

use crate::core::error::DumpError;
use crate::watchdog::dump::DumpContext;

/// Write a data-segment minidump of `process` to `path`.
///
/// Exception information is passed only when the context carries pointers;
/// `ClientPointers` follows the context tag.
pub fn write_minidump(
    process: HANDLE,
    pid: u32,
    path: &Path,
    context: &DumpContext,
) -> Result<(), DumpError> {
    let file = File::create(path).map_err(|source| DumpError::CreateFile {
        path: path.to_path_buf(),
        source,
    })?;

    let exception = context
        .exception_pointers()
        .map(|address| MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: context.thread_id(),
            ExceptionPointers: address as usize as *mut EXCEPTION_POINTERS,
            ClientPointers: context.client_pointers().into(),
        });

    unsafe {
        MiniDumpWriteDump(
            process,
            pid,
            HANDLE(file.as_raw_handle() as isize),
            MiniDumpWithDataSegs,
            exception.as_ref().map(|e| e as *const _),
            None,
            None,
        )
    }
    .map_err(|e| DumpError::WriteFailed(e.to_string()))?;

    tracing::debug!("Wrote {} dump of process {} to {:?}", context.kind(), pid, path);
    Ok(())
}
