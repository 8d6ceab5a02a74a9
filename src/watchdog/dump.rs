//! Dump Generator
//!
//! Chooses the dump location and the exception context, then hands the
//! actual write to the platform backend. Exception context comes in three
//! flavours and the backend must branch on the tag: pointers are only
//! meaningful in the address space named by the variant.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::backend::Backend;
use super::crash_relay::CrashRecord;
use crate::core::error::DumpError;

/// Exception context for one dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpContext {
    /// No exception information: threads, stacks and modules only
    EnvironmentOnly { thread_id: u32 },
    /// Exception pointers valid in the supervisor's own address space
    Local { thread_id: u32, exception_pointers: usize },
    /// Exception pointers valid only inside the faulting target
    Relayed { thread_id: u32, raw_pointers: [u8; 8] },
}

impl DumpContext {
    /// Context described by a crash record written by the target
    pub fn from_record(record: &CrashRecord) -> Self {
        DumpContext::Relayed {
            thread_id: record.thread_id,
            raw_pointers: record.exception_pointers.to_le_bytes(),
        }
    }

    pub fn thread_id(&self) -> u32 {
        match *self {
            DumpContext::EnvironmentOnly { thread_id }
            | DumpContext::Local { thread_id, .. }
            | DumpContext::Relayed { thread_id, .. } => thread_id,
        }
    }

    /// Whether exception pointers must be resolved in the target's memory
    pub fn client_pointers(&self) -> bool {
        matches!(self, DumpContext::Relayed { .. })
    }

    /// Exception pointer address, if the context carries a non-null one
    pub fn exception_pointers(&self) -> Option<u64> {
        let address = match *self {
            DumpContext::EnvironmentOnly { .. } => 0,
            DumpContext::Local {
                exception_pointers, ..
            } => exception_pointers as u64,
            DumpContext::Relayed { raw_pointers, .. } => u64::from_le_bytes(raw_pointers),
        };
        (address != 0).then_some(address)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DumpContext::EnvironmentOnly { .. } => "environment",
            DumpContext::Local { .. } => "local",
            DumpContext::Relayed { .. } => "relayed",
        }
    }
}

/// A dump ready to hand to the report tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDump {
    pub path: PathBuf,
    /// The target wrote this file itself and it was taken as is
    pub reused: bool,
    pub created_at: SystemTime,
}

/// `<prefix>.DD.MM.YYYY-HH.MM.SS.dmp`
pub fn dump_file_name(prefix: &str, at: &DateTime<Local>) -> String {
    format!("{}.{}.dmp", prefix, at.format("%d.%m.%Y-%H.%M.%S"))
}

/// Picks timestamped dump paths and drives the backend's dump writer
#[derive(Debug, Clone)]
pub struct DumpGenerator {
    directory: PathBuf,
    file_prefix: String,
}

impl DumpGenerator {
    pub fn new(directory: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: file_prefix.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path for a dump taken now
    pub fn next_path(&self) -> PathBuf {
        self.directory
            .join(dump_file_name(&self.file_prefix, &Local::now()))
    }

    /// Write a fresh dump of `child` with the given context
    pub fn generate<B: Backend>(
        &self,
        backend: &B,
        child: &B::Child,
        context: DumpContext,
    ) -> Result<GeneratedDump, DumpError> {
        let path = self.next_path();
        tracing::info!(
            "Exception occurred in thread {} ({} context), writing {:?}",
            context.thread_id(),
            context.kind(),
            path
        );

        backend.write_dump(child, &path, &context)?;

        Ok(GeneratedDump {
            path,
            reused: false,
            created_at: SystemTime::now(),
        })
    }

    /// Dump for a fault the target relayed through the crash segment.
    ///
    /// A dump the target already wrote is reused verbatim.
    pub fn generate_from_record<B: Backend>(
        &self,
        backend: &B,
        child: &B::Child,
        record: &CrashRecord,
    ) -> Result<GeneratedDump, DumpError> {
        if let Some(path) = record.reusable_dump() {
            tracing::info!("Exception occurred, dump found at {:?}", path);
            return Ok(GeneratedDump {
                path: path.to_path_buf(),
                reused: true,
                created_at: SystemTime::now(),
            });
        }

        self.generate(backend, child, DumpContext::from_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dump_file_name_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(
            dump_file_name("Watchdog.CrashReport", &at),
            "Watchdog.CrashReport.07.03.2024-09.05.02.dmp"
        );
    }

    #[test]
    fn test_next_path_in_directory() {
        let generator = DumpGenerator::new("/tmp/dumps", "Game.CrashReport");
        let path = generator.next_path();

        assert_eq!(path.parent(), Some(Path::new("/tmp/dumps")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Game.CrashReport."));
        assert!(name.ends_with(".dmp"));
        assert_eq!(name.len(), "Game.CrashReport.".len() + "DD.MM.YYYY-HH.MM.SS".len() + 4);
    }

    #[test]
    fn test_relayed_context_from_record() {
        let record = CrashRecord::fault(42, 0x1000);
        let context = DumpContext::from_record(&record);

        assert!(context.client_pointers());
        assert_eq!(context.thread_id(), 42);
        assert_eq!(context.exception_pointers(), Some(0x1000));
        assert_eq!(context.kind(), "relayed");
    }

    #[test]
    fn test_environment_context_has_no_exception() {
        let context = DumpContext::EnvironmentOnly { thread_id: 7 };
        assert!(!context.client_pointers());
        assert_eq!(context.exception_pointers(), None);
        assert_eq!(context.thread_id(), 7);
    }

    #[test]
    fn test_local_context_uses_own_pointers() {
        let context = DumpContext::Local {
            thread_id: 3,
            exception_pointers: 0xABCD,
        };
        assert!(!context.client_pointers());
        assert_eq!(context.exception_pointers(), Some(0xABCD));

        let null = DumpContext::Local {
            thread_id: 3,
            exception_pointers: 0,
        };
        assert_eq!(null.exception_pointers(), None);
    }
}
