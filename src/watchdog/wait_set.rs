//! Tagged signal sources for the multiplexed wait

use crate::core::error::WaitError;

/// What a signal source means when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalRole {
    /// The child process exited
    ProcessExit,
    /// The child failed to reset its liveness timer in time
    Heartbeat,
    /// The child caught its own fault and wrote a crash record
    CrashSignal,
}

impl SignalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalRole::ProcessExit => "process-exit",
            SignalRole::Heartbeat => "heartbeat",
            SignalRole::CrashSignal => "crash-signal",
        }
    }
}

/// Ordered signal sources, each tagged with one role.
///
/// The process-exit source is always present. Heartbeat and crash-signal
/// appear only when their primitive was created. Each role appears at most
/// once, so an index from the wait maps back to exactly one role.
#[derive(Debug, Clone)]
pub struct WaitSet<W> {
    entries: Vec<(SignalRole, W)>,
}

impl<W: Clone> WaitSet<W> {
    /// Sources are ordered heartbeat, crash signal, process exit; when several
    /// are signalled together the lowest index is reported first.
    pub fn new(process_exit: W, heartbeat: Option<W>, crash_signal: Option<W>) -> Self {
        let mut entries = Vec::with_capacity(3);
        if let Some(h) = heartbeat {
            entries.push((SignalRole::Heartbeat, h));
        }
        if let Some(c) = crash_signal {
            entries.push((SignalRole::CrashSignal, c));
        }
        entries.push((SignalRole::ProcessExit, process_exit));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never true: the process-exit source is always present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, role: SignalRole) -> bool {
        self.entries.iter().any(|(r, _)| *r == role)
    }

    pub fn roles(&self) -> Vec<SignalRole> {
        self.entries.iter().map(|(r, _)| *r).collect()
    }

    /// Waitable handles in wait order
    pub fn handles(&self) -> Vec<W> {
        self.entries.iter().map(|(_, w)| w.clone()).collect()
    }

    /// Map an index reported by the wait back to its role
    pub fn resolve(&self, index: usize) -> Result<SignalRole, WaitError> {
        self.entries
            .get(index)
            .map(|(role, _)| *role)
            .ok_or(WaitError::UnknownIndex(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_full_set_order() {
        let set = WaitSet::new("proc", Some("timer"), Some("event"));
        assert_eq!(
            set.roles(),
            vec![SignalRole::Heartbeat, SignalRole::CrashSignal, SignalRole::ProcessExit]
        );
        assert_eq!(set.handles(), vec!["timer", "event", "proc"]);
        assert_eq!(set.resolve(2), Ok(SignalRole::ProcessExit));
    }

    #[test]
    fn test_process_only() {
        let set = WaitSet::new(1u32, None, None);
        assert_eq!(set.len(), 1);
        assert!(!set.is_empty());
        assert!(set.contains(SignalRole::ProcessExit));
        assert!(!set.contains(SignalRole::Heartbeat));
        assert_eq!(set.resolve(0), Ok(SignalRole::ProcessExit));
        assert_eq!(set.resolve(1), Err(WaitError::UnknownIndex(1)));
    }

    #[test]
    fn test_missing_heartbeat_shifts_indices() {
        let set = WaitSet::new(1u32, None, Some(2));
        assert_eq!(set.resolve(0), Ok(SignalRole::CrashSignal));
        assert_eq!(set.resolve(1), Ok(SignalRole::ProcessExit));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every valid index maps to exactly one role and no role repeats
        #[test]
        fn indices_resolve_to_distinct_roles(
            has_heartbeat in any::<bool>(),
            has_crash in any::<bool>(),
            probe in 0usize..8
        ) {
            let set = WaitSet::new(
                0u8,
                has_heartbeat.then_some(1u8),
                has_crash.then_some(2u8),
            );

            prop_assert_eq!(set.len(), 1 + has_heartbeat as usize + has_crash as usize);
            prop_assert!(set.contains(SignalRole::ProcessExit));
            prop_assert_eq!(set.contains(SignalRole::Heartbeat), has_heartbeat);
            prop_assert_eq!(set.contains(SignalRole::CrashSignal), has_crash);

            let resolved: Vec<_> = (0..set.len()).map(|i| set.resolve(i).unwrap()).collect();
            let unique: HashSet<_> = resolved.iter().copied().collect();
            prop_assert_eq!(unique.len(), resolved.len());

            if probe >= set.len() {
                prop_assert_eq!(set.resolve(probe), Err(WaitError::UnknownIndex(probe)));
            }
        }
    }
}
