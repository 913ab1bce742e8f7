//! How far a thread creation got, and what undoing it takes.
//!
//! Creation advances through [`Progress`] in order. When a step fails,
//! [`Progress::unwind_action`] names the cleanup for the last stage
//! reached. Once a kernel thread exists its mapping cannot be released by
//! the creator: the thread is instead turned into a detached no-op that
//! frees itself on its ordinary exit path.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    /// The mapping is reserved and initialized; no kernel thread exists.
    MappingReserved,
    /// The kernel thread exists and is parked on its startup gate.
    KernelThreadSpawned,
    /// Scheduling and registration are done.
    PostInitComplete,
    /// The handle was returned and the gate opened for user code.
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindAction {
    /// Release the mapping directly.
    ReleaseMapping,
    /// Force the thread detached, swap its entry for a no-op, register it
    /// and open its gate so it exits and unmaps itself.
    RetireSpawnedThread,
    /// Nothing left to undo.
    None,
}

impl Progress {
    #[must_use]
    pub const fn unwind_action(self) -> UnwindAction {
        match self {
            Self::MappingReserved => UnwindAction::ReleaseMapping,
            Self::KernelThreadSpawned => UnwindAction::RetireSpawnedThread,
            Self::PostInitComplete | Self::Published => UnwindAction::None,
        }
    }

    /// Whether user code may run at this stage.
    #[must_use]
    pub const fn user_code_may_run(self) -> bool {
        matches!(self, Self::Published)
    }
}
