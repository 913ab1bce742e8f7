//! Runtime configuration for thread creation.
//!
//! Most knobs are fixed per build target and carried in [`RuntimeConfig`].
//! One of them, the scheduling-failure policy, can be overridden per process
//! through the `SPAWNLIBC_SCHED_APPLY` environment variable:
//! - `surface` (default on 64-bit targets): a failed `sched_setscheduler`
//!   after spawn fails the creation call with the kernel's errno.
//! - `warn` (default on 32-bit targets): the failure is reported through the
//!   diagnostic sink and ignored.

use std::sync::atomic::{AtomicU8, Ordering};

/// What to do when applying an explicit scheduling policy to an already
/// spawned thread fails.
///
/// The historical behavior, kept verbatim: "For backwards compatibility
/// reasons, we only report failures on 64-bit devices." Neither branch is
/// treated as the correct one; the choice is per target and overridable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedFailurePolicy {
    /// Warn, then fail creation with the OS error. The spawned thread is
    /// detached and runs a no-op entry point.
    Surface,
    /// Warn and let creation succeed with the inherited scheduling.
    WarnAndIgnore,
}

impl SchedFailurePolicy {
    /// The build target's historical behavior.
    #[must_use]
    pub const fn for_target() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Surface
        } else {
            Self::WarnAndIgnore
        }
    }

    /// Parse from string (case-insensitive). Unknown values keep the target default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "surface" | "fatal" | "error" | "strict" => Self::Surface,
            "warn" | "ignore" | "legacy" => Self::WarnAndIgnore,
            _ => Self::for_target(),
        }
    }
}

impl Default for SchedFailurePolicy {
    fn default() -> Self {
        Self::for_target()
    }
}

/// How much virtual address space a thread mapping may spend on the random
/// gap above its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// 64-bit: the gap may reach half the stack size.
    Abundant,
    /// 32-bit: the gap is capped at a tenth of the stack size.
    Constrained,
}

impl AddressSpace {
    #[must_use]
    pub const fn for_target() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Abundant
        } else {
            Self::Constrained
        }
    }

    /// Upper bound (exclusive, before page rounding) of the random gap.
    #[must_use]
    pub const fn max_gap(self, stack_size: usize) -> usize {
        match self {
            Self::Abundant => stack_size / 2,
            Self::Constrained => stack_size / 10,
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::for_target()
    }
}

/// Whether the spawn installs the new thread's control block as its thread
/// pointer (`CLONE_SETTLS`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadPointerMode {
    /// Point the thread pointer at the new control block.
    #[default]
    Install,
    /// Leave the thread pointer as the kernel copies it from the parent.
    ///
    /// Opt-in for hosted tests whose entry points call into a host libc.
    /// The child then shares the creator's thread-locals (errno, allocator
    /// caches), so both threads must not touch them concurrently, and the
    /// control block built for the child is never reachable from it.
    Inherit,
}

/// Per-runtime configuration, fixed before the first thread is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub sched_failure: SchedFailurePolicy,
    pub address_space: AddressSpace,
    pub thread_pointer: ThreadPointerMode,
    /// Give each new thread an alternate signal stack.
    pub alternate_signal_stack: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sched_failure: SchedFailurePolicy::for_target(),
            address_space: AddressSpace::for_target(),
            thread_pointer: ThreadPointerMode::Install,
            alternate_signal_stack: true,
        }
    }
}

impl RuntimeConfig {
    /// Target defaults with the environment override applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            sched_failure: sched_failure_policy(),
            ..Self::default()
        }
    }
}

// Atomic cache: 0=unresolved, 1=Surface, 2=WarnAndIgnore, 255=resolving.
// A non-blocking state machine rather than OnceLock: a reentrant call while
// the environment is being read gets the target default instead of waiting.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_SURFACE: u8 = 1;
const POLICY_WARN: u8 = 2;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: SchedFailurePolicy) -> u8 {
    match policy {
        SchedFailurePolicy::Surface => POLICY_SURFACE,
        SchedFailurePolicy::WarnAndIgnore => POLICY_WARN,
    }
}

fn u8_to_policy(v: u8) -> SchedFailurePolicy {
    match v {
        POLICY_SURFACE => SchedFailurePolicy::Surface,
        POLICY_WARN => SchedFailurePolicy::WarnAndIgnore,
        _ => SchedFailurePolicy::for_target(),
    }
}

/// The process's scheduling-failure policy (reads the environment on first
/// call, caches thereafter).
#[must_use]
pub fn sched_failure_policy() -> SchedFailurePolicy {
    let cached = CACHED_POLICY.load(Ordering::Relaxed);

    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return u8_to_policy(cached);
    }
    if cached == POLICY_RESOLVING {
        return SchedFailurePolicy::for_target();
    }

    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_POLICY.load(Ordering::Relaxed);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            u8_to_policy(v)
        } else {
            SchedFailurePolicy::for_target()
        };
    }

    let policy = std::env::var("SPAWNLIBC_SCHED_APPLY")
        .map(|v| SchedFailurePolicy::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
    policy
}
