//! Thread creation attributes.

/// Default usable stack size: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// How a new thread gets its scheduling policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SchedInheritance {
    /// Neither inherit nor explicit was requested. Non-default attribute
    /// values are still applied.
    #[default]
    Unspecified,
    /// Copy the creator's policy and priority.
    Inherit,
    /// Use the policy and priority in the attributes.
    Explicit,
}

/// Stack memory supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerStack {
    pub base: usize,
    pub size: usize,
}

impl CallerStack {
    /// One past the highest address of the buffer. Recorded as the stack
    /// top as is; the spawn backend aligns the initial stack pointer.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.base + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttributes {
    pub stack: Option<CallerStack>,
    pub stack_size: usize,
    /// Requested guard size; `None` means one page.
    pub guard_size: Option<usize>,
    pub detached: bool,
    pub inherit: SchedInheritance,
    pub policy: i32,
    pub priority: i32,
}

impl Default for ThreadAttributes {
    fn default() -> Self {
        Self {
            stack: None,
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: None,
            detached: false,
            inherit: SchedInheritance::Unspecified,
            policy: libc::SCHED_OTHER,
            priority: 0,
        }
    }
}

impl ThreadAttributes {
    #[must_use]
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_caller_stack(mut self, base: usize, size: usize) -> Self {
        self.stack = Some(CallerStack { base, size });
        self.stack_size = size;
        self
    }

    #[must_use]
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    #[must_use]
    pub fn with_guard_size(mut self, size: usize) -> Self {
        self.guard_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_scheduling(mut self, inherit: SchedInheritance, policy: i32, priority: i32) -> Self {
        self.inherit = inherit;
        self.policy = policy;
        self.priority = priority;
        self
    }
}
