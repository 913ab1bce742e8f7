//! Process-wide values every thread creation reads.
//!
//! Installed once before the first thread is created and immutable from
//! then on, so readers take no locks.

use thiserror::Error;

use crate::pthread::static_tls::{StaticTlsLayout, TlsLayoutError};
use crate::random::RandomSource;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GlobalsError {
    #[error("process globals are already installed")]
    AlreadyInstalled,
    #[error(transparent)]
    Layout(#[from] TlsLayoutError),
}

#[derive(Debug)]
pub struct ProcessGlobals {
    static_tls: StaticTlsLayout,
    stack_guard: usize,
}

impl ProcessGlobals {
    #[must_use]
    pub fn new(static_tls: StaticTlsLayout, stack_guard: usize) -> Self {
        Self {
            static_tls,
            stack_guard,
        }
    }

    /// Globals with a fresh random stack canary.
    #[must_use]
    pub fn with_random_guard(static_tls: StaticTlsLayout, rng: &dyn RandomSource) -> Self {
        Self::new(static_tls, rng.next_u64() as usize)
    }

    /// Minimal static TLS and a random canary.
    pub fn minimal(rng: &dyn RandomSource) -> Result<Self, GlobalsError> {
        Ok(Self::with_random_guard(StaticTlsLayout::minimal()?, rng))
    }

    /// Leak to obtain the `'static` borrow a runtime holds.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    #[must_use]
    pub fn static_tls(&self) -> &StaticTlsLayout {
        &self.static_tls
    }

    /// Stack-protector canary copied into every control block.
    #[must_use]
    pub fn stack_guard(&self) -> usize {
        self.stack_guard
    }
}

static GLOBALS: spin::Once<ProcessGlobals> = spin::Once::new();

/// Install the process globals. Fails if they are already installed.
pub fn install(globals: ProcessGlobals) -> Result<&'static ProcessGlobals, GlobalsError> {
    let mut installed = false;
    let current = GLOBALS.call_once(|| {
        installed = true;
        globals
    });
    if installed {
        log::debug!(
            "process globals installed: static TLS {} bytes",
            current.static_tls.size()
        );
        Ok(current)
    } else {
        Err(GlobalsError::AlreadyInstalled)
    }
}

/// The installed process globals, if any.
#[must_use]
pub fn get() -> Option<&'static ProcessGlobals> {
    GLOBALS.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SplitMix64;

    #[test]
    fn random_guard_comes_from_source() {
        let a = ProcessGlobals::minimal(&SplitMix64::new(5)).unwrap();
        let b = ProcessGlobals::minimal(&SplitMix64::new(5)).unwrap();
        assert_eq!(a.stack_guard(), b.stack_guard());
        assert_ne!(a.stack_guard(), 0);
    }

    #[test]
    fn install_happens_once() {
        let rng = SplitMix64::new(11);
        let first = install(ProcessGlobals::minimal(&rng).unwrap());
        let second = install(ProcessGlobals::minimal(&rng).unwrap());
        // Another test may have installed them first.
        assert!(matches!(first, Ok(_) | Err(GlobalsError::AlreadyInstalled)));
        assert_eq!(second.err(), Some(GlobalsError::AlreadyInstalled));
        assert!(get().is_some());
    }
}
