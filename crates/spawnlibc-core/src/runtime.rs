//! The collaborators thread creation runs against.
//!
//! A [`Runtime`] outlives every thread created through it: children find it
//! through their bookkeeping on their start and exit paths.

use core::fmt;

use crate::config::RuntimeConfig;
use crate::diag::DiagnosticSink;
use crate::os::Os;
use crate::pthread::globals::ProcessGlobals;
use crate::pthread::platform::{NativePlatform, Platform};
use crate::pthread::registry::ThreadRegistry;
use crate::pthread::tcb::TcbLayout;

pub struct Runtime {
    pub os: &'static dyn Os,
    pub registry: &'static dyn ThreadRegistry,
    pub diag: &'static dyn DiagnosticSink,
    pub globals: &'static ProcessGlobals,
    pub config: RuntimeConfig,
}

impl Runtime {
    #[must_use]
    pub const fn new(
        os: &'static dyn Os,
        registry: &'static dyn ThreadRegistry,
        diag: &'static dyn DiagnosticSink,
        globals: &'static ProcessGlobals,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            os,
            registry,
            diag,
            globals,
            config,
        }
    }

    /// Leak to obtain the `'static` borrow thread creation requires.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    /// Control block layout of the build target.
    #[must_use]
    pub const fn tcb_layout(&self) -> TcbLayout {
        NativePlatform::TCB_LAYOUT
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("page_size", &self.os.page_size())
            .field("live_threads", &self.registry.len())
            .field("globals", self.globals)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The process runtime over raw Linux syscalls.
///
/// Installs minimal process globals on first use unless some were installed
/// already, and reads the configuration from the environment once.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn linux() -> Result<&'static Runtime, crate::pthread::globals::GlobalsError> {
    use crate::diag::StderrSink;
    use crate::os::linux::LinuxOs;
    use crate::pthread::globals::{self, GlobalsError};
    use crate::pthread::registry::DEFAULT_REGISTRY;

    static LINUX_OS: LinuxOs = LinuxOs::new();
    static STDERR: StderrSink = StderrSink;
    static RUNTIME: spin::Once<Runtime> = spin::Once::new();

    RUNTIME.try_call_once(|| {
        let globals = match globals::get() {
            Some(installed) => installed,
            None => match globals::install(ProcessGlobals::minimal(&LINUX_OS)?) {
                Ok(installed) => installed,
                // Lost a race with another installer.
                Err(GlobalsError::AlreadyInstalled) => {
                    globals::get().ok_or(GlobalsError::AlreadyInstalled)?
                }
                Err(err) => return Err(err),
            },
        };
        let config = RuntimeConfig::from_env();
        log::debug!("linux runtime ready: {config:?}");
        Ok(Runtime::new(&LINUX_OS, &DEFAULT_REGISTRY, &STDERR, globals, config))
    })
}
