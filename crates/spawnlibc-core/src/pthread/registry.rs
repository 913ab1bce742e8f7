//! Live-thread registry.
//!
//! Every thread that reaches the kernel is registered exactly once, by its
//! creator, before its startup gate opens. It is removed when joined, or by
//! itself on exit when detached. The default registry guards a plain list
//! with a spin lock: the exit path runs on threads that cannot rely on
//! `std` thread-locals, which a parking lock would need.

use core::ptr::NonNull;

use crate::pthread::internal::ThreadBookkeeping;

/// Externally visible thread handle (`pthread_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(NonNull<ThreadBookkeeping>);

// SAFETY: the handle is an opaque address; dereferencing it is gated by
// registry membership.
#[allow(unsafe_code)]
unsafe impl Send for ThreadHandle {}
#[allow(unsafe_code)]
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    #[must_use]
    pub const fn from_bookkeeping(thread: NonNull<ThreadBookkeeping>) -> Self {
        Self(thread)
    }

    #[must_use]
    pub const fn as_ptr(self) -> *mut ThreadBookkeeping {
        self.0.as_ptr()
    }

    /// The numeric `pthread_t` value.
    #[must_use]
    pub fn as_raw(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Registry collaborator. Implementations synchronize internally.
pub trait ThreadRegistry: Sync {
    /// Record a thread and return its handle.
    fn register(&self, thread: NonNull<ThreadBookkeeping>) -> ThreadHandle;

    /// Whether `handle` names a registered thread.
    fn contains(&self, handle: ThreadHandle) -> bool;

    /// Forget `handle`. Returns whether it was registered.
    fn remove(&self, handle: ThreadHandle) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spin-locked list of live threads, newest first.
#[derive(Debug, Default)]
pub struct ListRegistry {
    threads: spin::Mutex<Vec<ThreadHandle>>,
}

impl ListRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads: spin::Mutex::new(Vec::new()),
        }
    }

    /// Leak a registry to obtain the `'static` borrow a runtime holds.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }
}

impl ThreadRegistry for ListRegistry {
    fn register(&self, thread: NonNull<ThreadBookkeeping>) -> ThreadHandle {
        let handle = ThreadHandle::from_bookkeeping(thread);
        self.threads.lock().insert(0, handle);
        handle
    }

    fn contains(&self, handle: ThreadHandle) -> bool {
        self.threads.lock().contains(&handle)
    }

    fn remove(&self, handle: ThreadHandle) -> bool {
        let mut threads = self.threads.lock();
        match threads.iter().position(|&h| h == handle) {
            Some(index) => {
                threads.remove(index);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.threads.lock().len()
    }
}

/// Registry used by the Linux runtime.
pub static DEFAULT_REGISTRY: ListRegistry = ListRegistry::new();
