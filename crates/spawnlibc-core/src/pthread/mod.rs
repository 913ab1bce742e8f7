//! POSIX thread creation.
//!
//! Allocates one guarded mapping per thread, initializes its control block
//! and bookkeeping, spawns the kernel thread behind a startup gate and
//! unwinds cleanly when any step fails. Also provides the matching exit,
//! join and detach paths.

pub mod attr;
pub mod create;
pub mod gate;
pub mod globals;
pub mod internal;
pub mod layout;
pub mod lifecycle;
pub mod mapping;
pub mod platform;
pub mod registry;
pub mod sched;
pub mod static_tls;
pub mod tcb;
pub mod unwind;

pub use attr::{CallerStack, DEFAULT_STACK_SIZE, SchedInheritance, ThreadAttributes};
pub use create::{CreateError, create};
pub use internal::{JoinState, ThreadEntry};
pub use lifecycle::{detach, join};
pub use mapping::AllocError;
pub use registry::{ListRegistry, ThreadHandle, ThreadRegistry};
