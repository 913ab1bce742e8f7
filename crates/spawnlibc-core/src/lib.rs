//! # spawnlibc-core
//!
//! The thread-creation core of a libc: per-thread guarded mappings, control
//! block and static TLS setup, scheduling inheritance, a startup handshake
//! between creator and child, and failure unwinding that never leaks a
//! mapping.
//!
//! Kernel access goes through the [`os::Os`] trait. On x86_64 Linux the
//! [`os::linux`] backend issues raw syscalls; [`os::sim`] runs the same
//! creation paths over a simulated kernel for testing.

#![deny(unsafe_code)]

pub mod config;
pub mod diag;
pub mod errno;
#[allow(unsafe_code)]
pub mod os;
pub mod pthread;
pub mod random;
pub mod runtime;
#[allow(unsafe_code)]
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod syscall;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
