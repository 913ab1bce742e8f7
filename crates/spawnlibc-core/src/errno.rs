//! Error number definitions used by thread creation.
//!
//! Values match `<errno.h>` on Linux. Internal layers carry these as raw
//! `i32` codes; the public creation API wraps them in typed errors.

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;

/// Short symbolic name for an errno value, for diagnostics that must not
/// allocate (so no `strerror` table lookups through the host libc).
#[must_use]
pub const fn errno_name(errno: i32) -> &'static str {
    match errno {
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EFAULT => "EFAULT",
        EINVAL => "EINVAL",
        EDEADLK => "EDEADLK",
        ENOSYS => "ENOSYS",
        _ => "E?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_host_libc() {
        assert_eq!(EPERM, libc::EPERM);
        assert_eq!(ESRCH, libc::ESRCH);
        assert_eq!(EAGAIN, libc::EAGAIN);
        assert_eq!(ENOMEM, libc::ENOMEM);
        assert_eq!(EINVAL, libc::EINVAL);
        assert_eq!(EDEADLK, libc::EDEADLK);
    }

    #[test]
    fn names_are_symbolic() {
        assert_eq!(errno_name(EPERM), "EPERM");
        assert_eq!(errno_name(9999), "E?");
    }
}
