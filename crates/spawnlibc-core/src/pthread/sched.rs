//! Scheduling policy for new threads.
//!
//! A cloned thread starts with its creator's policy and priority unless
//! the creator runs with `SCHED_RESET_ON_FORK`. [`plan_scheduling`] runs
//! before the spawn and decides whether an explicit `sched_setscheduler`
//! is needed; [`apply_scheduling`] issues it once the kernel tid exists.

use crate::config::SchedFailurePolicy;
use crate::diag::DiagnosticSink;
use crate::diag_warn;
use crate::errno::errno_name;
use crate::os::Os;
use crate::pthread::attr::{SchedInheritance, ThreadAttributes};
use crate::pthread::create::CreateError;

/// Outcome of [`plan_scheduling`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPlan {
    /// The kernel's inherited scheduling is already right.
    Inherited,
    /// Call `sched_setscheduler(tid, policy, priority)` after spawn.
    Apply { policy: i32, priority: i32 },
}

/// Decide the new thread's scheduling. Query failures abort creation
/// before anything is spawned.
pub fn plan_scheduling(
    os: &dyn Os,
    diag: &dyn DiagnosticSink,
    attr: &ThreadAttributes,
) -> Result<SchedulingPlan, CreateError> {
    match attr.inherit {
        SchedInheritance::Inherit => {
            let policy = os.sched_getscheduler().map_err(|errno| {
                diag_warn!(
                    diag,
                    "pthread_create sched_getscheduler failed: {}",
                    errno_name(errno)
                );
                CreateError::SchedQuery {
                    call: "sched_getscheduler",
                    errno,
                }
            })?;
            if policy & libc::SCHED_RESET_ON_FORK == 0 {
                return Ok(SchedulingPlan::Inherited);
            }
            let priority = os.sched_getparam().map_err(|errno| {
                diag_warn!(
                    diag,
                    "pthread_create sched_getparam failed: {}",
                    errno_name(errno)
                );
                CreateError::SchedQuery {
                    call: "sched_getparam",
                    errno,
                }
            })?;
            Ok(SchedulingPlan::Apply { policy, priority })
        }
        SchedInheritance::Explicit => Ok(SchedulingPlan::Apply {
            policy: attr.policy,
            priority: attr.priority,
        }),
        // Neither POSIX behavior: apply anything but the default policy.
        SchedInheritance::Unspecified if attr.policy != libc::SCHED_OTHER => {
            Ok(SchedulingPlan::Apply {
                policy: attr.policy,
                priority: attr.priority,
            })
        }
        SchedInheritance::Unspecified => Ok(SchedulingPlan::Inherited),
    }
}

/// Apply a plan to the spawned thread `tid`.
///
/// A failed call is always reported through `diag`. Whether it also fails
/// the creation depends on `on_failure`.
pub fn apply_scheduling(
    os: &dyn Os,
    diag: &dyn DiagnosticSink,
    tid: i32,
    plan: SchedulingPlan,
    on_failure: SchedFailurePolicy,
) -> Result<(), CreateError> {
    let SchedulingPlan::Apply { policy, priority } = plan else {
        return Ok(());
    };
    match os.sched_setscheduler(tid, policy, priority) {
        Ok(()) => Ok(()),
        Err(errno) => {
            diag_warn!(
                diag,
                "pthread_create sched_setscheduler({}, {{{}}}) call failed: {}",
                policy,
                priority,
                errno_name(errno)
            );
            match on_failure {
                SchedFailurePolicy::Surface => Err(CreateError::SchedApply {
                    policy,
                    priority,
                    errno,
                }),
                SchedFailurePolicy::WarnAndIgnore => Ok(()),
            }
        }
    }
}
