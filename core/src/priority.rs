//! Scoped realtime scheduling elevation (spec §4.2 step 1, §5 "Priority discipline",
//! §9 REDESIGN FLAGS "Priority elevation... RAII-style guard... Drop restores the prior class").
//!
//! Elevation failure is logged and not fatal, per spec: a capture still proceeds on a
//! best-effort scheduling class.

/// Restores the calling thread's previous scheduling policy and priority on drop. Obtained from
/// `elevate_current_thread`.
pub struct PriorityGuard {
    previous: Option<libc::sched_param>,
    previous_policy: libc::c_int,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), self.previous_policy, &previous);
            }
        }
    }
}

/// Attempts to elevate the calling thread to `SCHED_FIFO` at a mid-range realtime priority.
/// Always returns a guard; on failure the guard is a no-op and the caller should log a warning.
pub fn elevate_current_thread() -> (PriorityGuard, Result<(), String>) {
    unsafe {
        let mut previous_param: libc::sched_param = std::mem::zeroed();
        let mut previous_policy: libc::c_int = 0;
        let thread = libc::pthread_self();
        let got_previous =
            libc::pthread_getschedparam(thread, &mut previous_policy, &mut previous_param) == 0;

        let max_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let min_priority = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let mut target_param: libc::sched_param = std::mem::zeroed();
        target_param.sched_priority = (max_priority + min_priority) / 2;

        let result = libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &target_param);

        if result != 0 {
            let guard = PriorityGuard {
                previous: None,
                previous_policy,
            };
            return (
                guard,
                Err(format!("pthread_setschedparam failed with errno {result}")),
            );
        }

        let guard = PriorityGuard {
            previous: if got_previous { Some(previous_param) } else { None },
            previous_policy,
        };
        (guard, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevation_always_returns_a_guard() {
        // Realtime elevation typically requires privileges the test runner doesn't have; the
        // contract under test is "never panics, always hands back a guard", not success.
        let (_guard, _result) = elevate_current_thread();
    }
}
