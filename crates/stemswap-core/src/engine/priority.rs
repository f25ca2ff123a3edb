//! Real-time scheduling for the render thread
//!
//! On Linux the calling thread asks for `SCHED_FIFO`, then `SCHED_RR`.
//! Both need `CAP_SYS_NICE` (or an rtprio limit from the session manager);
//! without it the thread keeps normal scheduling and only a warning is
//! logged. Other platforms are left alone.

/// Outcome of [`elevate_current_thread`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOutcome {
    /// Running under a real-time policy
    Elevated,
    /// The OS refused; normal scheduling continues
    Denied,
    Unsupported,
}

/// FIFO priority requested for the render thread, leaving headroom for
/// kernel and audio-server threads
pub const RENDER_PRIORITY: i32 = 70;

/// Ask for real-time scheduling on the calling thread
pub fn elevate_current_thread() -> PriorityOutcome {
    let outcome = platform_elevate();
    match outcome {
        PriorityOutcome::Elevated => log::info!("Render thread running with real-time priority"),
        PriorityOutcome::Denied => {
            log::warn!("Real-time priority denied, render thread uses normal scheduling (grant CAP_SYS_NICE or rtprio)")
        }
        PriorityOutcome::Unsupported => log::debug!("Real-time priority not supported on this platform"),
    }
    outcome
}

#[cfg(target_os = "linux")]
fn platform_elevate() -> PriorityOutcome {
    use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_RR};

    for policy in [SCHED_FIFO, SCHED_RR] {
        let param = sched_param {
            sched_priority: RENDER_PRIORITY,
        };
        // SAFETY: pthread_self is always valid for the calling thread and
        // `param` outlives the call.
        let result = unsafe { pthread_setschedparam(pthread_self(), policy, &param) };
        if result == 0 {
            return PriorityOutcome::Elevated;
        }
        log::debug!("pthread_setschedparam(policy {}) failed: {}", policy, result);
    }
    PriorityOutcome::Denied
}

#[cfg(not(target_os = "linux"))]
fn platform_elevate() -> PriorityOutcome {
    PriorityOutcome::Unsupported
}
