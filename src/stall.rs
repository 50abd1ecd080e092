// src/stall.rs

//! Stall-detection hook.

/// External monitor observing progress pings to detect a hung build.
///
/// The engine calls [`made_progress`](StallMonitor::made_progress) on every
/// status transition and scheduling decision; a monitor that stops seeing
/// pings can snapshot the status table for diagnostics.
pub trait StallMonitor: Send + Sync {
    fn made_progress(&self);
}
