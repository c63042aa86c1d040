//! Supervision of client and server processes.
//!
//! Each supervised command leads its own process group and is always
//! signalled as a group, so workers it forks are stopped with it.

mod supervised_process;

use std::sync::Once;

pub use supervised_process::{ShutdownConfig, SupervisedProcess, SupervisorError};

static ADOPT_ORPHANS: Once = Once::new();

/// On Linux, makes the harness the reaper of orphaned descendants, so group
/// members whose parent died are reaped by `stop` instead of lingering as
/// zombies. Elsewhere orphans are left to init.
pub fn adopt_orphans() {
    ADOPT_ORPHANS.call_once(become_subreaper);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn become_subreaper() {
    if let Err(errno) = nix::sys::prctl::set_child_subreaper(true) {
        tracing::warn!("Failed to become child subreaper: {errno}");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn become_subreaper() {}
