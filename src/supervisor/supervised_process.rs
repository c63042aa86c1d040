use std::{
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, killpg},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

/// How often a stopping group is checked for remaining members.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long dropping an unstopped process waits for its group to be reaped.
const DROP_REAP_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Time allowed between SIGTERM and SIGKILL.
    pub grace_timeout: Duration,
    /// Time allowed after SIGKILL; `None` waits forever.
    pub kill_timeout: Option<Duration>,
    /// Pause after the group is gone so sockets and handles are released.
    pub settle_delay: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
            kill_timeout: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopping,
    Stopped,
}

/// A shell command running as the leader of its own process group.
///
/// Everything the command spawns inherits the group, so [`stop`] reaches the
/// whole tree with one signal.
///
/// [`stop`]: SupervisedProcess::stop
#[derive(Debug)]
pub struct SupervisedProcess {
    label: String,
    command_line: String,
    process_group: Pid,
    liveness: Liveness,
    leader_status: Option<WaitStatus>,
}

impl SupervisedProcess {
    /// Runs `command_line` through `sh -c` in a new process group. Output is
    /// inherited from the harness.
    pub fn start(
        label: impl Into<String>,
        command_line: impl Into<String>,
    ) -> Result<Self, SupervisorError> {
        let label = label.into();
        let command_line = command_line.into();
        info!("Starting {label}: {command_line}");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .context(SpawnSnafu {
                label: label.clone(),
                command: command_line.clone(),
            })?;

        // The leader's pid doubles as the group id; the child handle is not
        // needed since reaping goes through waitpid on the group.
        let process_group = Pid::from_raw(child.id() as i32);
        debug!("{label} runs in process group {process_group}");

        Ok(Self {
            label,
            command_line,
            process_group,
            liveness: Liveness::Running,
            leader_status: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    #[cfg(test)]
    pub fn process_group(&self) -> Pid {
        self.process_group
    }

    #[cfg(test)]
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Reaps without blocking and returns the leader's exit status if it has
    /// already exited.
    pub fn check_alive(&mut self) -> Result<Option<WaitStatus>, SupervisorError> {
        self.reap()?;
        Ok(self.leader_status)
    }

    /// Terminates the whole group: SIGTERM, then SIGKILL once
    /// `grace_timeout` expires. Calling it on a stopped process is a no-op.
    pub async fn stop(&mut self, config: &ShutdownConfig) -> Result<(), SupervisorError> {
        if self.liveness == Liveness::Stopped {
            return Ok(());
        }
        self.liveness = Liveness::Stopping;
        info!("Stopping {} (process group {})", self.label, self.process_group);

        self.signal_group(Signal::SIGTERM)?;
        if !self.wait_for_exit(Some(config.grace_timeout)).await? {
            warn!(
                "{} did not exit within {:?} of SIGTERM, sending SIGKILL",
                self.label, config.grace_timeout
            );
            self.signal_group(Signal::SIGKILL)?;
            if !self.wait_for_exit(config.kill_timeout).await? {
                return Err(SupervisorError::ShutdownError {
                    label: self.label.clone(),
                    process_group: self.process_group.as_raw(),
                });
            }
        }

        self.liveness = Liveness::Stopped;
        debug!(
            "{} stopped with leader status {:?}, settling for {:?}",
            self.label, self.leader_status, config.settle_delay
        );
        compio::time::sleep(config.settle_delay).await;
        Ok(())
    }

    /// A group that no longer exists counts as delivered.
    fn signal_group(&self, signal: Signal) -> Result<(), SupervisorError> {
        match killpg(self.process_group, signal) {
            Ok(()) => {
                debug!("Sent {signal} to process group {}", self.process_group);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(
                    "Process group {} already gone, skipping {signal}",
                    self.process_group
                );
                Ok(())
            }
            Err(errno) => Err(SupervisorError::SignalError {
                label: self.label.clone(),
                process_group: self.process_group.as_raw(),
                signal,
                source: errno,
            }),
        }
    }

    /// Returns `false` if members remain after `limit`.
    async fn wait_for_exit(&mut self, limit: Option<Duration>) -> Result<bool, SupervisorError> {
        let started = Instant::now();
        loop {
            self.reap()?;
            if !self.group_exists()? {
                return Ok(true);
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                return Ok(false);
            }
            compio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Collects every exited child belonging to the group, including
    /// orphans re-parented to the harness.
    fn reap(&mut self) -> Result<(), SupervisorError> {
        let any_in_group = Pid::from_raw(-self.process_group.as_raw());
        loop {
            match waitpid(any_in_group, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
                Ok(status) => {
                    debug!("Reaped {:?} from {}", status, self.label);
                    if status.pid() == Some(self.process_group) {
                        self.leader_status = Some(status);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(SupervisorError::WaitError {
                        label: self.label.clone(),
                        source: errno,
                    });
                }
            }
        }
    }

    fn group_exists(&self) -> Result<bool, SupervisorError> {
        match killpg(self.process_group, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            // Members owned by another user still count as alive.
            Err(Errno::EPERM) => Ok(true),
            Err(errno) => Err(SupervisorError::ProbeError {
                label: self.label.clone(),
                process_group: self.process_group.as_raw(),
                source: errno,
            }),
        }
    }
}

/// Last resort for processes never stopped, e.g. when a scenario panics.
impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if self.liveness == Liveness::Stopped {
            return;
        }
        warn!(
            "{} dropped while {:?}, killing process group {}",
            self.label, self.liveness, self.process_group
        );
        match killpg(self.process_group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!("Failed to kill process group {}: {errno}", self.process_group),
        }

        // SIGKILL is asynchronous; reap briefly so members do not linger as
        // zombies of the harness.
        let deadline = Instant::now() + DROP_REAP_TIMEOUT;
        loop {
            if let Err(e) = self.reap() {
                warn!("{e}");
                return;
            }
            match self.group_exists() {
                Ok(false) => return,
                Ok(true) if Instant::now() >= deadline => {
                    warn!(
                        "Process group {} of {} still exists after SIGKILL",
                        self.process_group, self.label
                    );
                    return;
                }
                Ok(true) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    warn!("{e}");
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SupervisorError {
    #[snafu(display("Failed to start {} with command '{}'", label, command))]
    SpawnError {
        label: String,
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to send {} to {} (process group {})", signal, label, process_group))]
    SignalError {
        label: String,
        process_group: i32,
        signal: Signal,
        source: Errno,
    },
    #[snafu(display("Failed to check process group {} of {}", process_group, label))]
    ProbeError {
        label: String,
        process_group: i32,
        source: Errno,
    },
    #[snafu(display("Failed to reap children of {}", label))]
    WaitError { label: String, source: Errno },
    #[snafu(display(
        "Process group {} of {} survived SIGKILL",
        process_group,
        label
    ))]
    ShutdownError { label: String, process_group: i32 },
}
