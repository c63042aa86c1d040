use std::{path::PathBuf, time::Duration};

use crate::cli::{Cli, Command};
use crate::convergence::PollConfig;
use crate::scenario::{CommandTemplate, TreeRoots};
use crate::supervisor::ShutdownConfig;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub command: Command,
    pub client_command: Option<CommandTemplate>,
    pub server_command: Option<CommandTemplate>,
    pub roots: TreeRoots,
    pub catalogue: Option<PathBuf>,
    pub filter: Option<String>,
    pub poll: PollConfig,
    pub shutdown: ShutdownConfig,
    pub startup_delay: Duration,
}

impl From<Cli> for RuntimeConfig {
    fn from(cli: Cli) -> Self {
        Self {
            command: cli.command.unwrap_or(Command::Run),
            client_command: cli.client_cmd.map(CommandTemplate::new),
            server_command: cli.server_cmd.map(CommandTemplate::new),
            roots: TreeRoots {
                client: cli.client_root,
                server: cli.server_root,
            },
            catalogue: cli.scenarios,
            filter: cli.filter,
            poll: PollConfig {
                timeout: cli.timeout,
                interval: cli.poll_interval,
            },
            shutdown: ShutdownConfig {
                grace_timeout: cli.shutdown_timeout,
                kill_timeout: cli.kill_timeout,
                settle_delay: cli.settle_delay,
            },
            startup_delay: cli.startup_delay,
        }
    }
}
