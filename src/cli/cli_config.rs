use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::application::data::LogLevel;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Conformance harness for file-synchronization implementations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[clap(long, short, default_value = "warn", value_enum, global = true)]
    pub log_level: LogLevel,

    /// Client command line; `{port}` and `{path}` are substituted
    #[clap(long, env = "CLIENT_CMD", global = true)]
    pub client_cmd: Option<String>,
    /// Server command line; `{port}` and `{path}` are substituted
    #[clap(long, env = "SERVER_CMD", global = true)]
    pub server_cmd: Option<String>,

    #[clap(long, default_value = "/tmp/dropbox/client", global = true)]
    pub client_root: PathBuf,
    #[clap(long, default_value = "/tmp/dropbox/server", global = true)]
    pub server_root: PathBuf,

    /// Scenario catalogue to use instead of the built-in one
    #[clap(long, global = true)]
    pub scenarios: Option<PathBuf>,
    /// Only run scenarios whose name contains this substring
    #[clap(long, short, global = true)]
    pub filter: Option<String>,

    /// Seconds to wait for the trees to converge
    #[clap(long, default_value = "20", value_parser = parse_seconds, global = true)]
    pub timeout: Duration,
    /// Seconds between two fingerprint comparisons
    #[clap(long, default_value = "1", value_parser = parse_seconds, global = true)]
    pub poll_interval: Duration,
    /// Seconds a process group gets to exit after SIGTERM
    #[clap(long, default_value = "10", value_parser = parse_seconds, global = true)]
    pub shutdown_timeout: Duration,
    /// Seconds a process group gets to exit after SIGKILL; unbounded if unset
    #[clap(long, value_parser = parse_seconds, global = true)]
    pub kill_timeout: Option<Duration>,
    /// Seconds to wait after a process group was stopped
    #[clap(long, default_value = "2", value_parser = parse_seconds, global = true)]
    pub settle_delay: Duration,
    /// Seconds to wait after starting each process
    #[clap(long, default_value = "1", value_parser = parse_seconds, global = true)]
    pub startup_delay: Duration,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the selected scenarios (default)
    Run,
    /// List the scenarios of the active catalogue
    List,
    /// Print the fingerprint of a directory tree
    Fingerprint {
        root: PathBuf,
        /// Write the fingerprint to this file instead of stdout
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
    /// Wait for two directory trees to converge
    Compare { left: PathBuf, right: PathBuf },
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|e| format!("'{value}' is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("'{value}' is not a valid duration: {e}"))
}
