use std::time::{Duration, Instant};

use futures::future::join_all;
use nix::sys::wait::WaitStatus;
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use crate::convergence::{ConvergenceError, ConvergencePoller, PollConfig};
use crate::scenario::{
    CommandTemplate, Mutation, MutationError, PortAllocator, Scenario, Side, Stage, TreeRoots,
};
use crate::supervisor::{ShutdownConfig, SupervisedProcess, SupervisorError};
use crate::tree::{TreeResetError, reset_tree};

const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Everything the runner needs to launch and check one implementation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub server_command: CommandTemplate,
    pub client_command: CommandTemplate,
    pub roots: TreeRoots,
    /// Pause after starting each process.
    pub startup_delay: Duration,
    pub poll: PollConfig,
    pub shutdown: ShutdownConfig,
}

impl RunnerConfig {
    pub fn new(
        server_command: CommandTemplate,
        client_command: CommandTemplate,
        roots: TreeRoots,
    ) -> Self {
        Self {
            server_command,
            client_command,
            roots,
            startup_delay: DEFAULT_STARTUP_DELAY,
            poll: PollConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub duration: Duration,
    pub result: Result<(), ScenarioError>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs scenarios one after another against the same pair of roots.
pub struct ScenarioRunner {
    config: RunnerConfig,
    poller: ConvergencePoller,
    ports: PortAllocator,
}

impl ScenarioRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let poller = ConvergencePoller::new(config.poll);
        Self {
            config,
            poller,
            ports: PortAllocator::new(),
        }
    }

    pub async fn run_all<'a>(
        &mut self,
        scenarios: impl IntoIterator<Item = &'a Scenario>,
    ) -> Vec<ScenarioOutcome> {
        let mut outcomes = Vec::new();
        for scenario in scenarios {
            outcomes.push(self.run(scenario).await);
        }
        outcomes
    }

    /// Runs one scenario. Processes are always torn down, whatever happened.
    pub async fn run(&mut self, scenario: &Scenario) -> ScenarioOutcome {
        info!("Running scenario '{}'", scenario.name);
        let started = Instant::now();
        let mut processes = Vec::new();

        let mut result = self.execute(scenario, &mut processes).await;
        let teardown = self.teardown(&mut processes).await;

        match (&result, teardown) {
            (Ok(()), Err(teardown_error)) => result = Err(teardown_error),
            (Err(_), Err(teardown_error)) => {
                error!(
                    "Teardown of '{}' also failed: {}",
                    scenario.name, teardown_error
                );
            }
            (_, Ok(())) => {}
        }

        let duration = started.elapsed();
        match &result {
            Ok(()) => info!("Scenario '{}' passed in {:?}", scenario.name, duration),
            Err(e) => warn!("Scenario '{}' failed: {}", scenario.name, e),
        }

        ScenarioOutcome {
            name: scenario.name.clone(),
            duration,
            result,
        }
    }

    async fn execute(
        &mut self,
        scenario: &Scenario,
        processes: &mut Vec<SupervisedProcess>,
    ) -> Result<(), ScenarioError> {
        let roots = &self.config.roots;
        reset_tree(&roots.client).context(ResetSnafu)?;
        reset_tree(&roots.server).context(ResetSnafu)?;

        apply_all(&scenario.initial, roots, Stage::Setup).await?;

        let port = self.ports.next_port();
        let server_line = self
            .config
            .server_command
            .render(port, &roots.server, roots);
        let client_line = self
            .config
            .client_command
            .render(port, &roots.client, roots);

        for (side, command_line) in [(Side::Server, server_line), (Side::Client, client_line)] {
            let process = SupervisedProcess::start(side.to_string(), command_line)
                .context(StartSnafu)?;
            processes.push(process);
            compio::time::sleep(self.config.startup_delay).await;
        }
        for process in processes.iter_mut() {
            check_started(process)?;
        }

        self.poller
            .await_convergence(&roots.client, &roots.server)
            .await
            .context(ConvergenceSnafu {
                stage: Stage::InitialSync,
            })?;

        for (index, round) in scenario.rounds.iter().enumerate() {
            let stage = Stage::Round(index + 1);
            debug!("Scenario '{}' entering {}", scenario.name, stage);
            apply_all(round, roots, stage).await?;
            self.poller
                .await_convergence(&roots.client, &roots.server)
                .await
                .context(ConvergenceSnafu { stage })?;
        }

        Ok(())
    }

    /// Stops every started process concurrently; reports the first failure.
    async fn teardown(&self, processes: &mut [SupervisedProcess]) -> Result<(), ScenarioError> {
        let shutdown = &self.config.shutdown;
        let results = join_all(processes.iter_mut().map(|process| process.stop(shutdown))).await;

        results
            .into_iter()
            .collect::<Result<(), _>>()
            .context(TeardownSnafu)
    }
}

async fn apply_all(
    mutations: &[Mutation],
    roots: &TreeRoots,
    stage: Stage,
) -> Result<(), ScenarioError> {
    for mutation in mutations {
        mutation.apply(roots).await.context(MutationSnafu { stage })?;
    }
    Ok(())
}

/// A leader that already exited unsuccessfully never started properly.
fn check_started(process: &mut SupervisedProcess) -> Result<(), ScenarioError> {
    match process.check_alive().context(StartSnafu)? {
        None => Ok(()),
        Some(WaitStatus::Exited(_, 0)) => {
            info!("{} exited cleanly during startup", process.label());
            Ok(())
        }
        Some(status) => StartupExitSnafu {
            label: process.label(),
            command: process.command_line(),
            status: format!("{status:?}"),
        }
        .fail(),
    }
}

#[derive(Debug, Snafu)]
pub enum ScenarioError {
    #[snafu(display("Failed to reset the tree roots"))]
    ResetError { source: TreeResetError },
    #[snafu(display("Mutation failed during {}", stage))]
    MutationError { stage: Stage, source: MutationError },
    #[snafu(display("Failed to start a process"))]
    StartError { source: SupervisorError },
    #[snafu(display("{} ('{}') exited during startup: {}", label, command, status))]
    StartupExitError {
        label: String,
        command: String,
        status: String,
    },
    #[snafu(display("Trees did not converge during {}", stage))]
    ConvergenceError {
        stage: Stage,
        source: ConvergenceError,
    },
    #[snafu(display("Failed to stop processes"))]
    TeardownError { source: SupervisorError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Operation, ScenarioCatalogue};
    use crate::tree::{EntryKind, FileDigest, fingerprint};
    use std::path::Path;
    use tempfile::TempDir;

    /// Shell loop that keeps the server root a copy of the client root.
    const MIRROR_CLIENT: &str = "while true; do \
         find {server_path} -mindepth 1 -maxdepth 1 -exec rm -rf {} + ; \
         cp -R {client_path}/. {server_path}/ ; \
         sleep 0.1; done";
    const IDLE_SERVER: &str = "while true; do sleep 0.1; done";

    struct Harness {
        _dir: TempDir,
        runner: ScenarioRunner,
        roots: TreeRoots,
    }

    fn harness(server: &str, client: &str) -> Harness {
        harness_with_timeout(server, client, Duration::from_secs(10))
    }

    fn harness_with_timeout(server: &str, client: &str, poll_timeout: Duration) -> Harness {
        crate::supervisor::adopt_orphans();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let roots = TreeRoots {
            client: dir.path().join("client"),
            server: dir.path().join("server"),
        };
        let mut config = RunnerConfig::new(
            CommandTemplate::new(server),
            CommandTemplate::new(client),
            roots.clone(),
        );
        config.startup_delay = Duration::from_millis(100);
        config.poll = PollConfig {
            timeout: poll_timeout,
            interval: Duration::from_millis(100),
        };
        config.shutdown = ShutdownConfig {
            grace_timeout: Duration::from_secs(2),
            kill_timeout: Some(Duration::from_secs(5)),
            settle_delay: Duration::ZERO,
        };
        Harness {
            _dir: dir,
            runner: ScenarioRunner::new(config),
            roots,
        }
    }

    fn builtin(name: &str) -> Scenario {
        ScenarioCatalogue::builtin()
            .unwrap()
            .scenarios()
            .iter()
            .find(|scenario| scenario.name == name)
            .cloned()
            .expect("Scenario should exist")
    }

    async fn assert_same_trees(roots: &TreeRoots) {
        let client = fingerprint(&roots.client).await.unwrap();
        let server = fingerprint(&roots.server).await.unwrap();
        assert_eq!(client, server);
    }

    #[compio::test]
    async fn add_single_file_converges() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness.runner.run(&builtin("add_single_file")).await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        assert_eq!(
            std::fs::read(harness.roots.server.join("newfile.txt")).unwrap(),
            b"contents"
        );
        assert_same_trees(&harness.roots).await;
    }

    #[compio::test]
    async fn three_megabytes_added_at_once_converge() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness
            .runner
            .run(&builtin("3_new_files_1mb_each_add_instantly"))
            .await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        let server = fingerprint(&harness.roots.server).await.unwrap();
        let expected = FileDigest::of_bytes(&vec![b'*'; 1_000_000]);
        for name in ["file1.txt", "file2.txt", "file3.txt"] {
            let entry = server.get(name).expect("File should be mirrored");
            assert_eq!(entry.size(), 1_000_000);
            assert_eq!(entry.content_digest(), expected.hex);
        }
    }

    #[compio::test]
    async fn create_then_delete_leaves_no_entry() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness
            .runner
            .run(&builtin("single_file_change_and_remove"))
            .await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        let client = fingerprint(&harness.roots.client).await.unwrap();
        let server = fingerprint(&harness.roots.server).await.unwrap();
        assert!(client.get("newfile.txt").is_none());
        assert!(server.get("newfile.txt").is_none());
    }

    #[compio::test]
    async fn rename_moves_content() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness.runner.run(&builtin("file_rename")).await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        let server = fingerprint(&harness.roots.server).await.unwrap();
        let renamed = server.get("renamed.txt").expect("Renamed file should exist");
        assert_eq!(renamed.content_digest(), FileDigest::of_bytes(b"contents").hex);
        assert!(server.get("file.txt").is_none());
        assert_same_trees(&harness.roots).await;
    }

    #[compio::test]
    async fn empty_directory_appears_on_both_sides() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness.runner.run(&builtin("add_empty_dir")).await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        for root in [&harness.roots.client, &harness.roots.server] {
            let tree = fingerprint(root).await.unwrap();
            let entry = tree.get("newemptydir").expect("Directory should be listed");
            assert_eq!(entry.kind(), EntryKind::Directory);
            assert_eq!(entry.size(), 0);
        }
    }

    #[compio::test]
    async fn initial_content_is_synced_on_startup() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);

        let outcome = harness
            .runner
            .run(&builtin("initial_sync_file_and_empty_dir"))
            .await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        assert!(harness.roots.server.join("newemptydir").is_dir());
    }

    #[compio::test]
    async fn non_syncing_client_times_out_with_diff() {
        let mut harness =
            harness_with_timeout(IDLE_SERVER, IDLE_SERVER, Duration::from_millis(300));

        let outcome = harness.runner.run(&builtin("add_single_file")).await;

        match outcome.result {
            Err(ScenarioError::ConvergenceError {
                stage: Stage::Round(1),
                source: ConvergenceError::TimeoutError { diff, .. },
            }) => {
                assert_eq!(diff.left_only.len(), 1);
                assert_eq!(diff.left_only[0].relative_path(), "newfile.txt");
            }
            other => panic!("Expected a round 1 timeout, got {other:?}"),
        }
    }

    #[compio::test]
    async fn failing_command_is_a_start_failure() {
        let mut harness = harness("exit 3", MIRROR_CLIENT);

        let outcome = harness.runner.run(&builtin("add_single_file")).await;

        assert!(matches!(
            outcome.result,
            Err(ScenarioError::StartupExitError { .. })
        ));
    }

    #[compio::test]
    async fn processes_are_stopped_after_each_scenario() {
        let marker = TempDir::new().expect("Failed to create temp directory");
        let pid_file = marker.path().join("server.pid");
        let server = format!(
            "echo $$ > {}; while true; do sleep 0.1; done",
            pid_file.display()
        );
        let mut harness = harness(&server, MIRROR_CLIENT);

        let outcome = harness.runner.run(&builtin("add_empty_dir")).await;

        assert!(outcome.passed(), "{:?}", outcome.result);
        let pid = read_pid(&pid_file);
        assert_eq!(
            nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid), None),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[compio::test]
    async fn missing_mutation_target_fails_the_round() {
        let mut harness = harness(IDLE_SERVER, MIRROR_CLIENT);
        let scenario = Scenario::new("remove_missing").with_round(vec![Mutation::on_client(
            Operation::Remove {
                path: "absent.txt".to_string(),
            },
        )]);

        let outcome = harness.runner.run(&scenario).await;

        assert!(matches!(
            outcome.result,
            Err(ScenarioError::MutationError {
                stage: Stage::Round(1),
                ..
            })
        ));
    }

    fn read_pid(path: &Path) -> i32 {
        std::fs::read_to_string(path)
            .expect("Server should have written its pid")
            .trim()
            .parse()
            .expect("Pid should be numeric")
    }
}
