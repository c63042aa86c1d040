use std::{
    fmt,
    path::{Path, PathBuf},
};

use colored::Colorize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::application::RuntimeConfig;
use crate::cli::Command;
use crate::convergence::{ConvergenceError, ConvergencePoller};
use crate::ext::BestEffortPathExt;
use crate::scenario::{
    CatalogueError, RunnerConfig, ScenarioCatalogue, ScenarioOutcome, ScenarioRunner, Side,
};
use crate::tree::{EntryKind, FingerprintError, TreeFingerprint, fingerprint};

pub struct Application;

impl Application {
    pub async fn run(runtime_config: impl Into<RuntimeConfig>) -> Result<(), ApplicationError> {
        let config: RuntimeConfig = runtime_config.into();
        debug!("Runtime config: {:?}", config);

        match &config.command {
            Command::Run => run_scenarios(&config).await,
            Command::List => list_scenarios(&config).await,
            Command::Fingerprint { root, output } => {
                print_fingerprint(root, output.as_deref()).await
            }
            Command::Compare { left, right } => compare_trees(&config, left, right).await,
        }
    }
}

async fn run_scenarios(config: &RuntimeConfig) -> Result<(), ApplicationError> {
    let catalogue = ScenarioCatalogue::load(config.catalogue.as_deref())
        .await
        .context(CatalogueSnafu)?;
    let selected = catalogue.select(config.filter.as_deref());
    ensure!(
        !selected.is_empty(),
        NoScenariosSnafu {
            filter: config.filter.clone()
        }
    );

    let server_command = config.server_command.clone().context(MissingCommandSnafu {
        side: Side::Server,
        variable: "SERVER_CMD",
    })?;
    let client_command = config.client_command.clone().context(MissingCommandSnafu {
        side: Side::Client,
        variable: "CLIENT_CMD",
    })?;

    let mut runner_config = RunnerConfig::new(server_command, client_command, config.roots.clone());
    runner_config.startup_delay = config.startup_delay;
    runner_config.poll = config.poll;
    runner_config.shutdown = config.shutdown;

    info!("Running {} scenario(s)", selected.len());
    let outcomes = ScenarioRunner::new(runner_config).run_all(selected).await;

    print_summary(&outcomes);

    let failed = outcomes.iter().filter(|outcome| !outcome.passed()).count();
    ensure!(
        failed == 0,
        ScenariosFailedSnafu {
            failed,
            total: outcomes.len()
        }
    );
    Ok(())
}

async fn list_scenarios(config: &RuntimeConfig) -> Result<(), ApplicationError> {
    let catalogue = ScenarioCatalogue::load(config.catalogue.as_deref())
        .await
        .context(CatalogueSnafu)?;

    for scenario in catalogue.select(config.filter.as_deref()) {
        println!(
            "{} ({} rounds, {} mutations)",
            scenario.name.bold(),
            scenario.rounds.len(),
            scenario.mutation_count()
        );
    }
    Ok(())
}

async fn print_fingerprint(root: &Path, output: Option<&Path>) -> Result<(), ApplicationError> {
    let tree = fingerprint(root).await.context(FingerprintSnafu)?;

    match output {
        Some(path) => {
            let mut rendered = tree.to_string();
            if !tree.is_empty() {
                rendered.push('\n');
            }
            compio::fs::write(path, rendered)
                .await
                .0
                .context(WriteFingerprintSnafu {
                    path: path.to_path_buf(),
                })?;
            info!(
                "Wrote {} entries to {}",
                tree.entries().len(),
                path.best_effort_path_display()
            );
        }
        None if tree.is_empty() => {}
        None => println!("{tree}"),
    }
    Ok(())
}

async fn compare_trees(
    config: &RuntimeConfig,
    left: &Path,
    right: &Path,
) -> Result<(), ApplicationError> {
    let converged = ConvergencePoller::new(config.poll)
        .await_convergence(left, right)
        .await
        .context(CompareSnafu)?;

    println!("{} {}", "CONVERGED".green().bold(), TreeSummary::of(&converged));
    Ok(())
}

/// Counts shown after a successful `compare`.
#[derive(Debug, Default, PartialEq, Eq)]
struct TreeSummary {
    files: usize,
    directories: usize,
    bytes: u64,
}

impl TreeSummary {
    fn of(tree: &TreeFingerprint) -> Self {
        tree.entries()
            .iter()
            .fold(Self::default(), |mut summary, entry| {
                match entry.kind() {
                    EntryKind::File => summary.files += 1,
                    EntryKind::Directory => summary.directories += 1,
                }
                summary.bytes += entry.size();
                summary
            })
    }
}

impl fmt::Display for TreeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} directories, {} bytes",
            self.files, self.directories, self.bytes
        )
    }
}

fn print_summary(outcomes: &[ScenarioOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(()) => println!(
                "{} {} ({:.2?})",
                "PASS".green().bold(),
                outcome.name,
                outcome.duration
            ),
            Err(error) => {
                println!(
                    "{} {} ({:.2?})",
                    "FAIL".red().bold(),
                    outcome.name,
                    outcome.duration
                );
                let report = snafu::Report::from_error(error).to_string();
                for line in report.lines() {
                    match DiffTone::of(line) {
                        DiffTone::Removed => println!("    {}", line.red()),
                        DiffTone::Added => println!("    {}", line.green()),
                        DiffTone::Plain => println!("    {line}"),
                    }
                }
            }
        }
    }

    let passed = outcomes.iter().filter(|outcome| outcome.passed()).count();
    let summary = format!("{passed}/{} scenarios passed", outcomes.len());
    if passed == outcomes.len() {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.red().bold());
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DiffTone {
    Plain,
    Removed,
    Added,
}

impl DiffTone {
    fn of(line: &str) -> Self {
        let line = line.trim_start();
        if line.starts_with("- ") {
            DiffTone::Removed
        } else if line.starts_with("+ ") {
            DiffTone::Added
        } else {
            DiffTone::Plain
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Failed to load the scenario catalogue"))]
    CatalogueError { source: CatalogueError },
    #[snafu(display("No scenario matches the filter {:?}", filter))]
    NoScenariosError { filter: Option<String> },
    #[snafu(display(
        "No {} command given; pass --{}-cmd or set {}",
        side,
        side,
        variable
    ))]
    MissingCommandError { side: Side, variable: &'static str },
    #[snafu(display("{} of {} scenarios failed", failed, total))]
    ScenariosFailedError { failed: usize, total: usize },
    #[snafu(display("Failed to fingerprint the tree"))]
    FingerprintError { source: FingerprintError },
    #[snafu(display("Failed to write fingerprint to {}", path.best_effort_path_display()))]
    WriteFingerprintError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Trees did not converge"))]
    CompareError { source: ConvergenceError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::PollConfig;
    use crate::scenario::{CommandTemplate, TreeRoots};
    use crate::supervisor::ShutdownConfig;
    use rstest::rstest;
    use std::{fs, time::Duration};
    use tempfile::TempDir;

    fn config(command: Command, dir: &Path) -> RuntimeConfig {
        RuntimeConfig {
            command,
            client_command: None,
            server_command: None,
            roots: TreeRoots {
                client: dir.join("client"),
                server: dir.join("server"),
            },
            catalogue: None,
            filter: None,
            poll: PollConfig {
                timeout: Duration::from_millis(200),
                interval: Duration::from_millis(20),
            },
            shutdown: ShutdownConfig::default(),
            startup_delay: Duration::ZERO,
        }
    }

    #[rstest]
    #[case("- newfile.txt,file,8,abc", DiffTone::Removed)]
    #[case("      + newemptydir,directory,0,0", DiffTone::Added)]
    #[case("Trees did not converge during round 1", DiffTone::Plain)]
    #[case("-not-a-diff-line", DiffTone::Plain)]
    fn classifies_report_lines(#[case] line: &str, #[case] expected: DiffTone) {
        assert_eq!(DiffTone::of(line), expected);
    }

    #[compio::test]
    async fn fingerprint_is_written_to_output_file() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("newemptydir")).unwrap();
        let output = dir.path().join("fingerprint.txt");

        Application::run(config(
            Command::Fingerprint {
                root,
                output: Some(output.clone()),
            },
            dir.path(),
        ))
        .await
        .unwrap();

        assert_eq!(
            fs::read_to_string(output).unwrap(),
            "newemptydir,directory,0,0\n"
        );
    }

    #[compio::test]
    async fn converged_tree_summary_counts_kinds_and_bytes() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(dir.path().join("test_dir/nested_empty_dir")).unwrap();
        fs::write(dir.path().join("test_dir/file.txt"), "contents").unwrap();
        fs::write(dir.path().join("new file.txt"), "more contents").unwrap();

        let summary = TreeSummary::of(&fingerprint(dir.path()).await.unwrap());

        assert_eq!(
            summary,
            TreeSummary {
                files: 2,
                directories: 2,
                bytes: 21
            }
        );
        assert_eq!(summary.to_string(), "2 files, 2 directories, 21 bytes");
    }

    #[compio::test]
    async fn compare_reports_divergence() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        fs::create_dir_all(&left).unwrap();
        fs::create_dir_all(&right).unwrap();
        fs::write(left.join("newfile.txt"), "contents").unwrap();

        let result = Application::run(config(Command::Compare { left, right }, dir.path())).await;

        assert!(matches!(
            result,
            Err(ApplicationError::CompareError {
                source: ConvergenceError::TimeoutError { .. }
            })
        ));
    }

    #[compio::test]
    async fn run_requires_both_commands() {
        let dir = TempDir::new().expect("Failed to create temp directory");

        let result = Application::run(config(Command::Run, dir.path())).await;

        assert!(matches!(
            result,
            Err(ApplicationError::MissingCommandError {
                side: Side::Server,
                ..
            })
        ));
    }

    #[compio::test]
    async fn unmatched_filter_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = config(Command::Run, dir.path());
        config.filter = Some("no_such_scenario".to_string());

        let result = Application::run(config).await;

        assert!(matches!(
            result,
            Err(ApplicationError::NoScenariosError { .. })
        ));
    }

    #[compio::test]
    async fn failing_scenarios_fail_the_run() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = config(Command::Run, dir.path());
        config.filter = Some("add_empty_dir".to_string());
        config.server_command = Some(CommandTemplate::new("while true; do sleep 0.1; done"));
        config.client_command = Some(CommandTemplate::new("while true; do sleep 0.1; done"));
        config.shutdown.settle_delay = Duration::ZERO;

        let result = Application::run(config).await;

        assert!(matches!(
            result,
            Err(ApplicationError::ScenariosFailedError {
                failed: 1,
                total: 1
            })
        ));
    }
}
