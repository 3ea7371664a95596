//! Test runner adapter: install dependencies and run pytest on the artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::TestRunnerConfig;
use crate::io::process::run_command_with_timeout;

/// Exit code reported for a test run killed by the timeout (as `timeout(1)` does).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Packages to install, already filtered of standard-library modules.
    pub dependencies: Vec<String>,
    pub script_path: PathBuf,
    pub test_path: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Exit code and log of one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub exit_code: i32,
    pub log: String,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the test artifact against the code artifact.
///
/// An `Err` means the runner itself failed (spawn or I/O), which is distinct
/// from tests failing.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport>;
}

/// Runs the configured command template, optionally inside a container.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
    docker_image: Option<String>,
}

impl CommandTestRunner {
    pub fn new(config: &TestRunnerConfig) -> Self {
        Self {
            command: config.command.clone(),
            docker_image: config
                .use_docker
                .then(|| config.docker_image.clone()),
        }
    }

    /// Full argv for `request` after template substitution.
    ///
    /// Substituted values are shell-quoted so a template run through `sh -c`
    /// sees each dependency and path as one word.
    pub fn argv(&self, request: &TestRequest) -> Result<Vec<String>> {
        let deps = shlex::try_join(request.dependencies.iter().map(String::as_str))
            .context("quote dependencies")?;
        let script = shlex::try_quote(&relative_name(&request.workdir, &request.script_path))
            .context("quote script path")?
            .into_owned();
        let tests = shlex::try_quote(&relative_name(&request.workdir, &request.test_path))
            .context("quote test path")?
            .into_owned();
        let command = self.command.iter().map(|arg| {
            arg.replace("{deps}", &deps)
                .replace("{script}", &script)
                .replace("{tests}", &tests)
        });

        Ok(match &self.docker_image {
            Some(image) => {
                let mut argv = vec![
                    "docker".to_string(),
                    "run".to_string(),
                    "--rm".to_string(),
                    "-v".to_string(),
                    format!("{}:/workspace", request.workdir.display()),
                    "-w".to_string(),
                    "/workspace".to_string(),
                    image.clone(),
                ];
                argv.extend(command);
                argv
            }
            None => command.collect(),
        })
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), docker = self.docker_image.is_some()))]
    fn run(&self, request: &TestRequest) -> Result<TestReport> {
        let argv = self.argv(request)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("test command is empty"))?;
        info!(program = %program, deps = ?request.dependencies, "running tests");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .context("run test command")?;

        let mut log = output.combined_log();
        let exit_code = if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "test run timed out");
            log.push_str(&format!(
                "\n[test run timed out after {}s]\n",
                request.timeout.as_secs()
            ));
            TIMEOUT_EXIT_CODE
        } else {
            output.status.code().unwrap_or(-1)
        };

        write_test_log(&request.log_path, &log)?;
        info!(exit_code, log_bytes = log.len(), "test run finished");
        Ok(TestReport { exit_code, log })
    }
}

fn relative_name(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn write_test_log(path: &Path, log: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create test log dir {}", parent.display()))?;
    }
    fs::write(path, log).with_context(|| format!("write test log {}", path.display()))?;
    Ok(())
}
