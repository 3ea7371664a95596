//! Multi-worker code generation pipeline.
//!
//! Turns a natural-language task into a Python module plus passing tests by
//! driving planner, extractor, coder, reviewer, arbiter and writer workers
//! through a fixed phase sequence.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::Value;

use conductor::core::extract::extract_candidate;
use conductor::core::schema::{SchemaKind, validate_value};
use conductor::exit_codes;
use conductor::io::config::{DEFAULT_CONFIG_FILE, PipelineConfig, load_config, write_config};
use conductor::io::test_runner::CommandTestRunner;
use conductor::io::transport::CommandTransport;
use conductor::logging;
use conductor::pipeline::{RunReport, run};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Drive text-generating workers from a task to tested code"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default `conductor.toml`.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Run the full pipeline for one task.
    #[command(group(ArgGroup::new("input").required(true).args(["task", "task_file"])))]
    Run {
        /// Task text.
        #[arg(long)]
        task: Option<String>,
        /// Read the task text from a file.
        #[arg(long)]
        task_file: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Override `workspace_dir`.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Override `max_improvement_loops`.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Log pipeline progress to stderr.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Extract and validate a payload from a saved worker reply.
    Extract {
        #[arg(long)]
        schema: SchemaKind,
        /// Reply file; stdin when omitted.
        file: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Command::Run { verbose: true, .. });
    logging::init(verbose);

    match dispatch(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Run {
            task,
            task_file,
            config,
            workspace,
            max_iterations,
            verbose: _,
        } => {
            let task = read_task(task, task_file.as_deref())?;
            let mut cfg = load_config(&config)?;
            if let Some(workspace) = workspace {
                cfg.workspace_dir = workspace;
            }
            if let Some(max_iterations) = max_iterations {
                cfg.max_improvement_loops = max_iterations;
            }
            cmd_run(&task, &cfg)
        }
        Command::Extract {
            schema,
            file,
            config,
        } => cmd_extract(schema, file.as_deref(), &config),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        eprintln!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
        return Ok(exit_codes::OK);
    }
    write_config(path, &PipelineConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(task: &str, config: &PipelineConfig) -> Result<i32> {
    let transport = CommandTransport::new(config);
    let runner = CommandTestRunner::new(&config.test_runner);
    let report = run(task, config, &transport, &runner)?;
    print_summary(&report);
    Ok(if report.converged {
        exit_codes::OK
    } else {
        exit_codes::NOT_CONVERGED
    })
}

fn cmd_extract(schema: SchemaKind, file: Option<&Path>, config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let reply = match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read reply from stdin")?;
            buf
        }
    };

    let extraction = extract_candidate(&reply, schema, &cfg.price_scan())?;
    let value: Value = serde_json::from_str(&extraction.candidate)
        .with_context(|| format!("candidate found by {:?} is not JSON", extraction.strategy))?;
    validate_value(&value, schema).with_context(|| format!("invalid {schema} payload"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&value).context("serialize payload")?
    );
    Ok(exit_codes::OK)
}

fn read_task(task: Option<String>, task_file: Option<&Path>) -> Result<String> {
    let text = match (task, task_file) {
        (Some(task), _) => task,
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => bail!("either --task or --task-file is required"),
    };
    if text.trim().is_empty() {
        bail!("task must not be empty");
    }
    Ok(text)
}

fn print_summary(report: &RunReport) {
    let status = if report.converged {
        "converged"
    } else if report.passed {
        "not converged (final check passed)"
    } else {
        "not converged (final check failed)"
    };
    println!("status: {status}");
    println!(
        "testing passes: {}, escalations: {}",
        report.testing_passes, report.escalations
    );
    for fallback in &report.fallbacks {
        println!(
            "fallback: {} ({}) used {}",
            fallback.phase, fallback.worker, fallback.substituted
        );
    }
    println!(
        "tokens: {} in / {} out over {} calls, cost {:.4}",
        report.usage.usage.input_tokens,
        report.usage.usage.output_tokens,
        report.usage.usage.calls,
        report.usage.cost
    );
    println!("artifacts: {}", report.workspace.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["conductor", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false, .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["conductor", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "conductor",
            "run",
            "--task",
            "double a number",
            "--workspace",
            "out",
            "--max-iterations",
            "4",
            "--verbose",
        ]);
        match cli.command {
            Command::Run {
                task,
                workspace,
                max_iterations,
                verbose,
                ..
            } => {
                assert_eq!(task.as_deref(), Some("double a number"));
                assert_eq!(workspace, Some(PathBuf::from("out")));
                assert_eq!(max_iterations, Some(4));
                assert!(verbose);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_exactly_one_task_source() {
        assert!(Cli::try_parse_from(["conductor", "run"]).is_err());
        assert!(
            Cli::try_parse_from(["conductor", "run", "--task", "a", "--task-file", "b"]).is_err()
        );
    }

    #[test]
    fn parse_extract_schema_name() {
        let cli = Cli::parse_from(["conductor", "extract", "--schema", "generated_code", "reply.txt"]);
        match cli.command {
            Command::Extract { schema, file, .. } => {
                assert_eq!(schema, SchemaKind::GeneratedCode);
                assert_eq!(file, Some(PathBuf::from("reply.txt")));
            }
            _ => panic!("expected extract"),
        }
        assert!(Cli::try_parse_from(["conductor", "extract", "--schema", "nope"]).is_err());
    }

    #[test]
    fn task_file_is_read_and_blank_task_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.txt");
        fs::write(&path, "double a number\n").expect("write");
        assert_eq!(read_task(None, Some(&path)).expect("task"), "double a number\n");
        assert!(read_task(Some("  ".to_string()), None).is_err());
    }
}
