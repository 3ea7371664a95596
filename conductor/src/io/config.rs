//! Pipeline configuration stored in `conductor.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::CycleGuard;
use crate::core::extract::PriceScan;
use crate::core::termination::TerminationRules;
use crate::core::types::WorkerRole;

pub const DEFAULT_CONFIG_FILE: &str = "conductor.toml";

/// Pipeline configuration (TOML).
///
/// Intended to be edited by humans. Every table is `#[serde(default)]`, so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run directory. Exclusive to one run at a time.
    pub workspace_dir: PathBuf,
    pub script_name: String,
    pub tests_name: String,
    /// Improvement-loop iteration bound (the final check pass is extra).
    pub max_improvement_loops: u32,
    pub invoker: InvokerConfig,
    pub workers: WorkersConfig,
    pub extraction: ExtractionConfig,
    pub classifier: ClassifierConfig,
    pub test_runner: TestRunnerConfig,
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InvokerConfig {
    pub max_retries: u32,
    pub max_turns: u32,
    /// Length of the bad-reply excerpt quoted in corrective prompts.
    pub excerpt_chars: usize,
    pub min_reply_chars: usize,
    pub end_token: String,
    pub leak_markers: Vec<String>,
    pub prompt_budget_bytes: usize,
    /// Worker stdout beyond this many bytes is discarded.
    pub reply_limit_bytes: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_turns: 1,
            excerpt_chars: 300,
            min_reply_chars: 10,
            end_token: "TERMINATE".to_string(),
            leak_markers: ["<think>", "Okay, let", "Let me", "I need to", "Sure,"]
                .into_iter()
                .map(String::from)
                .collect(),
            prompt_budget_bytes: 40_000,
            reply_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command that reads the conversation on stdin and prints the reply.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

impl WorkerConfig {
    fn ollama(model: &str) -> Self {
        Self {
            command: vec!["ollama".to_string(), "run".to_string(), model.to_string()],
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
            max_retries: None,
            max_turns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    pub planner: WorkerConfig,
    pub extractor: WorkerConfig,
    pub coder: WorkerConfig,
    pub reviewer: WorkerConfig,
    pub writer: WorkerConfig,
    pub arbiter: WorkerConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let code_model = "qwen2.5-coder:32b";
        let text_model = "qwen2.5:32b";
        Self {
            planner: WorkerConfig::ollama(code_model),
            extractor: WorkerConfig {
                max_retries: Some(2),
                max_turns: Some(3),
                ..WorkerConfig::ollama(text_model)
            },
            coder: WorkerConfig::ollama(code_model),
            reviewer: WorkerConfig::ollama(code_model),
            writer: WorkerConfig::ollama(text_model),
            arbiter: WorkerConfig::ollama(text_model),
        }
    }
}

impl WorkersConfig {
    pub fn get(&self, role: WorkerRole) -> &WorkerConfig {
        match role {
            WorkerRole::Planner => &self.planner,
            WorkerRole::Extractor => &self.extractor,
            WorkerRole::Coder => &self.coder,
            WorkerRole::Reviewer => &self.reviewer,
            WorkerRole::Writer => &self.writer,
            WorkerRole::Arbiter => &self.arbiter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Substituted when the extractor never produced a valid price.
    pub fallback_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub currency_tokens: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fallback_price: 139_990.0,
            min_price: 50_000.0,
            max_price: 300_000.0,
            currency_tokens: ["руб", "₽", "RUB", "rub"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub fingerprint_prefix_chars: usize,
    pub assertion_streak: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fingerprint_prefix_chars: 200,
            assertion_streak: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestRunnerConfig {
    /// Command template. `{deps}`, `{script}` and `{tests}` are substituted per
    /// argument as shell-quoted words.
    pub command: Vec<String>,
    /// Run the command inside `docker_image` with the workspace mounted at
    /// `/workspace`. `false` runs generated code directly on the host.
    pub use_docker: bool,
    pub docker_image: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for TestRunnerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "pip install -q --no-cache-dir {deps} && PYTHONPATH=. python -m pytest {tests} -v --tb=short"
                    .to_string(),
            ],
            use_docker: true,
            docker_image: "python:3.11".to_string(),
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsageConfig {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            input_cost_per_token: 0.0002,
            output_cost_per_token: 0.0002,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            script_name: "generated_script.py".to_string(),
            tests_name: "test_generated_script.py".to_string(),
            max_improvement_loops: 15,
            invoker: InvokerConfig::default(),
            workers: WorkersConfig::default(),
            extraction: ExtractionConfig::default(),
            classifier: ClassifierConfig::default(),
            test_runner: TestRunnerConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

/// Resolved per-call bounds for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBounds {
    pub max_retries: u32,
    pub max_turns: u32,
    pub timeout: Duration,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace_dir.as_os_str().is_empty() {
            return Err(anyhow!("workspace_dir must not be empty"));
        }
        if self.script_name.trim().is_empty() || self.tests_name.trim().is_empty() {
            return Err(anyhow!("script_name and tests_name must not be empty"));
        }
        if self.script_name == self.tests_name {
            return Err(anyhow!("script_name and tests_name must differ"));
        }
        if self.max_improvement_loops == 0 {
            return Err(anyhow!("max_improvement_loops must be > 0"));
        }
        if self.invoker.max_retries == 0 {
            return Err(anyhow!("invoker.max_retries must be > 0"));
        }
        if self.invoker.max_turns == 0 {
            return Err(anyhow!("invoker.max_turns must be > 0"));
        }
        if self.invoker.prompt_budget_bytes == 0 || self.invoker.reply_limit_bytes == 0 {
            return Err(anyhow!(
                "invoker.prompt_budget_bytes and invoker.reply_limit_bytes must be > 0"
            ));
        }
        for role in WorkerRole::ALL {
            let worker = self.workers.get(role);
            if worker.command.is_empty() || worker.command[0].trim().is_empty() {
                return Err(anyhow!("workers.{role}.command must be a non-empty array"));
            }
            if worker.timeout_secs == 0 {
                return Err(anyhow!("workers.{role}.timeout_secs must be > 0"));
            }
            if worker.max_retries == Some(0) || worker.max_turns == Some(0) {
                return Err(anyhow!("workers.{role} bounds must be > 0"));
            }
        }
        if self.extraction.min_price > self.extraction.max_price {
            return Err(anyhow!(
                "extraction.min_price must not exceed extraction.max_price"
            ));
        }
        if self.classifier.assertion_streak == 0 {
            return Err(anyhow!("classifier.assertion_streak must be > 0"));
        }
        if self.test_runner.command.is_empty() || self.test_runner.command[0].trim().is_empty() {
            return Err(anyhow!("test_runner.command must be a non-empty array"));
        }
        if self.test_runner.use_docker && self.test_runner.docker_image.trim().is_empty() {
            return Err(anyhow!(
                "test_runner.docker_image must be set when test_runner.use_docker is true"
            ));
        }
        if self.test_runner.timeout_secs == 0 {
            return Err(anyhow!("test_runner.timeout_secs must be > 0"));
        }
        if self.test_runner.output_limit_bytes == 0 {
            return Err(anyhow!("test_runner.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Retry/turn/timeout bounds for `role`, with worker overrides applied.
    pub fn bounds_for(&self, role: WorkerRole) -> CallBounds {
        let worker = self.workers.get(role);
        CallBounds {
            max_retries: worker.max_retries.unwrap_or(self.invoker.max_retries),
            max_turns: worker.max_turns.unwrap_or(self.invoker.max_turns),
            timeout: Duration::from_secs(worker.timeout_secs),
        }
    }

    pub fn termination_rules(&self) -> TerminationRules {
        TerminationRules {
            end_token: self.invoker.end_token.clone(),
            min_reply_chars: self.invoker.min_reply_chars,
            leak_markers: self.invoker.leak_markers.clone(),
        }
    }

    pub fn price_scan(&self) -> PriceScan {
        PriceScan {
            min_price: self.extraction.min_price,
            max_price: self.extraction.max_price,
            currency_tokens: self.extraction.currency_tokens.clone(),
        }
    }

    pub fn cycle_guard(&self) -> CycleGuard {
        CycleGuard::new(
            self.classifier.assertion_streak,
            self.classifier.fingerprint_prefix_chars,
        )
    }

    /// Python module name of the code artifact (`generated_script.py` -> `generated_script`).
    pub fn script_module(&self) -> String {
        Path::new(&self.script_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.script_name.clone())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
