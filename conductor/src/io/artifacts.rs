//! Run artifacts inside the workspace directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::schema::{CodeReview, Documentation};
use crate::io::config::{PipelineConfig, write_atomic};

/// Canonical file paths for one run.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub script_path: PathBuf,
    pub tests_path: PathBuf,
    pub readme_path: PathBuf,
    pub report_path: PathBuf,
    pub usage_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(config: &PipelineConfig) -> Self {
        let root = config.workspace_dir.clone();
        Self {
            script_path: root.join(&config.script_name),
            tests_path: root.join(&config.tests_name),
            readme_path: root.join("README.md"),
            report_path: root.join("run_report.json"),
            usage_path: root.join("usage.json"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Log file for the testing pass with this number.
    pub fn test_log_path(&self, pass: u32) -> PathBuf {
        self.logs_dir.join(format!("test_{pass}.log"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("create workspace {}", self.logs_dir.display()))
    }
}

/// Write the current code and test artifacts.
pub fn persist_pair(paths: &WorkspacePaths, code: &str, tests: &str) -> Result<()> {
    write_text(&paths.script_path, code)?;
    write_text(&paths.tests_path, tests)?;
    debug!(
        script = %paths.script_path.display(),
        tests = %paths.tests_path.display(),
        "persisted code and tests"
    );
    Ok(())
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    write_atomic(path, contents.as_bytes())
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, payload.as_bytes())
}

/// README assembled from the documentation payload and the last review.
pub fn render_readme(docs: &Documentation, review: &CodeReview) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", docs.title.trim()));
    if !docs.description.trim().is_empty() {
        out.push_str(docs.description.trim());
        out.push_str("\n\n");
    }

    if !docs.usage_examples.is_empty() {
        out.push_str("## Usage\n\n");
        for example in &docs.usage_examples {
            out.push_str("```python\n");
            out.push_str(example.trim());
            out.push_str("\n```\n\n");
        }
    }

    if !docs.api_documentation.trim().is_empty() {
        out.push_str("## API\n\n");
        out.push_str(docs.api_documentation.trim());
        out.push_str("\n\n");
    }

    push_list(&mut out, "Review Comments", &review.comments);
    push_list(&mut out, "Suggested Improvements", &review.improvements);

    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out.push('\n');
    out
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    let items: Vec<&str> = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("## {heading}\n\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
    out.push('\n');
}
