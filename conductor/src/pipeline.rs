//! One pipeline run: plan, extract data, generate, review, improve, document,
//! finalize.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use minijinja::context;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::classifier::CycleGuard;
use crate::core::schema::{
    CodeReview, Documentation, ExtractedPrice, GeneratedCode, Payload, Plan,
};
use crate::core::types::WorkerRole;
use crate::core::usage::{UsageLedger, UsageReport, WorkerCost};
use crate::improve::{Controller, IterationRecord, LoopInputs, LoopOutcome, LoopState};
use crate::invoker::{InvokeError, Invoker, Validated};
use crate::io::artifacts::{WorkspacePaths, persist_pair, render_readme, write_json, write_text};
use crate::io::config::PipelineConfig;
use crate::io::test_runner::TestRunner;
use crate::io::transport::WorkerTransport;
use crate::phases::{Phase, Step};

/// An explicit safe default used in place of a worker's payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fallback {
    pub phase: Phase,
    pub worker: WorkerRole,
    pub substituted: String,
    pub reason: String,
}

/// Mutable state of the single active run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub phase: Phase,
    pub plan: Option<Plan>,
    pub price: Option<f64>,
    pub code: Option<GeneratedCode>,
    pub review: Option<CodeReview>,
    pub documentation: Option<Documentation>,
    pub guard: CycleGuard,
    pub usage: UsageLedger,
    pub fallbacks: Vec<Fallback>,
}

impl PipelineState {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            phase: Phase::Planning,
            plan: None,
            price: None,
            code: None,
            review: None,
            documentation: None,
            guard: config.cycle_guard(),
            usage: UsageLedger::new(),
            fallbacks: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!(phase = %phase, "entering phase");
    }

    fn substitute(&mut self, step: Step, substituted: String, reason: String) {
        let spec = step.spec();
        warn!(
            phase = %spec.phase,
            worker = %spec.worker,
            substituted = %substituted,
            reason = %reason,
            "substituting safe default"
        );
        self.fallbacks.push(Fallback {
            phase: spec.phase,
            worker: spec.worker,
            substituted,
            reason,
        });
    }
}

/// Summary of a finished run, also written as `run_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task: String,
    pub workspace: PathBuf,
    pub converged: bool,
    /// Whether the final testing pass exited 0.
    pub passed: bool,
    pub loop_state: LoopState,
    pub testing_passes: u32,
    pub escalations: u32,
    pub fallbacks: Vec<Fallback>,
    pub history: Vec<IterationRecord>,
    pub usage: WorkerCost,
}

/// Execute the fixed phase sequence for `task`.
///
/// Returns an error only for fatal conditions: invalid configuration, an
/// unreachable worker, no code or no review, or artifact writes failing.
/// Non-convergence is reported, not raised.
#[instrument(skip_all, fields(workspace = %config.workspace_dir.display()))]
pub fn run<T: WorkerTransport, R: TestRunner>(
    task: &str,
    config: &PipelineConfig,
    transport: &T,
    runner: &R,
) -> Result<RunReport> {
    config.validate()?;
    let task = task.trim();
    if task.is_empty() {
        bail!("task must not be empty");
    }

    let paths = WorkspacePaths::new(config);
    paths.ensure_dirs()?;
    let invoker = Invoker::new(transport, config);
    let mut state = PipelineState::new(config);
    info!(task_chars = task.chars().count(), "pipeline run started");

    let plan = plan_phase(&invoker, task, &mut state)?;
    let price = extraction_phase(&invoker, config, task, &plan, &mut state)?;

    state.enter(Phase::CodeGeneration);
    let step = Step::GenerateCode;
    let prompt = invoker.render(
        step,
        context! {
            task => task,
            steps => plan.steps,
            price => price,
            dependencies => plan.dependencies,
        },
    );
    let code = invoker
        .invoke::<GeneratedCode>(step, prompt, &mut state.usage)
        .with_context(|| format!("{} phase failed", Phase::CodeGeneration))?
        .payload;
    write_text(&paths.script_path, &code.code)?;
    state.code = Some(code.clone());

    state.enter(Phase::Review);
    let step = Step::ReviewCode;
    let prompt = invoker.render(
        step,
        context! {
            module => config.script_module(),
            task => task,
            description => code.description,
            code => code.code,
        },
    );
    let review = invoker
        .invoke::<CodeReview>(step, prompt, &mut state.usage)
        .with_context(|| format!("{} phase failed", Phase::Review))?
        .payload;
    persist_pair(&paths, &code.code, &review.test_code)?;
    state.review = Some(review.clone());

    state.enter(Phase::Improvement);
    let inputs = LoopInputs {
        task,
        dependencies: &plan.dependencies,
        paths: &paths,
    };
    let outcome = Controller::new(&invoker, runner, config, inputs).run(
        code,
        review,
        &mut state.guard,
        &mut state.usage,
    )?;
    state.code = Some(outcome.code.clone());
    state.review = Some(outcome.review.clone());

    let documentation = documentation_phase(&invoker, task, &outcome, &mut state)?;

    state.enter(Phase::Finalization);
    finalize(config, &paths, task, &outcome, &documentation, state)
}

fn plan_phase<T: WorkerTransport>(
    invoker: &Invoker<'_, T>,
    task: &str,
    state: &mut PipelineState,
) -> Result<Plan> {
    state.enter(Phase::Planning);
    let step = Step::Plan;
    let prompt = invoker.render(step, context! { task => task });
    let result = invoker.invoke::<Plan>(step, prompt, &mut state.usage);
    let plan = settle_or(result, state, step, || {
        (Plan::single_step(task), "single-step plan".to_string())
    })?;
    info!(
        steps = plan.steps.len(),
        data_query = plan.data_query().is_some(),
        dependencies = plan.dependencies.len(),
        "plan ready"
    );
    state.plan = Some(plan.clone());
    Ok(plan)
}

/// Look up external data when the plan asks for it.
fn extraction_phase<T: WorkerTransport>(
    invoker: &Invoker<'_, T>,
    config: &PipelineConfig,
    task: &str,
    plan: &Plan,
    state: &mut PipelineState,
) -> Result<Option<f64>> {
    let Some(query) = plan.data_query() else {
        return Ok(None);
    };
    state.enter(Phase::DataExtraction);
    let step = Step::ExtractPrice;
    let fallback = config.extraction.fallback_price;
    let prompt = invoker.render(step, context! { query => query, task => task });
    let result = invoker.invoke::<ExtractedPrice>(step, prompt, &mut state.usage);
    let extracted = settle_or(result, state, step, || {
        (
            ExtractedPrice {
                price: Some(fallback),
            },
            format!("price {fallback}"),
        )
    })?;

    let price = match extracted.price {
        Some(price) => price,
        None => {
            state.substitute(
                step,
                format!("price {fallback}"),
                "the worker reported no price".to_string(),
            );
            fallback
        }
    };
    info!(price, "price ready");
    state.price = Some(price);
    Ok(Some(price))
}

fn documentation_phase<T: WorkerTransport>(
    invoker: &Invoker<'_, T>,
    task: &str,
    outcome: &LoopOutcome,
    state: &mut PipelineState,
) -> Result<Documentation> {
    state.enter(Phase::Documentation);
    let step = Step::Document;
    let prompt = invoker.render(
        step,
        context! {
            task => task,
            comments => outcome.review.comments,
            description => outcome.code.description,
            code => outcome.code.code,
        },
    );
    let result = invoker.invoke::<Documentation>(step, prompt, &mut state.usage);
    let documentation = settle_or(result, state, step, || {
        (
            Documentation::from_code(&outcome.code),
            "documentation from the code description".to_string(),
        )
    })?;
    state.documentation = Some(documentation.clone());
    Ok(documentation)
}

fn finalize(
    config: &PipelineConfig,
    paths: &WorkspacePaths,
    task: &str,
    outcome: &LoopOutcome,
    documentation: &Documentation,
    state: PipelineState,
) -> Result<RunReport> {
    persist_pair(paths, &outcome.code.code, &outcome.review.test_code)?;
    write_text(
        &paths.readme_path,
        &render_readme(documentation, &outcome.review),
    )?;

    let usage: UsageReport = state.usage.report(
        config.usage.input_cost_per_token,
        config.usage.output_cost_per_token,
    );
    write_json(&paths.usage_path, &usage)?;

    let report = RunReport {
        task: task.to_string(),
        workspace: paths.root.clone(),
        converged: outcome.converged(),
        passed: outcome.passed,
        loop_state: outcome.state,
        testing_passes: outcome.testing_passes,
        escalations: outcome.escalations,
        fallbacks: state.fallbacks,
        history: outcome.history.clone(),
        usage: usage.totals,
    };
    write_json(&paths.report_path, &report)?;
    info!(
        converged = report.converged,
        passed = report.passed,
        testing_passes = report.testing_passes,
        fallbacks = report.fallbacks.len(),
        "pipeline run finished"
    );
    Ok(report)
}

/// Take the payload, or on exhaustion substitute `fallback` and log it.
fn settle_or<P: Payload>(
    result: std::result::Result<Validated<P>, InvokeError>,
    state: &mut PipelineState,
    step: Step,
    fallback: impl FnOnce() -> (P, String),
) -> Result<P> {
    match result {
        Ok(validated) => Ok(validated.payload),
        Err(err @ InvokeError::Exhausted { .. }) => {
            let (payload, substituted) = fallback();
            state.substitute(step, substituted, err.to_string());
            Ok(payload)
        }
        Err(err) => Err(err).with_context(|| format!("{} phase failed", step.spec().phase)),
    }
}
