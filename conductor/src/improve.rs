//! Improvement loop: test, classify the failure, fix or escalate, repeat.
//!
//! Each iteration runs exactly one testing pass. A failing pass is answered by
//! one bounded remedy (an import fix from the coder, or an arbiter ruling
//! followed by the assigned worker's fix) before the next pass. After the
//! iteration bound, or when a remedy cannot be obtained, one final testing
//! pass reports the true state of the artifacts.

use std::time::Duration;

use anyhow::Result;
use minijinja::context;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::classifier::{CycleGuard, FailureAssessment, FailureCategory, ForcedEscalation};
use crate::core::dependencies::install_list;
use crate::core::imports::ensure_test_imports;
use crate::core::schema::{CodeReview, GeneratedCode, Payload, ProblemSolution, TargetAgent};
use crate::core::usage::UsageLedger;
use crate::invoker::{InvokeError, Invoker, Validated};
use crate::io::artifacts::{WorkspacePaths, persist_pair};
use crate::io::config::PipelineConfig;
use crate::io::test_runner::{TestReport, TestRequest, TestRunner};
use crate::io::transport::WorkerTransport;
use crate::phases::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Testing,
    Fixing,
    Escalating,
    Converged,
    Abandoned,
}

/// Why a failure went to the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The same failure fingerprint was seen earlier in this run.
    RepeatedFailure,
    /// Too many assertion failures in a row.
    AssertionStreak,
    AssertionFailure,
    UnclassifiedFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    FixImports,
    Escalate(EscalationReason),
}

/// Pick the remedy for a failing run. Cycle-guard overrides win over the category.
pub fn choose_remedy(assessment: &FailureAssessment) -> Remedy {
    match (assessment.forced, assessment.category) {
        (Some(ForcedEscalation::RepeatedFingerprint), _) => {
            Remedy::Escalate(EscalationReason::RepeatedFailure)
        }
        (Some(ForcedEscalation::AssertionStreak), _) => {
            Remedy::Escalate(EscalationReason::AssertionStreak)
        }
        (None, FailureCategory::ImportError) => Remedy::FixImports,
        (None, FailureCategory::AssertionError) => {
            Remedy::Escalate(EscalationReason::AssertionFailure)
        }
        (None, FailureCategory::Other) => Remedy::Escalate(EscalationReason::UnclassifiedFailure),
    }
}

/// What happened after one testing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationAction {
    Passed,
    FixedImports,
    Escalated {
        reason: EscalationReason,
        target: TargetAgent,
    },
    /// The test runner itself failed; nothing was learned about the code.
    RunnerFault { message: String },
    /// A remedy call exhausted its retries; the loop stops iterating.
    GaveUp { step: Step },
    FinalCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationRecord {
    /// Testing pass number, 1-based.
    pub iteration: u32,
    pub exit_code: Option<i32>,
    pub category: Option<FailureCategory>,
    pub action: IterationAction,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub code: GeneratedCode,
    /// Last review; `test_code` is the import-fixed test artifact.
    pub review: CodeReview,
    pub state: LoopState,
    /// Whether the last testing pass exited 0.
    pub passed: bool,
    pub testing_passes: u32,
    pub escalations: u32,
    pub history: Vec<IterationRecord>,
}

impl LoopOutcome {
    pub fn converged(&self) -> bool {
        self.state == LoopState::Converged
    }
}

/// Inputs fixed for the whole loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopInputs<'a> {
    pub task: &'a str,
    pub dependencies: &'a [String],
    pub paths: &'a WorkspacePaths,
}

pub struct Controller<'a, T: WorkerTransport, R: TestRunner> {
    invoker: &'a Invoker<'a, T>,
    runner: &'a R,
    config: &'a PipelineConfig,
    inputs: LoopInputs<'a>,
    module: String,
    install: Vec<String>,
    state: LoopState,
    testing_passes: u32,
    escalations: u32,
    history: Vec<IterationRecord>,
}

impl<'a, T: WorkerTransport, R: TestRunner> Controller<'a, T, R> {
    pub fn new(
        invoker: &'a Invoker<'a, T>,
        runner: &'a R,
        config: &'a PipelineConfig,
        inputs: LoopInputs<'a>,
    ) -> Self {
        Self {
            invoker,
            runner,
            config,
            module: config.script_module(),
            install: install_list(inputs.dependencies),
            inputs,
            state: LoopState::Testing,
            testing_passes: 0,
            escalations: 0,
            history: Vec::new(),
        }
    }

    /// Drive the loop to convergence or abandonment.
    ///
    /// Errors are fatal only: artifact writes failing or an unreachable worker.
    #[instrument(skip_all, fields(max_iterations = self.config.max_improvement_loops))]
    pub fn run(
        mut self,
        mut code: GeneratedCode,
        mut review: CodeReview,
        guard: &mut CycleGuard,
        usage: &mut UsageLedger,
    ) -> Result<LoopOutcome> {
        let mut passed = false;

        for iteration in 1..=self.config.max_improvement_loops {
            self.state = LoopState::Testing;
            let Some(report) = self.testing_pass(&code, &mut review)? else {
                continue;
            };
            if report.passed() {
                guard.record_success();
                passed = true;
                self.state = LoopState::Converged;
                self.record(&report, None, IterationAction::Passed);
                info!(iteration, "tests passed, loop converged");
                break;
            }

            let assessment = guard.assess(&report.log);
            let remedy = choose_remedy(&assessment);
            info!(
                iteration,
                exit_code = report.exit_code,
                category = ?assessment.category,
                forced = ?assessment.forced,
                remedy = ?remedy,
                "tests failed"
            );

            let action = match remedy {
                Remedy::FixImports => {
                    self.state = LoopState::Fixing;
                    self.fix_imports(&mut code, &review, &report, usage)?
                }
                Remedy::Escalate(reason) => {
                    self.state = LoopState::Escalating;
                    self.escalations += 1;
                    self.escalate(reason, &mut code, &mut review, &report, &assessment, usage)?
                }
            };
            let gave_up = matches!(action, IterationAction::GaveUp { .. });
            self.record(&report, Some(assessment.category), action);
            if gave_up {
                break;
            }
        }

        if self.state != LoopState::Converged {
            self.state = LoopState::Abandoned;
            warn!(
                testing_passes = self.testing_passes,
                "loop did not converge, running final check"
            );
            if let Some(report) = self.testing_pass(&code, &mut review)? {
                passed = report.passed();
                let category = (!passed).then(|| guard.assess(&report.log).category);
                self.record(&report, category, IterationAction::FinalCheck);
            }
        }

        Ok(LoopOutcome {
            code,
            review,
            state: self.state,
            passed,
            testing_passes: self.testing_passes,
            escalations: self.escalations,
            history: self.history,
        })
    }

    /// Persist the artifacts and run the tests once. `None` means a runner fault.
    fn testing_pass(
        &mut self,
        code: &GeneratedCode,
        review: &mut CodeReview,
    ) -> Result<Option<TestReport>> {
        self.testing_passes += 1;
        let pass = self.testing_passes;
        let paths = self.inputs.paths;

        review.test_code = ensure_test_imports(&code.code, &review.test_code, &self.module);
        persist_pair(paths, &code.code, &review.test_code)?;

        let request = TestRequest {
            workdir: paths.root.clone(),
            dependencies: self.install.clone(),
            script_path: paths.script_path.clone(),
            test_path: paths.tests_path.clone(),
            log_path: paths.test_log_path(pass),
            timeout: Duration::from_secs(self.config.test_runner.timeout_secs),
            output_limit_bytes: self.config.test_runner.output_limit_bytes,
        };
        match self.runner.run(&request) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(pass, error = %message, "test runner fault");
                self.history.push(IterationRecord {
                    iteration: pass,
                    exit_code: None,
                    category: None,
                    action: IterationAction::RunnerFault { message },
                });
                Ok(None)
            }
        }
    }

    fn fix_imports(
        &self,
        code: &mut GeneratedCode,
        review: &CodeReview,
        report: &TestReport,
        usage: &mut UsageLedger,
    ) -> Result<IterationAction> {
        let step = Step::FixImports;
        let prompt = self.invoker.render(
            step,
            context! {
                module => self.module,
                code => code.code,
                tests => review.test_code,
                log => report.log,
            },
        );
        Ok(match settle(step, self.invoker.invoke(step, prompt, usage))? {
            Some(fixed) => {
                *code = fixed;
                IterationAction::FixedImports
            }
            None => IterationAction::GaveUp { step },
        })
    }

    /// Ask the arbiter who is wrong, then forward its instructions verbatim.
    fn escalate(
        &self,
        reason: EscalationReason,
        code: &mut GeneratedCode,
        review: &mut CodeReview,
        report: &TestReport,
        assessment: &FailureAssessment,
        usage: &mut UsageLedger,
    ) -> Result<IterationAction> {
        let step = Step::Arbitrate;
        let prompt = self.invoker.render(
            step,
            context! {
                task => self.inputs.task,
                code => code.code,
                tests => review.test_code,
                log => report.log,
                category => assessment.category,
            },
        );
        let Some(ruling) = settle::<ProblemSolution>(step, self.invoker.invoke(step, prompt, usage))?
        else {
            return Ok(IterationAction::GaveUp { step });
        };
        info!(
            reason = ?reason,
            target = ?ruling.target_agent,
            "arbiter assigned the fix"
        );

        let target = ruling.target_agent;
        match target {
            TargetAgent::Coder => {
                let step = Step::ApplyCoderFix;
                let prompt = self.invoker.render(
                    step,
                    context! {
                        instructions => ruling.instructions,
                        expected_outcome => ruling.expected_outcome,
                        analysis => ruling.analysis,
                        tests => review.test_code,
                        code => code.code,
                    },
                );
                match settle(step, self.invoker.invoke(step, prompt, usage))? {
                    Some(fixed) => *code = fixed,
                    None => return Ok(IterationAction::GaveUp { step }),
                }
            }
            TargetAgent::Reviewer => {
                let step = Step::ApplyReviewerFix;
                let prompt = self.invoker.render(
                    step,
                    context! {
                        module => self.module,
                        instructions => ruling.instructions,
                        expected_outcome => ruling.expected_outcome,
                        analysis => ruling.analysis,
                        code => code.code,
                        tests => review.test_code,
                    },
                );
                match settle(step, self.invoker.invoke(step, prompt, usage))? {
                    Some(fixed) => *review = fixed,
                    None => return Ok(IterationAction::GaveUp { step }),
                }
            }
        }
        Ok(IterationAction::Escalated { reason, target })
    }

    fn record(
        &mut self,
        report: &TestReport,
        category: Option<FailureCategory>,
        action: IterationAction,
    ) {
        self.history.push(IterationRecord {
            iteration: self.testing_passes,
            exit_code: Some(report.exit_code),
            category,
            action,
        });
    }
}

/// Exhaustion ends the remedy (`None`); transport faults propagate.
fn settle<P: Payload>(
    step: Step,
    result: std::result::Result<Validated<P>, InvokeError>,
) -> Result<Option<P>> {
    match result {
        Ok(validated) => Ok(Some(validated.payload)),
        Err(err @ InvokeError::Exhausted { .. }) => {
            warn!(step = %step, error = %err, "remedy call exhausted, stopping the loop");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::ErrorFingerprint;
    use crate::core::types::WorkerRole;
    use crate::test_support::{ScriptedRun, ScriptedTestRunner, ScriptedTransport, TestWorkspace};

    const IMPORT_LOG: &str =
        "E   ImportError: cannot import name 'double' from 'generated_script'";

    fn code(body: &str) -> GeneratedCode {
        GeneratedCode {
            description: "doubles".to_string(),
            code: body.to_string(),
        }
    }

    fn review(tests: &str) -> CodeReview {
        CodeReview {
            comments: Vec::new(),
            test_code: tests.to_string(),
            improvements: Vec::new(),
        }
    }

    fn assessment(category: FailureCategory, forced: Option<ForcedEscalation>) -> FailureAssessment {
        FailureAssessment {
            category,
            fingerprint: ErrorFingerprint::new(category, "log", 200),
            forced,
        }
    }

    struct Fixture {
        workspace: TestWorkspace,
        config: PipelineConfig,
        paths: WorkspacePaths,
        transport: ScriptedTransport,
        runner: ScriptedTestRunner,
    }

    impl Fixture {
        fn new(max_iterations: u32) -> Self {
            let workspace = TestWorkspace::new().expect("workspace");
            let mut config = workspace.config();
            config.max_improvement_loops = max_iterations;
            let paths = WorkspacePaths::new(&config);
            Self {
                workspace,
                config,
                paths,
                transport: ScriptedTransport::new(),
                runner: ScriptedTestRunner::new(),
            }
        }

        fn run(&self, code: GeneratedCode, review: CodeReview) -> (LoopOutcome, CycleGuard) {
            let invoker = Invoker::new(&self.transport, &self.config);
            let mut guard = self.config.cycle_guard();
            let mut usage = UsageLedger::new();
            let deps = vec!["os".to_string()];
            let inputs = LoopInputs {
                task: "write a function that doubles a number",
                dependencies: &deps,
                paths: &self.paths,
            };
            let outcome = Controller::new(&invoker, &self.runner, &self.config, inputs)
                .run(code, review, &mut guard, &mut usage)
                .expect("loop");
            (outcome, guard)
        }
    }

    #[test]
    fn remedy_follows_category_unless_forced() {
        assert_eq!(
            choose_remedy(&assessment(FailureCategory::ImportError, None)),
            Remedy::FixImports
        );
        assert_eq!(
            choose_remedy(&assessment(FailureCategory::AssertionError, None)),
            Remedy::Escalate(EscalationReason::AssertionFailure)
        );
        assert_eq!(
            choose_remedy(&assessment(FailureCategory::Other, None)),
            Remedy::Escalate(EscalationReason::UnclassifiedFailure)
        );
        assert_eq!(
            choose_remedy(&assessment(
                FailureCategory::ImportError,
                Some(ForcedEscalation::RepeatedFingerprint)
            )),
            Remedy::Escalate(EscalationReason::RepeatedFailure)
        );
        assert_eq!(
            choose_remedy(&assessment(
                FailureCategory::AssertionError,
                Some(ForcedEscalation::AssertionStreak)
            )),
            Remedy::Escalate(EscalationReason::AssertionStreak)
        );
    }

    #[test]
    fn passing_first_run_converges_without_worker_calls() {
        let fx = Fixture::new(5);
        fx.runner.push(ScriptedRun::pass());
        let (outcome, _) = fx.run(
            code("def double(x):\n    return x * 2\n"),
            review("def test_double():\n    assert double(3) == 6\n"),
        );

        assert!(outcome.converged());
        assert!(outcome.passed);
        assert_eq!(outcome.testing_passes, 1);
        assert_eq!(outcome.escalations, 0);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history[0].action, IterationAction::Passed);

        let runs = fx.runner.runs();
        assert!(runs[0].tests.starts_with("from generated_script import double\n"));
        assert_eq!(runs[0].request.dependencies, vec!["pytest"]);
        assert!(runs[0].request.log_path.ends_with("logs/test_1.log"));
        assert!(fx.workspace.path().join("workspace/logs/test_1.log").exists());
    }

    #[test]
    fn import_error_goes_to_the_coder() {
        let fx = Fixture::new(5);
        fx.runner
            .push(ScriptedRun::fail(IMPORT_LOG))
            .push(ScriptedRun::pass());
        fx.transport.reply(
            WorkerRole::Coder,
            r#"{"description": "doubles", "code": "def double(x):\n    return x * 2\n"}"#,
        );
        let (outcome, _) = fx.run(
            code("def dbl(x):\n    return x * 2\n"),
            review("from generated_script import double\n\ndef test_double():\n    assert double(3) == 6\n"),
        );

        assert!(outcome.converged());
        assert_eq!(outcome.testing_passes, 2);
        assert_eq!(outcome.history[0].action, IterationAction::FixedImports);
        assert_eq!(outcome.history[0].category, Some(FailureCategory::ImportError));
        let prompt = &fx.transport.prompts_to(WorkerRole::Coder)[0];
        assert!(prompt.contains("cannot import name 'double'"));
        assert_eq!(fx.runner.runs()[1].code, "def double(x):\n    return x * 2\n");
        assert_eq!(fx.transport.calls_to(WorkerRole::Arbiter), 0);
        fx.transport.assert_drained();
    }

    /// A runner fault uses an iteration but teaches the guard nothing.
    #[test]
    fn runner_fault_is_recorded_and_skipped() {
        let fx = Fixture::new(5);
        fx.runner
            .push(ScriptedRun::Fault("docker daemon not running".to_string()))
            .push(ScriptedRun::pass());
        let (outcome, guard) = fx.run(code("def f(x):\n    return x\n"), review("def test_f(): pass\n"));

        assert!(outcome.converged());
        assert_eq!(outcome.testing_passes, 2);
        assert_eq!(guard.seen_count(), 0);
        assert!(matches!(
            &outcome.history[0].action,
            IterationAction::RunnerFault { message } if message.contains("docker daemon")
        ));
    }

    /// A coder that never changes anything still lets the loop halt.
    #[test]
    fn identical_broken_code_terminates_within_bound() {
        let fx = Fixture::new(3);
        fx.runner.repeat(ScriptedRun::fail(IMPORT_LOG));
        fx.transport.repeat(
            WorkerRole::Coder,
            r#"{"description": "doubles", "code": "def dbl(x): return x * 2"}"#,
        );
        fx.transport.repeat(
            WorkerRole::Arbiter,
            r#"{"problem_analysis": "name mismatch", "target_agent": "coder", "specific_instructions": "Rename dbl to double.", "expected_outcome": "tests import double"}"#,
        );
        let (outcome, _) = fx.run(code("def dbl(x): return x * 2"), review("def test_double(): pass\n"));

        assert_eq!(outcome.state, LoopState::Abandoned);
        assert!(!outcome.passed);
        assert_eq!(outcome.testing_passes, 4);
        assert_eq!(outcome.escalations, 2);
        assert_eq!(
            outcome.history.last().map(|record| &record.action),
            Some(&IterationAction::FinalCheck)
        );
        assert_eq!(fx.runner.runs().len(), 4);
    }

    #[test]
    fn exhausted_arbiter_stops_iterating() {
        let fx = Fixture::new(10);
        fx.runner.repeat(ScriptedRun::fail("E       assert 7 == 6"));
        fx.transport.repeat(WorkerRole::Arbiter, "");
        let (outcome, _) = fx.run(code("def f(x): return x"), review("def test_f(): pass\n"));

        assert_eq!(outcome.state, LoopState::Abandoned);
        assert_eq!(outcome.testing_passes, 2);
        assert_eq!(
            outcome.history[0].action,
            IterationAction::GaveUp {
                step: Step::Arbitrate
            }
        );
        assert_eq!(fx.transport.calls_to(WorkerRole::Arbiter), 3);
    }
}
