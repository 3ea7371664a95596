//! End-to-end pipeline runs against scripted workers and a scripted test runner.
//!
//! Each test scripts every worker reply and every test outcome, runs the full
//! phase sequence, and checks the report, the artifacts on disk and what the
//! workers were asked.

use std::fs;

use serde_json::{Value, json};

use conductor::core::classifier::FailureCategory;
use conductor::core::schema::TargetAgent;
use conductor::core::types::WorkerRole;
use conductor::improve::{EscalationReason, IterationAction, LoopState};
use conductor::phases::Phase;
use conductor::pipeline::run;
use conductor::test_support::{
    ScriptedRun, ScriptedTestRunner, ScriptedTransport, TestWorkspace, json_reply,
};

const TASK: &str = "write a function that doubles a number";

fn plan(data_query: Option<&str>) -> String {
    json_reply(&json!({
        "plan": ["define f(x)", "return x * 2"],
        "data_query": data_query,
        "dependencies": ["requests", "math"],
    }))
}

fn doubling_code() -> String {
    json_reply(&json!({"description": "doubles", "code": "def f(x): return x*2"}))
}

fn review_asserting(expected: u32) -> String {
    json_reply(&json!({
        "review_comments": ["f handles integers"],
        "test_code": format!("def test_f():\n    assert f(3) == {expected}\n"),
        "improvements": ["accept floats"],
    }))
}

fn documentation() -> String {
    json_reply(&json!({
        "title": "Doubler",
        "description": "Doubles a number.",
        "usage_examples": ["f(3)  # 6"],
        "api_documentation": "f(x) returns x * 2",
    }))
}

fn read_json(path: &std::path::Path) -> Value {
    let raw = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

/// Correct code and correct tests converge on the first testing pass.
#[test]
fn doubling_task_converges_on_first_pass() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = workspace.config();
    let transport = ScriptedTransport::new();
    transport
        .reply(WorkerRole::Planner, plan(None))
        .reply(WorkerRole::Coder, doubling_code())
        .reply(WorkerRole::Reviewer, review_asserting(6))
        .reply(WorkerRole::Writer, documentation());
    let runner = ScriptedTestRunner::new();
    runner.push(ScriptedRun::pass());

    let report = run(TASK, &config, &transport, &runner).expect("run");

    assert!(report.converged);
    assert!(report.passed);
    assert_eq!(report.loop_state, LoopState::Converged);
    assert_eq!(report.testing_passes, 1);
    assert_eq!(report.escalations, 0);
    assert!(report.fallbacks.is_empty());
    assert_eq!(transport.calls_to(WorkerRole::Arbiter), 0);
    assert_eq!(transport.calls_to(WorkerRole::Extractor), 0);
    transport.assert_drained();
    runner.assert_drained();

    let runs = runner.runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].tests.starts_with("from generated_script import f\n"));
    assert_eq!(runs[0].code, "def f(x): return x*2");
    assert_eq!(runs[0].request.dependencies, vec!["requests", "pytest"]);

    let dir = &config.workspace_dir;
    assert_eq!(
        fs::read_to_string(dir.join("generated_script.py")).expect("code"),
        "def f(x): return x*2"
    );
    let tests = fs::read_to_string(dir.join("test_generated_script.py")).expect("tests");
    assert!(tests.contains("from generated_script import f"));
    let readme = fs::read_to_string(dir.join("README.md")).expect("readme");
    assert!(readme.starts_with("# Doubler\n"));
    assert!(readme.contains("- f handles integers"));
    assert!(readme.contains("- accept floats"));

    let saved = read_json(&dir.join("run_report.json"));
    assert_eq!(saved["converged"], json!(true));
    assert_eq!(saved["history"][0]["action"]["kind"], json!("passed"));
    let usage = read_json(&dir.join("usage.json"));
    assert_eq!(usage["totals"]["calls"], json!(4));
    assert!(usage["workers"]["coder"]["input_tokens"].as_u64().unwrap_or(0) > 0);
}

/// A wrong expectation in the tests is escalated at once and fixed by the reviewer.
#[test]
fn wrong_assertion_is_arbitrated_to_the_reviewer() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = workspace.config();
    let instructions = "In test_f, change the expected value from 7 to 6; f(3) is 6.";
    let transport = ScriptedTransport::new();
    transport
        .reply(WorkerRole::Planner, plan(None))
        .reply(WorkerRole::Coder, doubling_code())
        .reply(WorkerRole::Reviewer, review_asserting(7))
        .reply(
            WorkerRole::Arbiter,
            json_reply(&json!({
                "problem_analysis": "The code doubles correctly; the test expects 7 for f(3).",
                "target_agent": "reviewer",
                "specific_instructions": instructions,
                "expected_outcome": "test_f passes",
            })),
        )
        .reply(WorkerRole::Reviewer, review_asserting(6))
        .reply(WorkerRole::Writer, documentation());
    let runner = ScriptedTestRunner::new();
    runner
        .push(ScriptedRun::fail(
            "    def test_f():\n>       assert f(3) == 7\nE       assert 6 == 7\nE        +  where 6 = f(3)\n\ntest_generated_script.py:4: AssertionError\n",
        ))
        .push(ScriptedRun::pass());

    let report = run(TASK, &config, &transport, &runner).expect("run");

    assert!(report.converged);
    assert_eq!(report.testing_passes, 2);
    assert_eq!(report.escalations, 1);
    assert_eq!(report.history[0].category, Some(FailureCategory::AssertionError));
    assert_eq!(
        report.history[0].action,
        IterationAction::Escalated {
            reason: EscalationReason::AssertionFailure,
            target: TargetAgent::Reviewer,
        }
    );
    assert_eq!(report.history[1].action, IterationAction::Passed);
    assert_eq!(transport.calls_to(WorkerRole::Arbiter), 1);
    assert_eq!(transport.calls_to(WorkerRole::Coder), 1);
    transport.assert_drained();

    let arbiter_prompt = &transport.prompts_to(WorkerRole::Arbiter)[0];
    assert!(arbiter_prompt.contains("assert f(3) == 7"));
    assert!(arbiter_prompt.contains("assertion_error"));
    let reviewer_fix = &transport.prompts_to(WorkerRole::Reviewer)[1];
    assert!(reviewer_fix.contains(instructions));

    let runs = runner.runs();
    assert!(runs[1].tests.contains("assert f(3) == 6"));
    assert!(runs[1].tests.starts_with("from generated_script import f\n"));
}

/// An extractor that never answers costs its smaller retry bound, then the
/// configured fallback price flows into the coder prompt.
#[test]
fn silent_extractor_falls_back_to_configured_price() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = workspace.config();
    let transport = ScriptedTransport::new();
    transport
        .reply(WorkerRole::Planner, plan(Some("iPhone 15 price in rubles")))
        .repeat(WorkerRole::Extractor, "")
        .reply(WorkerRole::Coder, doubling_code())
        .reply(WorkerRole::Reviewer, review_asserting(6))
        .reply(WorkerRole::Writer, documentation());
    let runner = ScriptedTestRunner::new();
    runner.push(ScriptedRun::pass());

    let report = run(TASK, &config, &transport, &runner).expect("run");

    assert!(report.converged);
    assert_eq!(transport.calls_to(WorkerRole::Extractor), 2);
    assert!(
        transport.prompts_to(WorkerRole::Extractor)[0].contains("iPhone 15 price in rubles")
    );
    assert_eq!(report.fallbacks.len(), 1);
    assert_eq!(report.fallbacks[0].phase, Phase::DataExtraction);
    assert_eq!(report.fallbacks[0].worker, WorkerRole::Extractor);
    assert!(report.fallbacks[0].reason.contains("2 attempts"));
    assert!(transport.prompts_to(WorkerRole::Coder)[0].contains("139990"));

    let saved = read_json(&config.workspace_dir.join("run_report.json"));
    assert_eq!(saved["fallbacks"][0]["phase"], json!("data_extraction"));
}

/// Identical broken code forever still ends after the bound plus the final check.
#[test]
fn always_broken_coder_is_abandoned_after_bound() {
    let workspace = TestWorkspace::new().expect("workspace");
    let mut config = workspace.config();
    config.max_improvement_loops = 3;
    let broken = json_reply(&json!({"description": "doubles", "code": "def g(x): return x*2"}));
    let transport = ScriptedTransport::new();
    transport
        .reply(WorkerRole::Planner, plan(None))
        .repeat(WorkerRole::Coder, broken)
        .reply(WorkerRole::Reviewer, review_asserting(6))
        .repeat(
            WorkerRole::Arbiter,
            json_reply(&json!({
                "problem_analysis": "f is not defined.",
                "target_agent": "coder",
                "specific_instructions": "Define f(x) returning x * 2.",
                "expected_outcome": "test_f passes",
            })),
        )
        .reply(WorkerRole::Writer, documentation());
    let runner = ScriptedTestRunner::new();
    runner.repeat(ScriptedRun::fail(
        "E   NameError: name 'f' is not defined\nFAILED test_generated_script.py::test_f\n",
    ));

    let report = run(TASK, &config, &transport, &runner).expect("run");

    assert!(!report.converged);
    assert!(!report.passed);
    assert_eq!(report.loop_state, LoopState::Abandoned);
    assert_eq!(report.testing_passes, 4);
    assert_eq!(runner.runs().len(), 4);
    assert_eq!(report.history.len(), 4);
    assert_eq!(report.history[0].action, IterationAction::FixedImports);
    assert!(matches!(
        report.history[1].action,
        IterationAction::Escalated {
            reason: EscalationReason::RepeatedFailure,
            target: TargetAgent::Coder,
        }
    ));
    assert_eq!(report.history[3].action, IterationAction::FinalCheck);
    assert!(config.workspace_dir.join("README.md").exists());

    let saved = read_json(&config.workspace_dir.join("run_report.json"));
    assert_eq!(saved["converged"], json!(false));
    assert_eq!(saved["loop_state"], json!("abandoned"));
}
