//! Scripted collaborators and scratch workspaces for tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{ConversationTurn, SpeakerRole, WorkerRole};
use crate::io::config::PipelineConfig;
use crate::io::test_runner::{TestReport, TestRequest, TestRunner};
use crate::io::transport::{TransportError, WorkerTransport};

/// One canned response to a `send` call.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Turns(Vec<ConversationTurn>),
    Timeout,
    Unreachable,
}

impl ScriptedReply {
    /// A single worker turn with `text`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Turns(vec![ConversationTurn::worker(text)])
    }
}

/// Worker transport that replays queued replies per worker.
///
/// A worker with an empty queue falls back to its repeating reply, if any;
/// otherwise the call fails as unreachable so missing script entries surface.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    queues: RefCell<BTreeMap<WorkerRole, VecDeque<ScriptedReply>>>,
    repeating: RefCell<BTreeMap<WorkerRole, ScriptedReply>>,
    sent: RefCell<Vec<(WorkerRole, Vec<ConversationTurn>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a single-turn text reply.
    pub fn reply(&self, worker: WorkerRole, text: impl Into<String>) -> &Self {
        self.push(worker, ScriptedReply::text(text))
    }

    pub fn push(&self, worker: WorkerRole, reply: ScriptedReply) -> &Self {
        self.queues
            .borrow_mut()
            .entry(worker)
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply with `text` whenever the queue for `worker` is empty.
    pub fn repeat(&self, worker: WorkerRole, text: impl Into<String>) -> &Self {
        self.repeating
            .borrow_mut()
            .insert(worker, ScriptedReply::text(text));
        self
    }

    pub fn calls_to(&self, worker: WorkerRole) -> usize {
        self.sent
            .borrow()
            .iter()
            .filter(|(role, _)| *role == worker)
            .count()
    }

    /// Conversations sent to `worker`, in call order.
    pub fn conversations_to(&self, worker: WorkerRole) -> Vec<Vec<ConversationTurn>> {
        self.sent
            .borrow()
            .iter()
            .filter(|(role, _)| *role == worker)
            .map(|(_, conversation)| conversation.clone())
            .collect()
    }

    /// Opening orchestrator prompt of every call to `worker`.
    pub fn prompts_to(&self, worker: WorkerRole) -> Vec<String> {
        self.conversations_to(worker)
            .into_iter()
            .filter_map(|conversation| {
                conversation
                    .into_iter()
                    .find(|turn| turn.speaker == SpeakerRole::Orchestrator)
                    .map(|turn| turn.content)
            })
            .collect()
    }

    /// Fail if any queued reply was never consumed.
    pub fn assert_drained(&self) {
        let queues = self.queues.borrow();
        let leftover: Vec<String> = queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(worker, queue)| format!("{worker}: {}", queue.len()))
            .collect();
        assert!(leftover.is_empty(), "unused scripted replies: {leftover:?}");
    }
}

impl WorkerTransport for ScriptedTransport {
    fn send(
        &self,
        worker: WorkerRole,
        conversation: &[ConversationTurn],
        timeout: Duration,
    ) -> Result<Vec<ConversationTurn>, TransportError> {
        self.sent.borrow_mut().push((worker, conversation.to_vec()));
        let next = self
            .queues
            .borrow_mut()
            .get_mut(&worker)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.repeating.borrow().get(&worker).cloned());
        match next {
            Some(ScriptedReply::Turns(turns)) => Ok(turns),
            Some(ScriptedReply::Timeout) => Err(TransportError::TimedOut { worker, timeout }),
            Some(ScriptedReply::Unreachable) => Err(TransportError::Unreachable {
                worker,
                reason: "scripted outage".to_string(),
            }),
            None => Err(TransportError::Unreachable {
                worker,
                reason: "no scripted reply left".to_string(),
            }),
        }
    }
}

/// One canned test run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Exit { code: i32, log: String },
    Fault(String),
}

impl ScriptedRun {
    pub fn pass() -> Self {
        Self::Exit {
            code: 0,
            log: "1 passed".to_string(),
        }
    }

    pub fn fail(log: impl Into<String>) -> Self {
        Self::Exit {
            code: 1,
            log: log.into(),
        }
    }
}

/// A request as seen by the scripted runner, with the artifacts on disk at that moment.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub request: TestRequest,
    pub code: String,
    pub tests: String,
}

#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    queue: RefCell<VecDeque<ScriptedRun>>,
    repeating: RefCell<Option<ScriptedRun>>,
    runs: RefCell<Vec<RecordedRun>>,
}

impl ScriptedTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, run: ScriptedRun) -> &Self {
        self.queue.borrow_mut().push_back(run);
        self
    }

    pub fn repeat(&self, run: ScriptedRun) -> &Self {
        *self.repeating.borrow_mut() = Some(run);
        self
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.queue.borrow().len();
        assert_eq!(left, 0, "{left} scripted test runs were never used");
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport> {
        self.runs.borrow_mut().push(RecordedRun {
            request: request.clone(),
            code: fs::read_to_string(&request.script_path).unwrap_or_default(),
            tests: fs::read_to_string(&request.test_path).unwrap_or_default(),
        });
        let next = self
            .queue
            .borrow_mut()
            .pop_front()
            .or_else(|| self.repeating.borrow().clone());
        match next {
            Some(ScriptedRun::Exit { code, log }) => {
                write_log(&request.log_path, &log)?;
                Ok(TestReport {
                    exit_code: code,
                    log,
                })
            }
            Some(ScriptedRun::Fault(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted test run left")),
        }
    }
}

fn write_log(path: &Path, log: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, log).with_context(|| format!("write {}", path.display()))
}

/// Temporary directory holding one run's workspace.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create temp dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Default configuration pointed at `<tempdir>/workspace`.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            workspace_dir: self.dir.path().join("workspace"),
            ..PipelineConfig::default()
        }
    }
}

/// Compact JSON text for a scripted reply.
pub fn json_reply(value: &serde_json::Value) -> String {
    value.to_string()
}
