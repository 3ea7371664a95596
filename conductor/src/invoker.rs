//! Validating invoker: call a worker, extract and validate its payload, retry
//! with a corrective prompt until the worker's retry bound is reached.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{PriceScan, extract_candidate};
use crate::core::schema::{Payload, SchemaKind, validate};
use crate::core::termination::{
    TerminationDetector, TerminationRules, TerminationState, mentions_tool_call,
};
use crate::core::types::{
    AttemptOutcome, ConversationTurn, InvocationAttempt, SpeakerRole, WorkerRole,
};
use crate::core::usage::UsageLedger;
use crate::io::config::{CallBounds, PipelineConfig};
use crate::io::prompt::{PromptBuilder, Rejection};
use crate::io::transport::{TransportError, WorkerTransport};
use crate::phases::Step;

/// A payload that passed validation, with the attempts it took.
#[derive(Debug, Clone)]
pub struct Validated<P> {
    pub payload: P,
    pub attempts: Vec<InvocationAttempt>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(
        "worker {worker} produced no valid {schema} payload after {attempts} attempts (last outcome: {last_outcome})"
    )]
    Exhausted {
        worker: WorkerRole,
        schema: SchemaKind,
        attempts: u32,
        last_outcome: AttemptOutcome,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why one reply was not accepted.
#[derive(Debug)]
struct Rejected {
    outcome: AttemptOutcome,
    detail: Option<String>,
    candidate: Option<String>,
}

impl Rejected {
    fn new(outcome: AttemptOutcome, detail: Option<String>, candidate: Option<String>) -> Self {
        Self {
            outcome,
            detail,
            candidate,
        }
    }
}

/// Runs the call table's worker calls over a transport.
pub struct Invoker<'a, T: WorkerTransport> {
    transport: &'a T,
    config: &'a PipelineConfig,
    prompts: PromptBuilder,
    rules: TerminationRules,
    price_scan: PriceScan,
}

impl<'a, T: WorkerTransport> Invoker<'a, T> {
    pub fn new(transport: &'a T, config: &'a PipelineConfig) -> Self {
        Self {
            transport,
            config,
            prompts: PromptBuilder::new(
                config.invoker.prompt_budget_bytes,
                config.invoker.excerpt_chars,
            ),
            rules: config.termination_rules(),
            price_scan: config.price_scan(),
        }
    }

    /// Render the opening prompt for `step`.
    pub fn render(&self, step: Step, ctx: minijinja::Value) -> String {
        self.prompts.build(step.spec().template, ctx)
    }

    /// Call the worker behind `step` until it returns a valid `P`.
    ///
    /// Every unusable reply (empty, leaked reasoning, unparseable, invalid)
    /// replaces the prompt with a corrective one and consumes one attempt.
    /// Only an unreachable transport aborts early.
    #[instrument(skip_all, fields(step = %step, worker = %step.spec().worker))]
    pub fn invoke<P: Payload>(
        &self,
        step: Step,
        prompt: String,
        usage: &mut UsageLedger,
    ) -> Result<Validated<P>, InvokeError> {
        let spec = step.spec();
        debug_assert_eq!(P::KIND, spec.schema, "payload type does not match {step}");
        let bounds = step.bounds(self.config);
        let mut attempts: Vec<InvocationAttempt> = Vec::new();
        let mut current = prompt.clone();

        for index in 1..=bounds.max_retries {
            let reply = self.exchange(spec.worker, &current, bounds)?;
            usage.record(spec.worker, &current, &reply);

            match self.evaluate::<P>(&reply) {
                Ok((payload, candidate)) => {
                    info!(attempt = index, "worker reply validated");
                    attempts.push(InvocationAttempt {
                        index,
                        prompt: current,
                        raw_reply: reply,
                        candidate: Some(candidate),
                        outcome: AttemptOutcome::Validated,
                    });
                    return Ok(Validated { payload, attempts });
                }
                Err(rejected) => {
                    warn!(
                        attempt = index,
                        max_retries = bounds.max_retries,
                        outcome = %rejected.outcome,
                        detail = rejected.detail.as_deref().unwrap_or(""),
                        "worker reply rejected"
                    );
                    let next = self.prompts.correction(
                        spec.schema,
                        &Rejection {
                            outcome: rejected.outcome,
                            detail: rejected.detail.as_deref(),
                            reply: &reply,
                        },
                        &prompt,
                    );
                    attempts.push(InvocationAttempt {
                        index,
                        prompt: current,
                        raw_reply: reply,
                        candidate: rejected.candidate,
                        outcome: rejected.outcome,
                    });
                    current = next;
                }
            }
        }

        let last_outcome = attempts
            .last()
            .map_or(AttemptOutcome::Empty, |attempt| attempt.outcome);
        Err(InvokeError::Exhausted {
            worker: spec.worker,
            schema: spec.schema,
            attempts: attempts.len() as u32,
            last_outcome,
        })
    }

    /// Run one bounded conversation and return the selected reply text.
    ///
    /// A timeout ends the conversation with whatever has been said so far.
    fn exchange(
        &self,
        worker: WorkerRole,
        prompt: &str,
        bounds: CallBounds,
    ) -> Result<String, TransportError> {
        let mut conversation = vec![ConversationTurn::orchestrator(prompt)];
        let mut detector = TerminationDetector::new(&self.rules);

        for turn in 1..=bounds.max_turns {
            let produced = match self.transport.send(worker, &conversation, bounds.timeout) {
                Ok(produced) => produced,
                Err(TransportError::TimedOut { timeout, .. }) => {
                    warn!(turn, timeout_secs = timeout.as_secs(), "worker timed out");
                    break;
                }
                Err(err) => return Err(err),
            };
            for next in produced {
                detector.observe(&next);
                conversation.push(next);
            }
            if detector.state() == TerminationState::Done {
                break;
            }
            debug!(turn, state = ?detector.state(), "conversation continues");
        }

        Ok(select_reply(&conversation))
    }

    fn evaluate<P: Payload>(&self, reply: &str) -> Result<(P, String), Rejected> {
        if reply.trim().is_empty() {
            return Err(Rejected::new(AttemptOutcome::Empty, None, None));
        }
        if let Some(marker) = self
            .rules
            .leak_markers
            .iter()
            .find(|marker| reply.contains(marker.as_str()))
        {
            return Err(Rejected::new(
                AttemptOutcome::ThinkingLeak,
                Some(format!("the reply contains `{marker}`")),
                None,
            ));
        }

        let extraction = extract_candidate(reply, P::KIND, &self.price_scan).map_err(|err| {
            Rejected::new(AttemptOutcome::ParseFailed, Some(err.to_string()), None)
        })?;
        debug!(strategy = ?extraction.strategy, "candidate extracted");
        let candidate = extraction.candidate;

        let value: Value = match serde_json::from_str(&candidate) {
            Ok(value) => value,
            Err(err) => {
                return Err(Rejected::new(
                    AttemptOutcome::ParseFailed,
                    Some(format!("invalid JSON: {err}")),
                    Some(candidate),
                ));
            }
        };
        match validate::<P>(&value) {
            Ok(payload) => Ok((payload, candidate)),
            Err(err) => Err(Rejected::new(
                AttemptOutcome::SchemaInvalid,
                Some(err.to_string()),
                Some(candidate),
            )),
        }
    }
}

/// Last worker turn that is neither empty nor a tool request.
fn select_reply(conversation: &[ConversationTurn]) -> String {
    conversation
        .iter()
        .rev()
        .find(|turn| {
            turn.speaker == SpeakerRole::Worker
                && !mentions_tool_call(turn)
                && !turn.content.trim().is_empty()
        })
        .map(|turn| turn.content.clone())
        .unwrap_or_default()
}
