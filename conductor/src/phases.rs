//! Fixed phase sequence and the table of worker calls.
//!
//! Every worker call the pipeline makes is a [`Step`]. Each step has exactly one
//! row in [`CALLS`] naming its phase, worker, schema and prompt template; retry
//! and turn bounds come from the worker's configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::schema::SchemaKind;
use crate::core::types::WorkerRole;
use crate::io::config::{CallBounds, PipelineConfig};

/// Pipeline phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    DataExtraction,
    CodeGeneration,
    Review,
    Improvement,
    Documentation,
    Finalization,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::DataExtraction => "data_extraction",
            Phase::CodeGeneration => "code_generation",
            Phase::Review => "review",
            Phase::Improvement => "improvement",
            Phase::Documentation => "documentation",
            Phase::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kind of worker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Plan,
    ExtractPrice,
    GenerateCode,
    ReviewCode,
    FixImports,
    Arbitrate,
    ApplyCoderFix,
    ApplyReviewerFix,
    Document,
}

/// Static description of a worker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSpec {
    pub step: Step,
    pub phase: Phase,
    pub worker: WorkerRole,
    pub schema: SchemaKind,
    /// Prompt template name.
    pub template: &'static str,
}

/// Indexed by `Step as usize`.
pub static CALLS: [CallSpec; 9] = [
    CallSpec {
        step: Step::Plan,
        phase: Phase::Planning,
        worker: WorkerRole::Planner,
        schema: SchemaKind::Plan,
        template: "planner",
    },
    CallSpec {
        step: Step::ExtractPrice,
        phase: Phase::DataExtraction,
        worker: WorkerRole::Extractor,
        schema: SchemaKind::ExtractedPrice,
        template: "extractor",
    },
    CallSpec {
        step: Step::GenerateCode,
        phase: Phase::CodeGeneration,
        worker: WorkerRole::Coder,
        schema: SchemaKind::GeneratedCode,
        template: "coder",
    },
    CallSpec {
        step: Step::ReviewCode,
        phase: Phase::Review,
        worker: WorkerRole::Reviewer,
        schema: SchemaKind::CodeReview,
        template: "reviewer",
    },
    CallSpec {
        step: Step::FixImports,
        phase: Phase::Improvement,
        worker: WorkerRole::Coder,
        schema: SchemaKind::GeneratedCode,
        template: "import_fix",
    },
    CallSpec {
        step: Step::Arbitrate,
        phase: Phase::Improvement,
        worker: WorkerRole::Arbiter,
        schema: SchemaKind::ProblemSolution,
        template: "arbiter",
    },
    CallSpec {
        step: Step::ApplyCoderFix,
        phase: Phase::Improvement,
        worker: WorkerRole::Coder,
        schema: SchemaKind::GeneratedCode,
        template: "coder_fix",
    },
    CallSpec {
        step: Step::ApplyReviewerFix,
        phase: Phase::Improvement,
        worker: WorkerRole::Reviewer,
        schema: SchemaKind::CodeReview,
        template: "reviewer_fix",
    },
    CallSpec {
        step: Step::Document,
        phase: Phase::Documentation,
        worker: WorkerRole::Writer,
        schema: SchemaKind::Documentation,
        template: "writer",
    },
];

impl Step {
    pub fn spec(self) -> &'static CallSpec {
        &CALLS[self as usize]
    }

    /// Retry, turn and timeout bounds for this call.
    pub fn bounds(self, config: &PipelineConfig) -> CallBounds {
        config.bounds_for(self.spec().worker)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().template)
    }
}
