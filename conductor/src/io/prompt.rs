//! Prompt builder for worker calls.
//!
//! Templates are minijinja documents split into sections by
//! `<!-- section:KEY required|droppable -->` markers. After rendering, sections
//! are dropped (then truncated) until the prompt fits the byte budget.

use std::sync::LazyLock;

use minijinja::{Environment, Value, context};
use regex::Regex;
use tracing::debug;

use crate::core::schema::SchemaKind;
use crate::core::types::AttemptOutcome;

const TEMPLATES: [(&str, &str); 10] = [
    ("planner", include_str!("prompts/planner.md")),
    ("extractor", include_str!("prompts/extractor.md")),
    ("coder", include_str!("prompts/coder.md")),
    ("reviewer", include_str!("prompts/reviewer.md")),
    ("import_fix", include_str!("prompts/import_fix.md")),
    ("arbiter", include_str!("prompts/arbiter.md")),
    ("coder_fix", include_str!("prompts/coder_fix.md")),
    ("reviewer_fix", include_str!("prompts/reviewer_fix.md")),
    ("writer", include_str!("prompts/writer.md")),
    ("correction", include_str!("prompts/correction.md")),
];

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 6] = ["comments", "dependencies", "task", "analysis", "plan", "data"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never dropped, only truncated as a last resort.
    required: bool,
    /// Section content including its header, without the marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(matches.len());

    for (i, caps) in matches.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());

        let content = rendered[marker.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Rendered length, counting the blank-line separators.
fn total_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + 2 * sections.len().saturating_sub(1)
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: truncate the last section.
    let other_len = total_len(sections)
        .saturating_sub(sections.last().map_or(0, |last| last.content.len()));
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        if allowed > 12 {
            truncate_at_char_boundary(&mut last.content, allowed - 12);
            last.content.push_str("\n[truncated]");
        } else {
            truncate_at_char_boundary(&mut last.content, allowed);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// What went wrong with a rejected reply, for the corrective prompt.
#[derive(Debug, Clone)]
pub struct Rejection<'a> {
    pub outcome: AttemptOutcome,
    pub detail: Option<&'a str>,
    pub reply: &'a str,
}

/// Builds worker prompts within a byte budget, dropping less critical sections first.
pub struct PromptBuilder {
    budget_bytes: usize,
    excerpt_chars: usize,
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, excerpt_chars: usize) -> Self {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self {
            budget_bytes,
            excerpt_chars,
            env,
        }
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Render template `name` with `ctx` and fit it to the budget.
    pub fn build(&self, name: &str, ctx: Value) -> String {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .unwrap_or_else(|err| panic!("prompt template `{name}` should render: {err:#}"));

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }

    /// Corrective prompt: quoted excerpt of the rejected reply, the exact
    /// schema with one example, and the original request.
    pub fn correction(&self, schema: SchemaKind, rejection: &Rejection<'_>, original: &str) -> String {
        let example = serde_json::to_string_pretty(&schema.example())
            .unwrap_or_else(|_| schema.example().to_string());
        self.build(
            "correction",
            context! {
                outcome => describe_outcome(rejection.outcome),
                detail => rejection.detail,
                excerpt => excerpt(rejection.reply.trim(), self.excerpt_chars),
                schema_name => schema.name(),
                schema => schema.document_text().trim(),
                example => example,
                task => original.trim(),
            },
        )
    }
}

fn describe_outcome(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Empty => "the reply was empty",
        AttemptOutcome::ThinkingLeak => "the reply contained reasoning instead of only the JSON object",
        AttemptOutcome::ParseFailed => "no valid JSON object was found",
        AttemptOutcome::SchemaInvalid => "the JSON object does not match the schema",
        AttemptOutcome::Validated => "the reply was accepted",
    }
}
