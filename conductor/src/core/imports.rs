//! Static import repair for generated test files.

use std::sync::LazyLock;

use regex::Regex;

static TOP_LEVEL_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").unwrap());

/// Public top-level function names defined in `code`, in source order.
pub fn top_level_functions(code: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TOP_LEVEL_DEF_RE.captures_iter(code) {
        let name = &caps[1];
        if !name.starts_with('_') && !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Whether `tests` already imports from `module`.
pub fn imports_module(tests: &str, module: &str) -> bool {
    let from_prefix = format!("from {module} import ");
    let import_line = format!("import {module}");
    tests.lines().map(str::trim_start).any(|line| {
        line.starts_with(&from_prefix)
            || line == import_line
            || line.starts_with(&format!("{import_line} "))
            || line.starts_with(&format!("{import_line},"))
    })
}

/// Index of the first line after the leading block of comments, imports and
/// blank lines. Lines inside an open parenthesis or after a trailing `\`
/// belong to the statement above them.
fn header_end(lines: &[&str]) -> usize {
    let mut depth = 0usize;
    let mut continued = false;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let inside_statement = depth > 0 || continued;
        if !inside_statement
            && !(trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("import ")
                || trimmed.starts_with("from "))
        {
            return idx;
        }
        let code = trimmed.split('#').next().unwrap_or_default().trim_end();
        for ch in code.chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        continued = code.ends_with('\\');
    }
    lines.len()
}

/// Ensure `tests` imports the public functions of `code` from `module`.
///
/// The import line is inserted after the leading block of comments, imports
/// and blank lines. Returns `tests` unchanged when it already imports the
/// module or `code` defines no public functions.
pub fn ensure_test_imports(code: &str, tests: &str, module: &str) -> String {
    let functions = top_level_functions(code);
    if functions.is_empty() || imports_module(tests, module) {
        return tests.to_string();
    }

    let import_line = format!("from {module} import {}", functions.join(", "));
    let lines: Vec<&str> = tests.lines().collect();
    let insert_at = header_end(&lines);

    let mut fixed: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    fixed.extend_from_slice(&lines[..insert_at]);
    fixed.push(&import_line);
    fixed.extend_from_slice(&lines[insert_at..]);

    let mut out = fixed.join("\n");
    if tests.ends_with('\n') || tests.is_empty() {
        out.push('\n');
    }
    out
}
