//! Dependency filtering for the test environment.

use std::sync::LazyLock;

use regex::Regex;

/// A PEP 508 style requirement without markers or URLs: a project name,
/// optional extras and optional comma-separated version specifiers.
static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)(?:\[[A-Za-z0-9._, -]*\])?(?:\s*(?:===|==|!=|~=|<=|>=|<|>)\s*[A-Za-z0-9.*+!_-]+(?:\s*,\s*(?:===|==|!=|~=|<=|>=|<|>)\s*[A-Za-z0-9.*+!_-]+)*)?$",
    )
    .unwrap()
});

/// Top-level modules shipped with CPython 3.x.
const STANDARD_LIBRARY: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64",
    "bisect", "builtins", "bz2", "calendar", "cmath", "codecs", "collections",
    "colorsys", "concurrent", "configparser", "contextlib", "contextvars", "copy",
    "csv", "ctypes", "dataclasses", "datetime", "decimal", "difflib", "dis",
    "email", "enum", "errno", "faulthandler", "fnmatch", "fractions", "functools",
    "gc", "getpass", "gettext", "glob", "graphlib", "gzip", "hashlib", "heapq",
    "hmac", "html", "http", "imaplib", "importlib", "inspect", "io", "ipaddress",
    "itertools", "json", "keyword", "locale", "logging", "lzma", "math",
    "mimetypes", "multiprocessing", "numbers", "operator", "os", "pathlib",
    "pickle", "platform", "pprint", "queue", "random", "re", "secrets", "select",
    "shlex", "shutil", "signal", "smtplib", "socket", "sqlite3", "ssl", "stat",
    "statistics", "string", "struct", "subprocess", "sys", "tempfile", "textwrap",
    "threading", "time", "timeit", "tkinter", "tomllib", "traceback", "types",
    "typing", "unicodedata", "unittest", "urllib", "uuid", "venv", "warnings",
    "weakref", "xml", "zipfile", "zlib", "zoneinfo",
];

/// Whether `name` is a standard-library module (dotted names use their first segment).
pub fn is_standard_library(name: &str) -> bool {
    let top = name.trim().split('.').next().unwrap_or_default();
    STANDARD_LIBRARY.contains(&top)
}

/// Project name of a requirement string, or `None` when it is not one.
pub fn requirement_name(requirement: &str) -> Option<&str> {
    REQUIREMENT_RE
        .captures(requirement.trim())
        .and_then(|caps| caps.get(1))
        .map(|name| name.as_str())
}

/// Packages to install before a test run: trimmed, deduplicated, without
/// standard-library names or strings that are not requirements, always
/// ending with `pytest`.
pub fn install_list(dependencies: &[String]) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for dependency in dependencies {
        let requirement = dependency.trim();
        let Some(name) = requirement_name(requirement) else {
            continue;
        };
        if is_standard_library(name) || name.eq_ignore_ascii_case("pytest") {
            continue;
        }
        if !packages.iter().any(|seen| seen == requirement) {
            packages.push(requirement.to_string());
        }
    }
    packages.push("pytest".to_string());
    packages
}
