//! Output line classification.
//!
//! Lines are normalized (ANSI escapes stripped, trimmed, lowercased) and
//! matched against an ordered keyword table. The first rule with a matching
//! keyword wins, so a line like "enter progress" is a prompt.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Semantic category of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Progress,
    Error,
    Prompt,
    Result,
    Debug,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Progress => "progress",
            Self::Error => "error",
            Self::Prompt => "prompt",
            Self::Result => "result",
            Self::Debug => "debug",
        })
    }
}

const RULES: &[(OutputKind, &[&str])] = &[
    (OutputKind::Prompt, &["enter", "input", "confirm", "y/n"]),
    (OutputKind::Progress, &["progress", "%", "loading", "processing"]),
    (OutputKind::Error, &["error", "failed", "exception", "panic"]),
    (OutputKind::Result, &["complete", "finished", "done", "success"]),
    (OutputKind::Debug, &["debug", "trace", "verbose"]),
];

/// CSI sequences, OSC sequences (BEL or ST terminated) and two-byte escapes.
static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI pattern is valid")
});

/// Remove terminal escape sequences.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI.replace_all(line, "")
}

/// Form of a line that keywords are matched against.
pub fn normalize(line: &str) -> String {
    strip_ansi(line).trim().to_lowercase()
}

/// Categorize one line of output.
pub fn classify(line: &str) -> OutputKind {
    let normalized = normalize(line);
    if normalized.is_empty() {
        return OutputKind::Text;
    }
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| normalized.contains(k)))
        .map_or(OutputKind::Text, |(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_category_is_recognized() {
        assert_eq!(classify("Enter your choice:"), OutputKind::Prompt);
        assert_eq!(classify("Continue? [y/N]"), OutputKind::Prompt);
        assert_eq!(classify("Downloading 45%"), OutputKind::Progress);
        assert_eq!(classify("Loading model"), OutputKind::Progress);
        assert_eq!(classify("ERROR: file missing"), OutputKind::Error);
        assert_eq!(classify("thread 'main' panicked"), OutputKind::Error);
        assert_eq!(classify("Operation complete"), OutputKind::Result);
        assert_eq!(classify("All done."), OutputKind::Result);
        assert_eq!(classify("[debug] cache hit"), OutputKind::Debug);
        assert_eq!(classify("Hello, world"), OutputKind::Text);
    }

    #[test]
    fn test_earlier_rules_win() {
        assert_eq!(classify("Enter progress value"), OutputKind::Prompt);
        assert_eq!(classify("processing failed"), OutputKind::Progress);
        assert_eq!(classify("error: build finished"), OutputKind::Error);
        assert_eq!(classify("done with trace"), OutputKind::Result);
    }

    #[test]
    fn test_escapes_and_whitespace_are_ignored() {
        assert_eq!(classify("\x1b[1;32m  SUCCESS \x1b[0m"), OutputKind::Result);
        assert_eq!(classify("\x1b]0;title\x07Loading"), OutputKind::Progress);
        assert_eq!(classify("   "), OutputKind::Text);
        assert_eq!(classify(""), OutputKind::Text);
    }

    #[test]
    fn test_normalize_strips_and_folds() {
        assert_eq!(normalize("\x1b[31m  Warn  \x1b[0m"), "warn");
        assert_eq!(strip_ansi("plain"), "plain");
    }
}
