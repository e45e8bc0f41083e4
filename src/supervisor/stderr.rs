//! Output classification
//!
//! Sorts the child's stderr lines into log levels and the fatal categories
//! that abort a start (port conflict, authentication, missing dependency),
//! and detects the ready signal in either output stream.

use regex::RegexSet;
use tracing::{debug, error, info, warn};

use crate::logging::MAIL_TOOL_TARGET;

/// Category of one stderr line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    PortConflict,
    Authentication,
    MissingDependency,
    Error,
    Warning,
    Debug,
    Info,
}

impl LineClass {
    /// Categories that reject a start when seen during startup
    pub fn is_fatal_during_startup(self) -> bool {
        matches!(
            self,
            LineClass::PortConflict | LineClass::Authentication | LineClass::MissingDependency
        )
    }
}

/// Patterns in priority order; the first match wins
const PATTERNS: [(&str, LineClass); 6] = [
    (r"(?i)EADDRINUSE|address already in use", LineClass::PortConflict),
    (
        r"(?i)authentication failed|invalid token|token expired|no refresh token|GMAIL_AUTH_LOST|\b40[13]\b|(oauth|credentials).*(error|fail|invalid|missing|denied)|(error|fail|invalid|missing|denied).*(oauth|credentials)",
        LineClass::Authentication,
    ),
    (
        r"ModuleNotFoundError|ImportError|No module named|ENOENT|Cannot find module|command not found",
        LineClass::MissingDependency,
    ),
    (r"\b(ERROR|FATAL|CRITICAL)\b|Traceback", LineClass::Error),
    (r"\bWARN(ING)?\b", LineClass::Warning),
    (r"\bDEBUG\b", LineClass::Debug),
];

/// Keyword classifier for stderr lines
#[derive(Debug, Clone)]
pub struct StderrClassifier {
    set: RegexSet,
}

impl Default for StderrClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StderrClassifier {
    pub fn new() -> Self {
        // Patterns are compile-time constants covered by tests
        let set = RegexSet::new(PATTERNS.iter().map(|(pattern, _)| *pattern))
            .unwrap_or_else(|_| RegexSet::empty());
        Self { set }
    }

    pub fn classify(&self, line: &str) -> LineClass {
        self.set
            .matches(line)
            .iter()
            .next()
            .map(|index| PATTERNS[index].1)
            .unwrap_or(LineClass::Info)
    }

    /// Classify and log at the matching level
    pub fn classify_and_log(&self, line: &str) -> LineClass {
        let class = self.classify(line);
        match class {
            LineClass::PortConflict
            | LineClass::Authentication
            | LineClass::MissingDependency
            | LineClass::Error => error!(target: MAIL_TOOL_TARGET, "{}", line),
            LineClass::Warning => warn!(target: MAIL_TOOL_TARGET, "{}", line),
            LineClass::Debug => debug!(target: MAIL_TOOL_TARGET, "{}", line),
            LineClass::Info => info!(target: MAIL_TOOL_TARGET, "{}", line),
        }
        class
    }
}

/// Substring matcher for the ready signal
#[derive(Debug, Clone)]
pub struct ReadyDetector {
    markers: Vec<String>,
}

impl ReadyDetector {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }

    /// The first marker contained in `text`
    pub fn detect(&self, text: &str) -> Option<&str> {
        self.markers
            .iter()
            .find(|marker| text.contains(marker.as_str()))
            .map(String::as_str)
    }
}
