use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discrete label for a validation failure, used to index learned strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Indentation,
    MissingSignature,
    ImportError,
    RuntimeError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::Syntax,
        ErrorCategory::Indentation,
        ErrorCategory::MissingSignature,
        ErrorCategory::ImportError,
        ErrorCategory::RuntimeError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Indentation => "indentation",
            ErrorCategory::MissingSignature => "missing_signature",
            ErrorCategory::ImportError => "import_error",
            ErrorCategory::RuntimeError => "runtime_error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown error category: {}", s))
    }
}

/// Ordered rules: the first category with a matching marker wins.
///
/// Indentation must come before syntax since Python reports
/// `IndentationError` as a subclass of `SyntaxError`.
const RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Indentation,
        &[
            "indentationerror",
            "taberror",
            "unexpected indent",
            "expected an indented block",
            "unindent does not match",
        ],
    ),
    (
        ErrorCategory::Syntax,
        &[
            "syntaxerror",
            "invalid syntax",
            "was never closed",
            "unterminated",
            "unexpected eof",
        ],
    ),
    (ErrorCategory::MissingSignature, &["signature:"]),
    (
        ErrorCategory::ImportError,
        &[
            "import_safety:",
            "modulenotfounderror",
            "importerror",
            "no module named",
        ],
    ),
    (
        ErrorCategory::RuntimeError,
        &["sandboxed_execution:", "traceback", "timed out"],
    ),
];

/// Assign a category to a validation error summary. Pure and deterministic.
pub fn classify(error_summary: &str) -> ErrorCategory {
    let lowered = error_summary.to_lowercase();

    RULES
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| lowered.contains(m)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}
