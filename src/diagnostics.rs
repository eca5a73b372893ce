//! Diagnostics - structured, recoverable compile findings

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMPILER_SNIPPET_NOT_FOUND: &str = "COMPILER_SNIPPET_NOT_FOUND";
pub const COMPILER_SNIPPET_CYCLE: &str = "COMPILER_SNIPPET_CYCLE";
pub const COMPILER_VARIABLE_MISSING: &str = "COMPILER_VARIABLE_MISSING";
pub const COMPILER_FORMATTER_NOT_FOUND: &str = "COMPILER_FORMATTER_NOT_FOUND";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompilerDiagnostic {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CompilerDiagnostic {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Error,
            details: None,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}
