//! Failure Classifier
//!
//! Maps a failure signal to a repair type and a machine-readable category.
//! Engine errors are matched on their lowercased text.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairType {
    /// Fix how the query is written; analytical meaning is kept
    ExecutionRepair,
    /// Revisit what the query means: replan with a hint
    SemanticRepair,
}

impl fmt::Display for RepairType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairType::ExecutionRepair => write!(f, "execution_repair"),
            RepairType::SemanticRepair => write!(f, "semantic_repair"),
        }
    }
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    MissingColumn,
    MissingTable,
    AmbiguousReference,
    SyntaxError,
    TypeMismatch,
    Timeout,
    ExecutionError,
    SafetyRejected,
    EmptyResult,
    GuardrailBlock,
    UnapprovedJoin,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::MissingColumn => "missing_column",
            FailureCategory::MissingTable => "missing_table",
            FailureCategory::AmbiguousReference => "ambiguous_reference",
            FailureCategory::SyntaxError => "syntax_error",
            FailureCategory::TypeMismatch => "type_mismatch",
            FailureCategory::Timeout => "timeout",
            FailureCategory::ExecutionError => "execution_error",
            FailureCategory::SafetyRejected => "safety_rejected",
            FailureCategory::EmptyResult => "empty_result",
            FailureCategory::GuardrailBlock => "guardrail_block",
            FailureCategory::UnapprovedJoin => "unapproved_join",
        }
    }

    pub fn repair_type(&self) -> RepairType {
        match self {
            FailureCategory::EmptyResult | FailureCategory::GuardrailBlock | FailureCategory::UnapprovedJoin => {
                RepairType::SemanticRepair
            }
            _ => RepairType::ExecutionRepair,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the pipeline observed going wrong
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSignal {
    SafetyRejected(String),
    ExecutionError(String),
    EmptyResult,
    GuardrailBlock(String),
    UnapprovedJoin(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub repair_type: RepairType,
    pub category: FailureCategory,
    pub reason: String,
}

/// Failure classifier
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, signal: &FailureSignal) -> Classification {
        let (category, reason) = match signal {
            FailureSignal::SafetyRejected(reason) => (Self::classify_rejection(reason), reason.clone()),
            FailureSignal::ExecutionError(text) => (Self::classify_engine_error(text), text.clone()),
            FailureSignal::EmptyResult => (
                FailureCategory::EmptyResult,
                "query returned no rows although the grain table has data".to_string(),
            ),
            FailureSignal::GuardrailBlock(detail) => (FailureCategory::GuardrailBlock, detail.clone()),
            FailureSignal::UnapprovedJoin(detail) => (FailureCategory::UnapprovedJoin, detail.clone()),
        };
        Classification {
            repair_type: category.repair_type(),
            category,
            reason,
        }
    }

    /// Allow-list rejections name the offending identifier like an engine would
    fn classify_rejection(reason: &str) -> FailureCategory {
        if reason.contains("is not allow-listed") {
            if reason.starts_with("column ") {
                return FailureCategory::MissingColumn;
            }
            if reason.starts_with("table ") {
                return FailureCategory::MissingTable;
            }
        }
        FailureCategory::SafetyRejected
    }

    /// Classify engine error text into the taxonomy
    pub fn classify_engine_error(text: &str) -> FailureCategory {
        let error_msg = text.to_lowercase();

        if error_msg.contains("timeout") || error_msg.contains("timed out") || error_msg.contains("interrupted")
            || error_msg.contains("statement timeout") || error_msg.contains("canceling statement")
        {
            return FailureCategory::Timeout;
        }

        if error_msg.contains("no such column")
            || error_msg.contains("unknown column")
            || (error_msg.contains("column") && (error_msg.contains("does not exist") || error_msg.contains("not found")))
        {
            return FailureCategory::MissingColumn;
        }

        if error_msg.contains("no such table")
            || (error_msg.contains("relation") && error_msg.contains("does not exist"))
            || (error_msg.contains("table") && (error_msg.contains("doesn't exist") || error_msg.contains("not found")))
        {
            return FailureCategory::MissingTable;
        }

        if error_msg.contains("ambiguous") {
            return FailureCategory::AmbiguousReference;
        }

        if error_msg.contains("syntax error") || error_msg.contains("parse error") || error_msg.contains("incomplete input") {
            return FailureCategory::SyntaxError;
        }

        if error_msg.contains("operator does not exist")
            || error_msg.contains("invalid input syntax")
            || error_msg.contains("cannot cast")
            || error_msg.contains("datatype mismatch")
            || error_msg.contains("type mismatch")
            || (error_msg.contains("function") && error_msg.contains("does not exist"))
        {
            return FailureCategory::TypeMismatch;
        }

        FailureCategory::ExecutionError
    }
}
