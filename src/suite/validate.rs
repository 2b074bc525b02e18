//! Load-time suite validation.
//!
//! Runs after deserialization and before anything executes, collecting
//! every problem instead of stopping at the first. A suite failing here
//! sends the run straight to FAILED with the full report.

use thiserror::Error;

use super::{FlowSuite, IterateSpec, Step, StepKind};
use crate::errors::ErrorCode;

#[derive(Debug, Error)]
pub enum SuiteValidationError {
    #[error("suite '{suite}' declares no steps")]
    EmptySuite { suite: String },

    #[error("step #{index}: name is empty")]
    EmptyStepName { index: usize },

    #[error("step '{step}': duplicate step_id '{step_id}'")]
    DuplicateStepId { step: String, step_id: String },

    #[error("step '{step}': iterate needs exactly one of 'over' or 'range'")]
    InvalidIterate { step: String },

    #[error("step '{step}': range '{range}' is not of the form start..end")]
    InvalidRange { step: String, range: String },

    #[error("step '{step}': iterator variable is empty")]
    EmptyIteratorVariable { step: String },

    #[error("step '{step}': call target path is empty")]
    EmptyCallTarget { step: String },

    #[error("step '{step}': call target step is empty")]
    EmptyCallStep { step: String },

    #[error("step '{step}': input variable name is empty")]
    EmptyInputVariable { step: String },

    #[error("step '{step}': retry max_attempts must be at least 1")]
    InvalidRetry { step: String },

    #[error("step '{step}': scenarios list is empty")]
    EmptyScenarios { step: String },
}

impl SuiteValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptySuite { .. } => ErrorCode::EMPTY_SUITE,
            Self::EmptyStepName { .. } => ErrorCode::EMPTY_STEP_NAME,
            Self::DuplicateStepId { .. } => ErrorCode::INVALID_DOCUMENT,
            Self::InvalidIterate { .. }
            | Self::InvalidRange { .. }
            | Self::EmptyIteratorVariable { .. } => ErrorCode::INVALID_ITERATE,
            Self::EmptyCallTarget { .. }
            | Self::EmptyCallStep { .. }
            | Self::EmptyInputVariable { .. }
            | Self::EmptyScenarios { .. } => ErrorCode::MISSING_FIELD,
            Self::InvalidRetry { .. } => ErrorCode::INVALID_RETRY,
        }
    }
}

pub type ValidationReport = Vec<SuiteValidationError>;

/// Validates a whole suite, returning every error found.
pub fn validate_suite(suite: &FlowSuite) -> Result<(), ValidationReport> {
    let mut errors = Vec::new();

    if suite.steps.is_empty() {
        errors.push(SuiteValidationError::EmptySuite {
            suite: suite.suite_name.clone(),
        });
        return Err(errors);
    }

    let mut seen_ids: Vec<&str> = Vec::new();
    for (index, step) in suite.steps.iter().enumerate() {
        if let Some(id) = step.step_id.as_deref() {
            if seen_ids.contains(&id) {
                errors.push(SuiteValidationError::DuplicateStepId {
                    step: step.name.clone(),
                    step_id: id.to_string(),
                });
            }
            seen_ids.push(id);
        }
        validate_step(step, index, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_step(step: &Step, index: usize, errors: &mut ValidationReport) {
    if step.name.trim().is_empty() {
        errors.push(SuiteValidationError::EmptyStepName { index });
        return;
    }

    if let Some(retry) = step.retry() {
        if retry.max_attempts == 0 {
            errors.push(SuiteValidationError::InvalidRetry {
                step: step.name.clone(),
            });
        }
    }

    match &step.kind {
        StepKind::Request(_) => {}
        StepKind::Call(call) => {
            if call.test.trim().is_empty() {
                errors.push(SuiteValidationError::EmptyCallTarget {
                    step: step.name.clone(),
                });
            }
            if call.step.trim().is_empty() {
                errors.push(SuiteValidationError::EmptyCallStep {
                    step: step.name.clone(),
                });
            }
            if let Some(retry) = &call.retry {
                if retry.max_attempts == 0 {
                    errors.push(SuiteValidationError::InvalidRetry {
                        step: step.name.clone(),
                    });
                }
            }
        }
        StepKind::Input(input) => {
            if input.variable.trim().is_empty() {
                errors.push(SuiteValidationError::EmptyInputVariable {
                    step: step.name.clone(),
                });
            }
        }
        StepKind::Iterate(iterate) => {
            validate_iterate(step, iterate, errors);
            // The wrapped body is a full step and gets the same checks.
            validate_step(&iterate.body, index, errors);
        }
        StepKind::Scenarios(clauses) => {
            if clauses.is_empty() {
                errors.push(SuiteValidationError::EmptyScenarios {
                    step: step.name.clone(),
                });
            }
        }
    }
}

fn validate_iterate(step: &Step, iterate: &IterateSpec, errors: &mut ValidationReport) {
    match (&iterate.over, &iterate.range) {
        (Some(_), Some(_)) | (None, None) => {
            errors.push(SuiteValidationError::InvalidIterate {
                step: step.name.clone(),
            });
        }
        (None, Some(range)) => {
            if parse_range(range).is_none() {
                errors.push(SuiteValidationError::InvalidRange {
                    step: step.name.clone(),
                    range: range.clone(),
                });
            }
        }
        (Some(_), None) => {}
    }
    if iterate.bind.trim().is_empty() {
        errors.push(SuiteValidationError::EmptyIteratorVariable {
            step: step.name.clone(),
        });
    }
}

/// Parses a `"start..end"` half-open range. Interpolated bounds are
/// validated again at execution time.
pub fn parse_range(range: &str) -> Option<(i64, i64)> {
    let (start, end) = range.split_once("..")?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    Some((start, end))
}
