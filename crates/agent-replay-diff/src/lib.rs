#![forbid(unsafe_code)]

//! Step-wise comparator between two stored traces.
//!
//! Steps are aligned by position and compared field by field over the
//! canonical persisted JSON text, so byte-equality is semantic equality for
//! anything the store wrote.

use agent_replay_domain::{canonical_json, ReplayError, Result, StepRecord};
use agent_replay_store::SqliteTraceStore;
use serde::{Deserialize, Serialize};

/// One field-level difference at an aligned step position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDiff {
    pub step_number: i64,
    pub field: String,
    pub left_value: Option<String>,
    pub right_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceDiff {
    pub left_step_count: usize,
    pub right_step_count: usize,
    /// Step number of the first emitted difference, if any.
    pub divergence_step: Option<i64>,
    pub diffs: Vec<StepDiff>,
}

/// Compare two traces step by step.
///
/// # Errors
/// `not_found` when either trace is absent; `invalid_input` on an ambiguous
/// id prefix.
pub fn diff_traces(
    store: &SqliteTraceStore,
    left_id: &str,
    right_id: &str,
) -> Result<TraceDiff> {
    let left = store
        .get_trace(left_id)?
        .ok_or_else(|| ReplayError::NotFound(format!("trace '{left_id}' not found")))?;
    let right = store
        .get_trace(right_id)?
        .ok_or_else(|| ReplayError::NotFound(format!("trace '{right_id}' not found")))?;

    diff_steps(&left.steps, &right.steps)
}

/// # Errors
/// `ReplayError::Storage` if a step payload cannot be re-serialized.
pub fn diff_steps(left: &[StepRecord], right: &[StepRecord]) -> Result<TraceDiff> {
    let mut diffs = Vec::new();

    for position in 0..left.len().max(right.len()) {
        match (left.get(position), right.get(position)) {
            (Some(left_step), Some(right_step)) => {
                compare_step_pair(left_step, right_step, &mut diffs)?;
            }
            (Some(left_step), None) => diffs.push(StepDiff {
                step_number: left_step.step_number,
                field: "missing_right".to_string(),
                left_value: Some(left_step.name.clone()),
                right_value: None,
            }),
            (None, Some(right_step)) => diffs.push(StepDiff {
                step_number: right_step.step_number,
                field: "missing_left".to_string(),
                left_value: None,
                right_value: Some(right_step.name.clone()),
            }),
            (None, None) => {}
        }
    }

    Ok(TraceDiff {
        left_step_count: left.len(),
        right_step_count: right.len(),
        divergence_step: diffs.first().map(|diff| diff.step_number),
        diffs,
    })
}

fn compare_step_pair(
    left: &StepRecord,
    right: &StepRecord,
    diffs: &mut Vec<StepDiff>,
) -> Result<()> {
    // Field order is part of the contract: step_type, name, input, output.
    if left.step_type != right.step_type {
        diffs.push(StepDiff {
            step_number: left.step_number,
            field: "step_type".to_string(),
            left_value: Some(left.step_type.as_str().to_string()),
            right_value: Some(right.step_type.as_str().to_string()),
        });
    }
    if left.name != right.name {
        diffs.push(StepDiff {
            step_number: left.step_number,
            field: "name".to_string(),
            left_value: Some(left.name.clone()),
            right_value: Some(right.name.clone()),
        });
    }

    let left_input = canonical_json(&left.input)?;
    let right_input = canonical_json(&right.input)?;
    if left_input != right_input {
        diffs.push(StepDiff {
            step_number: left.step_number,
            field: "input".to_string(),
            left_value: Some(left_input),
            right_value: Some(right_input),
        });
    }

    let left_output = left.output.as_ref().map(canonical_json).transpose()?;
    let right_output = right.output.as_ref().map(canonical_json).transpose()?;
    if left_output != right_output {
        diffs.push(StepDiff {
            step_number: left.step_number,
            field: "output".to_string(),
            left_value: left_output,
            right_value: right_output,
        });
    }
    Ok(())
}
