#![forbid(unsafe_code)]

//! Guardrail matcher: evaluates enabled policies against every step of a
//! trace and reports which matched, with the action and a human-readable
//! reason.
//!
//! A pattern is a conjunction over its present keys; a pattern with no keys
//! matches nothing, and a malformed regex matches nothing rather than
//! crashing the run.

use agent_replay_domain::{
    GuardAction, ReplayError, Result, StepRecord, StepType,
};
use agent_replay_store::SqliteTraceStore;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// The stored `match_pattern` object of a policy. Unknown keys are ignored
/// so older patterns keep working.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchPattern {
    pub step_type: Option<StepType>,
    pub name_contains: Option<String>,
    pub name_regex: Option<String>,
    pub input_contains: Option<String>,
    pub output_contains: Option<String>,
}

impl MatchPattern {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.step_type.is_none()
            && self.name_contains.is_none()
            && self.name_regex.is_none()
            && self.input_contains.is_none()
            && self.output_contains.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyMatch {
    pub policy_id: String,
    pub policy_name: String,
    pub action: GuardAction,
    pub reason: String,
}

/// Per-step match report, one entry per step in step order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMatches {
    pub step: StepRecord,
    pub matches: Vec<PolicyMatch>,
}

/// Evaluate every enabled policy (highest priority first) against every step
/// of the trace.
///
/// # Errors
/// `not_found` when the trace is absent or has no steps to check.
pub fn test_policies(store: &SqliteTraceStore, trace_id: &str) -> Result<Vec<StepMatches>> {
    let resolved = store
        .get_trace(trace_id)?
        .ok_or_else(|| ReplayError::NotFound(format!("trace '{trace_id}' not found")))?;
    if resolved.steps.is_empty() {
        return Err(ReplayError::NotFound(format!(
            "trace '{}' has no steps to check",
            resolved.trace.id
        )));
    }

    let policies = store.list_policies(true)?;
    let compiled: Vec<(usize, MatchPattern)> = policies
        .iter()
        .enumerate()
        .filter_map(|(index, policy)| {
            match serde_json::from_value::<MatchPattern>(policy.match_pattern.clone()) {
                Ok(pattern) => Some((index, pattern)),
                // A pattern that does not deserialize matches nothing.
                Err(_) => None,
            }
        })
        .collect();

    let mut report = Vec::with_capacity(resolved.steps.len());
    for step in resolved.steps {
        let mut matches = Vec::new();
        for (index, pattern) in &compiled {
            let policy = &policies[*index];
            if let Some(reason) = match_step(pattern, &step) {
                matches.push(PolicyMatch {
                    policy_id: policy.id.as_str().to_string(),
                    policy_name: policy.name.clone(),
                    action: policy.action,
                    reason,
                });
            }
        }
        if !matches.is_empty() {
            debug!(
                step_number = step.step_number,
                matched = matches.len(),
                "guardrail policies matched step"
            );
        }
        report.push(StepMatches { step, matches });
    }
    Ok(report)
}

/// Test one pattern against one step. `Some(reason)` lists every key that
/// matched, comma-joined; `None` means at least one key failed (or the
/// pattern was empty).
#[must_use]
pub fn match_step(pattern: &MatchPattern, step: &StepRecord) -> Option<String> {
    if pattern.is_empty() {
        return None;
    }

    let mut reasons = Vec::new();

    if let Some(step_type) = pattern.step_type {
        if step.step_type != step_type {
            return None;
        }
        reasons.push(format!("step_type is {}", step_type.as_str()));
    }

    if let Some(needle) = &pattern.name_contains {
        if !step.name.to_lowercase().contains(&needle.to_lowercase()) {
            return None;
        }
        reasons.push(format!("name contains '{needle}'"));
    }

    if let Some(raw) = &pattern.name_regex {
        let re = RegexBuilder::new(raw).case_insensitive(true).build();
        match re {
            Ok(re) if re.is_match(&step.name) => {
                reasons.push(format!("name matches /{raw}/"));
            }
            // Invalid regex never matches; it must not break the run.
            _ => return None,
        }
    }

    if let Some(needle) = &pattern.input_contains {
        let haystack = json_text(&step.input).to_lowercase();
        if !haystack.contains(&needle.to_lowercase()) {
            return None;
        }
        reasons.push(format!("input contains '{needle}'"));
    }

    if let Some(needle) = &pattern.output_contains {
        let haystack = step
            .output
            .as_ref()
            .map(json_text)
            .unwrap_or_default()
            .to_lowercase();
        if !haystack.contains(&needle.to_lowercase()) {
            return None;
        }
        reasons.push(format!("output contains '{needle}'"));
    }

    Some(reasons.join(", "))
}

fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
