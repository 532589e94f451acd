//! End-to-end repository contracts exercised through the public API only:
//! ingest defaults, snapshot placement, the fork protocol, the status state
//! machine, and prefix resolution.

use agent_replay_domain::{
    ReplayError, SnapshotInput, StepInput, StepType, TraceInput, TracePatch, TraceStatus, Trigger,
};
use agent_replay_store::SqliteTraceStore;
use serde_json::json;
use ulid::Ulid;

fn temp_db_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "agent-replay-contracts-{}-{}.sqlite",
        name,
        Ulid::new()
    ))
}

fn open_store(name: &str) -> SqliteTraceStore {
    let store = SqliteTraceStore::open(&temp_db_path(name));
    assert!(store.is_ok());
    store.unwrap_or_else(|_| unreachable!())
}

fn three_step_trace() -> TraceInput {
    let mut input = TraceInput::new("scenario-bot");
    input.input = Some(json!({"task": "summarize"}));

    let mut tool_call = StepInput::new(2, StepType::ToolCall, "fetch_page");
    tool_call.input = Some(json!({"url": "https://example.test"}));
    tool_call.output = Some(json!({"bytes": 2048}));
    tool_call.duration_ms = Some(120);
    tool_call.snapshot = Some(SnapshotInput {
        context_window: Some(json!({"messages": 6})),
        environment: Some(json!({"cwd": "/srv/agent"})),
        tool_state: Some(json!({"cursor": 0})),
        token_count: 300,
    });

    input.steps = vec![
        StepInput::new(1, StepType::Thought, "plan"),
        tool_call,
        StepInput::new(3, StepType::Output, "answer"),
    ];
    input
}

#[test]
fn minimal_ingest_round_trips_with_defaults() {
    let mut store = open_store("s1");
    let stored = store.ingest_trace(&TraceInput::new("a"));
    assert!(stored.is_ok());
    let stored = stored.unwrap_or_else(|_| unreachable!());

    assert!(stored.id.as_str().starts_with("trc_"));
    assert_eq!(stored.status, TraceStatus::Running);
    assert_eq!(stored.trigger, Trigger::Manual);
    assert!(stored.tags.is_empty());
    assert_eq!(stored.metadata, json!({}));

    let resolved = store.get_trace(stored.id.as_str());
    assert!(resolved.is_ok());
    let resolved = resolved
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(resolved.trace.id, stored.id);
    assert!(resolved.steps.is_empty());
    assert!(resolved.evals.is_empty());
}

#[test]
fn snapshot_lands_on_step_two_only() {
    let mut store = open_store("s2");
    let stored = store.ingest_trace(&three_step_trace());
    assert!(stored.is_ok());
    let stored = stored.unwrap_or_else(|_| unreachable!());

    let with_snapshot = store.get_step_snapshot(stored.id.as_str(), 2);
    assert!(with_snapshot.is_ok());
    let with_snapshot = with_snapshot.unwrap_or_else(|_| unreachable!());
    assert!(with_snapshot.is_some());
    assert_eq!(
        with_snapshot.unwrap_or_else(|| unreachable!()).token_count,
        300
    );

    let without = store.get_step_snapshot(stored.id.as_str(), 1);
    assert!(without.is_ok());
    assert!(without.unwrap_or_else(|_| unreachable!()).is_none());
}

#[test]
fn fork_copies_prefix_with_fresh_ids_and_running_status() {
    let mut store = open_store("s4");
    let mut parent_input = three_step_trace();
    parent_input.status = Some(TraceStatus::Failed);
    parent_input.error = Some("boom".to_string());
    parent_input.tags = Some(vec!["replayable".to_string()]);
    let parent = store.ingest_trace(&parent_input);
    assert!(parent.is_ok());
    let parent = parent.unwrap_or_else(|_| unreachable!());

    let fork = store.fork_trace(parent.id.as_str(), 2, None, None);
    assert!(fork.is_ok());
    let fork = fork.unwrap_or_else(|_| unreachable!());
    assert_eq!(fork.steps_copied, 2);
    assert_eq!(fork.forked_from_step, 2);
    assert_eq!(fork.original_trace_id, parent.id);

    let forked = store.get_trace(fork.forked_trace_id.as_str());
    assert!(forked.is_ok());
    let forked = forked
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    // Forks are born running even off a failed parent.
    assert_eq!(forked.trace.status, TraceStatus::Running);
    assert_eq!(forked.trace.error, None);
    assert_eq!(forked.trace.parent_trace_id, Some(parent.id.clone()));
    assert_eq!(forked.trace.forked_from_step, Some(2));
    assert_eq!(forked.trace.tags, vec!["replayable".to_string()]);
    assert_eq!(forked.trace.input, json!({"task": "summarize"}));
    assert_eq!(
        forked.trace.metadata["forked_from"],
        json!(parent.id.as_str())
    );
    assert_eq!(forked.trace.metadata["forked_at_step"], json!(2));

    let parent_resolved = store.get_trace(parent.id.as_str());
    assert!(parent_resolved.is_ok());
    let parent_resolved = parent_resolved
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    assert_eq!(forked.steps.len(), 2);
    for (copy, original) in forked.steps.iter().zip(parent_resolved.steps.iter()) {
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.step_number, original.step_number);
        assert_eq!(copy.step_type, original.step_type);
        assert_eq!(copy.name, original.name);
        assert_eq!(copy.input, original.input);
        assert_eq!(copy.output, original.output);
        assert_eq!(copy.duration_ms, original.duration_ms);
        assert_eq!(copy.started_at, original.started_at);
        assert_eq!(copy.metadata, original.metadata);
    }

    let forked_snapshot = store.get_step_snapshot(fork.forked_trace_id.as_str(), 2);
    assert!(forked_snapshot.is_ok());
    let forked_snapshot = forked_snapshot
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(forked_snapshot.token_count, 300);
    assert_eq!(forked_snapshot.environment, json!({"cwd": "/srv/agent"}));

    // The parent is untouched.
    assert_eq!(parent_resolved.trace.status, TraceStatus::Failed);
    assert_eq!(parent_resolved.steps.len(), 3);
}

#[test]
fn fork_overrides_input_and_fork_point_environment_only() {
    let mut store = open_store("fork-overrides");
    let parent = store.ingest_trace(&three_step_trace());
    assert!(parent.is_ok());
    let parent = parent.unwrap_or_else(|_| unreachable!());

    let fork = store.fork_trace(
        parent.id.as_str(),
        2,
        Some(json!({"task": "translate"})),
        Some(json!({"cwd": "/srv/agent-fork"})),
    );
    assert!(fork.is_ok());
    let fork = fork.unwrap_or_else(|_| unreachable!());

    let forked = store.get_trace(fork.forked_trace_id.as_str());
    assert!(forked.is_ok());
    let forked = forked
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(forked.trace.input, json!({"task": "translate"}));
    // Step inputs are copied verbatim; only the trace input changes.
    assert_eq!(
        forked.steps[1].input,
        json!({"url": "https://example.test"})
    );

    let snapshot = store.get_step_snapshot(fork.forked_trace_id.as_str(), 2);
    assert!(snapshot.is_ok());
    let snapshot = snapshot
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(snapshot.environment, json!({"cwd": "/srv/agent-fork"}));
    assert_eq!(snapshot.tool_state, json!({"cursor": 0}));
    assert_eq!(snapshot.token_count, 300);
}

#[test]
fn fork_preconditions_are_enforced() {
    let mut store = open_store("fork-preconditions");
    let parent = store.ingest_trace(&three_step_trace());
    assert!(parent.is_ok());
    let parent = parent.unwrap_or_else(|_| unreachable!());

    assert!(matches!(
        store.fork_trace(parent.id.as_str(), 0, None, None),
        Err(ReplayError::InvalidInput(_))
    ));
    assert!(matches!(
        store.fork_trace(parent.id.as_str(), 4, None, None),
        Err(ReplayError::InvalidState(_))
    ));
    assert!(matches!(
        store.fork_trace("trc_000000000000", 1, None, None),
        Err(ReplayError::NotFound(_))
    ));

    let stepless = store.ingest_trace(&TraceInput::new("stepless"));
    assert!(stepless.is_ok());
    let stepless = stepless.unwrap_or_else(|_| unreachable!());
    assert!(matches!(
        store.fork_trace(stepless.id.as_str(), 1, None, None),
        Err(ReplayError::InvalidState(_))
    ));
}

#[test]
fn status_state_machine_gates_appends() {
    let mut store = open_store("state-machine");
    let stored = store.ingest_trace(&TraceInput::new("lifecycle"));
    assert!(stored.is_ok());
    let stored = stored.unwrap_or_else(|_| unreachable!());

    // Running accepts appends.
    let appended = store.append_step(
        stored.id.as_str(),
        &StepInput::new(1, StepType::Thought, "first"),
    );
    assert!(appended.is_ok());
    assert!(appended
        .unwrap_or_else(|_| unreachable!())
        .id
        .as_str()
        .starts_with("stp_"));

    // Every terminal status rejects them.
    for status in [
        TraceStatus::Completed,
        TraceStatus::Failed,
        TraceStatus::Timeout,
    ] {
        let patched = store.update_trace(
            stored.id.as_str(),
            &TracePatch {
                status: Some(status),
                ..TracePatch::default()
            },
        );
        assert!(patched.is_ok());

        let rejected = store.append_step(
            stored.id.as_str(),
            &StepInput::new(99, StepType::Thought, "late"),
        );
        assert!(matches!(rejected, Err(ReplayError::InvalidState(_))));
    }

    // Back to running, appends work again.
    let reopened = store.update_trace(
        stored.id.as_str(),
        &TracePatch {
            status: Some(TraceStatus::Running),
            ..TracePatch::default()
        },
    );
    assert!(reopened.is_ok());
    assert!(store
        .append_step(
            stored.id.as_str(),
            &StepInput::new(2, StepType::Output, "done"),
        )
        .is_ok());
}

#[test]
fn unique_prefix_resolves_like_the_full_id() {
    let mut store = open_store("prefix-property");
    let stored = store.ingest_trace(&TraceInput::new("prefixed"));
    assert!(stored.is_ok());
    let stored = stored.unwrap_or_else(|_| unreachable!());
    let full_id = stored.id.as_str();

    // Any prefix is unique while only one trace exists.
    for keep in [5, 8, full_id.len()] {
        let resolved = store.get_trace(&full_id[..keep]);
        assert!(resolved.is_ok());
        let resolved = resolved.unwrap_or_else(|_| unreachable!());
        assert!(resolved.is_some());
        assert_eq!(
            resolved.unwrap_or_else(|| unreachable!()).trace.id,
            stored.id
        );
    }

    let unknown = store.get_trace("trc_zzzzzzzzzzzz");
    assert!(unknown.is_ok());
    assert!(unknown.unwrap_or_else(|_| unreachable!()).is_none());
}
