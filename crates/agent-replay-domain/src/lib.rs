#![forbid(unsafe_code)]

//! Entity records, identifiers, and the error taxonomy shared by every
//! agent-replay crate. The store persists these records; the diff, eval,
//! and guardrail engines consume them as resolved views.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

const ID_SUFFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JudgeFailureKind {
    Network,
    Auth,
    RateLimit,
    Server,
    Parse,
}

impl JudgeFailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Parse => "parse",
        }
    }
}

impl std::fmt::Display for JudgeFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a `LanguageJudge` adapter. Judge failures never
/// produce a stored verdict; they surface to the caller as-is.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{provider} judge failure ({kind}): {message}")]
pub struct JudgeFailure {
    pub kind: JudgeFailureKind,
    pub provider: String,
    pub status: Option<u16>,
    pub message: String,
}

impl JudgeFailure {
    #[must_use]
    pub fn new(kind: JudgeFailureKind, provider: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.to_string(),
            status: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Judge(#[from] JudgeFailure),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

fn mint_id(prefix: &str) -> String {
    // The trailing 16 chars of a ULID encode its 80 random bits; 12 of them
    // keep 60 bits, well under the 1e-6 collision budget for 1e6 mints.
    let ulid = Ulid::new().to_string();
    let suffix = ulid[ulid.len() - ID_SUFFIX_LEN..].to_ascii_lowercase();
    format!("{prefix}_{suffix}")
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            #[must_use]
            pub fn mint() -> Self {
                Self(mint_id($prefix))
            }

            /// Wraps an id string, checking the typed prefix.
            ///
            /// # Errors
            /// Returns `ReplayError::InvalidInput` when the prefix is wrong.
            pub fn parse(value: &str) -> Result<Self> {
                if value.starts_with(concat!($prefix, "_")) {
                    Ok(Self(value.to_string()))
                } else {
                    Err(ReplayError::InvalidInput(format!(
                        "expected {}_ id, got '{value}'",
                        $prefix
                    )))
                }
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a recorded agent execution (`trc_` prefix).
    TraceId,
    "trc"
);
opaque_id!(StepId, "stp");
opaque_id!(SnapshotId, "snp");
opaque_id!(EvalId, "evl");
opaque_id!(PolicyId, "pol");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TraceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Terminal traces reject further `append_step` calls.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    UserMessage,
    Cron,
    Webhook,
    Api,
    Event,
}

impl Trigger {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::UserMessage => "user_message",
            Self::Cron => "cron",
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "user_message" => Some(Self::UserMessage),
            "cron" => Some(Self::Cron),
            "webhook" => Some(Self::Webhook),
            "api" => Some(Self::Api),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thought,
    ToolCall,
    LlmCall,
    Retrieval,
    Output,
    Decision,
    Error,
    GuardCheck,
}

impl StepType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::ToolCall => "tool_call",
            Self::LlmCall => "llm_call",
            Self::Retrieval => "retrieval",
            Self::Output => "output",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::GuardCheck => "guard_check",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "thought" => Some(Self::Thought),
            "tool_call" => Some(Self::ToolCall),
            "llm_call" => Some(Self::LlmCall),
            "retrieval" => Some(Self::Retrieval),
            "output" => Some(Self::Output),
            "decision" => Some(Self::Decision),
            "error" => Some(Self::Error),
            "guard_check" => Some(Self::GuardCheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorType {
    Rubric,
    LlmJudge,
    PolicyCheck,
}

impl EvaluatorType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rubric => "rubric",
            Self::LlmJudge => "llm_judge",
            Self::PolicyCheck => "policy_check",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rubric" => Some(Self::Rubric),
            "llm_judge" => Some(Self::LlmJudge),
            "policy_check" => Some(Self::PolicyCheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    Allow,
    Deny,
    Warn,
    RequireReview,
}

impl GuardAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Warn => "warn",
            Self::RequireReview => "require_review",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "warn" => Some(Self::Warn),
            "require_review" => Some(Self::RequireReview),
            _ => None,
        }
    }
}

/// One recorded agent execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    pub id: TraceId,
    pub agent_name: String,
    pub agent_version: Option<String>,
    pub trigger: Trigger,
    pub status: TraceStatus,
    pub input: Value,
    pub output: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub total_duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<f64>,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub parent_trace_id: Option<TraceId>,
    pub forked_from_step: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

/// One atomic action within a trace. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: StepId,
    pub trace_id: TraceId,
    pub step_number: i64,
    pub step_type: StepType,
    pub name: String,
    pub input: Value,
    pub output: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub duration_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub model: Option<String>,
    pub error: Option<String>,
    pub metadata: Value,
}

/// Frozen auxiliary state attached to a step. At most one per step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub step_id: StepId,
    pub context_window: Value,
    pub environment: Value,
    pub tool_state: Value,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalRecord {
    pub id: EvalId,
    pub trace_id: TraceId,
    pub evaluator_type: EvaluatorType,
    pub evaluator_name: String,
    pub score: f64,
    pub passed: bool,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub name: String,
    pub description: Option<String>,
    pub action: GuardAction,
    pub priority: i64,
    pub enabled: bool,
    pub match_pattern: Value,
    pub action_params: Option<Value>,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

/// A trace together with its ordered steps and stored verdicts, as returned
/// by the store's read path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedTrace {
    pub trace: TraceRecord,
    pub steps: Vec<StepRecord>,
    pub evals: Vec<EvalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceList {
    pub items: Vec<TraceRecord>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForkResult {
    pub original_trace_id: TraceId,
    pub forked_trace_id: TraceId,
    pub forked_from_step: i64,
    pub steps_copied: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInput {
    pub context_window: Option<Value>,
    pub environment: Option<Value>,
    pub tool_state: Option<Value>,
    #[serde(default)]
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepInput {
    pub step_number: i64,
    pub step_type: StepType,
    pub name: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub duration_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub model: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<Value>,
    pub snapshot: Option<SnapshotInput>,
}

impl StepInput {
    #[must_use]
    pub fn new(step_number: i64, step_type: StepType, name: &str) -> Self {
        Self {
            step_number,
            step_type,
            name: name.to_string(),
            input: None,
            output: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            tokens_used: None,
            model: None,
            error: None,
            metadata: None,
            snapshot: None,
        }
    }

    /// # Errors
    /// Returns `ReplayError::InvalidInput` on a violated field constraint.
    pub fn validate(&self) -> Result<()> {
        if self.step_number < 1 {
            return Err(ReplayError::InvalidInput(format!(
                "steps.step_number MUST be a positive integer, got {}",
                self.step_number
            )));
        }
        ensure_non_empty("steps.name", &self.name)?;
        ensure_non_negative_int("steps.duration_ms", self.duration_ms)?;
        ensure_non_negative_int("steps.tokens_used", self.tokens_used)?;
        if let Some(snapshot) = &self.snapshot {
            if snapshot.token_count < 0 {
                return Err(ReplayError::InvalidInput(format!(
                    "steps.snapshot.token_count MUST be non-negative, got {}",
                    snapshot.token_count
                )));
            }
        }
        Ok(())
    }
}

/// Ingest payload for a fully-materialised trace, steps and snapshots
/// included. Defaults are resolved by the repository, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceInput {
    pub agent_name: String,
    pub agent_version: Option<String>,
    pub trigger: Option<Trigger>,
    pub status: Option<TraceStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub total_duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<f64>,
    pub error: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
    pub parent_trace_id: Option<TraceId>,
    pub forked_from_step: Option<i64>,
    #[serde(default)]
    pub steps: Vec<StepInput>,
}

impl TraceInput {
    #[must_use]
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns `ReplayError::InvalidInput` on a violated field constraint.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("agent_name", &self.agent_name)?;
        ensure_non_negative_int("total_duration_ms", self.total_duration_ms)?;
        ensure_non_negative_int("total_tokens", self.total_tokens)?;
        if let Some(cost) = self.total_cost_usd {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ReplayError::InvalidInput(format!(
                    "total_cost_usd MUST be finite and non-negative, got {cost}"
                )));
            }
        }
        if self.parent_trace_id.is_some() != self.forked_from_step.is_some() {
            return Err(ReplayError::InvalidInput(
                "parent_trace_id and forked_from_step MUST be supplied together".to_string(),
            ));
        }
        if let Some(from_step) = self.forked_from_step {
            if from_step < 1 {
                return Err(ReplayError::InvalidInput(format!(
                    "forked_from_step MUST be a positive integer, got {from_step}"
                )));
            }
        }
        for step in &self.steps {
            step.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalInput {
    pub evaluator_type: EvaluatorType,
    pub evaluator_name: String,
    pub score: f64,
    pub passed: bool,
    pub details: Option<Value>,
}

impl EvalInput {
    /// # Errors
    /// Returns `ReplayError::InvalidInput` on a violated field constraint.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("evaluator_name", &self.evaluator_name)?;
        if !self.score.is_finite() {
            return Err(ReplayError::InvalidInput(
                "score MUST be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyInput {
    pub name: String,
    pub description: Option<String>,
    pub action: GuardAction,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub match_pattern: Value,
    pub action_params: Option<Value>,
    pub tags: Option<Vec<String>>,
}

impl PolicyInput {
    /// # Errors
    /// Returns `ReplayError::InvalidInput` on a violated field constraint.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("name", &self.name)?;
        if !self.match_pattern.is_object() {
            return Err(ReplayError::InvalidInput(
                "match_pattern MUST be an object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sparse update for a stored trace; only populated fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TracePatch {
    pub status: Option<TraceStatus>,
    pub output: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub total_duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<f64>,
    pub error: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

impl TracePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.output.is_none()
            && self.ended_at.is_none()
            && self.total_duration_ms.is_none()
            && self.total_tokens.is_none()
            && self.total_cost_usd.is_none()
            && self.error.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
    }
}

/// Sort keys accepted by the trace list; anything else is rejected before it
/// reaches SQL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TraceSort {
    StartedAt,
    Duration,
    Tokens,
    Cost,
    AgentName,
}

impl TraceSort {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started_at" => Some(Self::StartedAt),
            "duration" => Some(Self::Duration),
            "tokens" => Some(Self::Tokens),
            "cost" => Some(Self::Cost),
            "agent_name" => Some(Self::AgentName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceFilter {
    pub status: Option<TraceStatus>,
    /// Substring match on the agent name.
    pub agent_name: Option<String>,
    /// Traces whose tag array contains this exact tag.
    pub tag: Option<String>,
    /// Lower bound (inclusive) on `started_at`.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub since: Option<DateTimeUtc>,
    pub sort: Option<TraceSort>,
    /// Sort ascending instead of the default descending.
    #[serde(default)]
    pub ascending: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Formats a timestamp as RFC 3339 text, the only form the store persists.
///
/// # Errors
/// Returns `ReplayError::InvalidInput` if the value cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ReplayError::InvalidInput(format!("invalid datetime: {err}")))
}

/// # Errors
/// Returns `ReplayError::InvalidInput` on malformed RFC 3339 text.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ReplayError::InvalidInput(format!("invalid RFC 3339 timestamp: {err}")))
}

/// Serializes a JSON value to its stored text form. `serde_json`'s default
/// map is ordered, so object keys always come out sorted: the persisted text
/// is canonical and byte-equality equals semantic equality for the diff
/// engine.
///
/// # Errors
/// Returns `ReplayError::Storage` if serialization fails.
pub fn canonical_json(value: &Value) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|err| ReplayError::Storage(format!("json serialization failed: {err}")))
}

/// # Errors
/// Returns `ReplayError::InvalidInput` when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ReplayError::InvalidInput(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

fn ensure_non_negative_int(field_name: &str, value: Option<i64>) -> Result<()> {
    if let Some(value) = value {
        if value < 0 {
            return Err(ReplayError::InvalidInput(format!(
                "{field_name} MUST be non-negative, got {value}"
            )));
        }
    }
    Ok(())
}
