#![forbid(unsafe_code)]

//! Embedded SQLite store and trace repository.
//!
//! The store is the sole writer of durable state. Every multi-row write
//! (ingest, append, fork, eval, policy) runs inside a single transaction via
//! [`SqliteTraceStore::do_tx`]; readers go through WAL and never block each
//! other.

use std::path::Path;

use agent_replay_domain::{
    canonical_json, format_rfc3339, now_utc, parse_rfc3339, EvalId, EvalInput, EvalRecord,
    EvaluatorType, ForkResult, GuardAction, PolicyId, PolicyInput, PolicyRecord, ReplayError,
    ResolvedTrace, Result, SnapshotId, SnapshotRecord, StepId, StepInput, StepRecord, StepType,
    TraceFilter, TraceId, TraceInput, TraceList, TracePatch, TraceRecord, TraceSort, TraceStatus,
    Trigger,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS agent_traces (
  id TEXT PRIMARY KEY,
  agent_name TEXT NOT NULL,
  agent_version TEXT,
  "trigger" TEXT NOT NULL DEFAULT 'manual'
    CHECK ("trigger" IN ('manual','user_message','cron','webhook','api','event')),
  status TEXT NOT NULL DEFAULT 'running'
    CHECK (status IN ('running','completed','failed','timeout')),
  input TEXT NOT NULL DEFAULT '{}',
  output TEXT,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  total_duration_ms INTEGER CHECK (total_duration_ms IS NULL OR total_duration_ms >= 0),
  total_tokens INTEGER CHECK (total_tokens IS NULL OR total_tokens >= 0),
  total_cost_usd REAL CHECK (total_cost_usd IS NULL OR total_cost_usd >= 0),
  error TEXT,
  tags TEXT NOT NULL DEFAULT '[]',
  metadata TEXT NOT NULL DEFAULT '{}',
  parent_trace_id TEXT REFERENCES agent_traces(id) ON DELETE SET NULL,
  forked_from_step INTEGER,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_traces_status ON agent_traces(status);
CREATE INDEX IF NOT EXISTS idx_agent_traces_agent_name ON agent_traces(agent_name);
CREATE INDEX IF NOT EXISTS idx_agent_traces_started_at ON agent_traces(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_agent_traces_parent ON agent_traces(parent_trace_id);

CREATE TABLE IF NOT EXISTS agent_trace_steps (
  id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL REFERENCES agent_traces(id) ON DELETE CASCADE,
  step_number INTEGER NOT NULL CHECK (step_number >= 1),
  step_type TEXT NOT NULL
    CHECK (step_type IN ('thought','tool_call','llm_call','retrieval','output','decision','error','guard_check')),
  name TEXT NOT NULL,
  input TEXT NOT NULL DEFAULT '{}',
  output TEXT,
  started_at TEXT,
  ended_at TEXT,
  duration_ms INTEGER,
  tokens_used INTEGER,
  model TEXT,
  error TEXT,
  metadata TEXT NOT NULL DEFAULT '{}',
  UNIQUE (trace_id, step_number)
);

CREATE INDEX IF NOT EXISTS idx_agent_trace_steps_trace_number
  ON agent_trace_steps(trace_id, step_number);
CREATE INDEX IF NOT EXISTS idx_agent_trace_steps_trace_type
  ON agent_trace_steps(trace_id, step_type);

CREATE TABLE IF NOT EXISTS agent_trace_snapshots (
  id TEXT PRIMARY KEY,
  step_id TEXT NOT NULL UNIQUE REFERENCES agent_trace_steps(id) ON DELETE CASCADE,
  context_window TEXT NOT NULL DEFAULT '{}',
  environment TEXT NOT NULL DEFAULT '{}',
  tool_state TEXT NOT NULL DEFAULT '{}',
  token_count INTEGER NOT NULL DEFAULT 0 CHECK (token_count >= 0)
);

CREATE TABLE IF NOT EXISTS agent_trace_evals (
  id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL REFERENCES agent_traces(id) ON DELETE CASCADE,
  evaluator_type TEXT NOT NULL CHECK (evaluator_type IN ('rubric','llm_judge','policy_check')),
  evaluator_name TEXT NOT NULL,
  score REAL NOT NULL,
  passed INTEGER NOT NULL CHECK (passed IN (0,1)),
  details TEXT NOT NULL DEFAULT '{}',
  evaluated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_trace_evals_trace ON agent_trace_evals(trace_id);

CREATE TABLE IF NOT EXISTS guardrail_policies (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT,
  action TEXT NOT NULL CHECK (action IN ('allow','deny','warn','require_review')),
  priority INTEGER NOT NULL DEFAULT 0,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0,1)),
  match_pattern TEXT NOT NULL DEFAULT '{}',
  action_params TEXT,
  tags TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_guardrail_policies_action ON guardrail_policies(action);
CREATE INDEX IF NOT EXISTS idx_guardrail_policies_enabled ON guardrail_policies(enabled);
"#;

const TRACE_COLUMNS: &str = r#"id, agent_name, agent_version, "trigger", status, input, output, started_at, ended_at, total_duration_ms, total_tokens, total_cost_usd, error, tags, metadata, parent_trace_id, forked_from_step, created_at"#;

const STEP_COLUMNS: &str = "id, trace_id, step_number, step_type, name, input, output, started_at, ended_at, duration_ms, tokens_used, model, error, metadata";

const SNAPSHOT_COLUMNS: &str = "id, step_id, context_window, environment, tool_state, token_count";

const EVAL_COLUMNS: &str =
    "id, trace_id, evaluator_type, evaluator_name, score, passed, details, evaluated_at";

const POLICY_COLUMNS: &str = "id, name, description, action, priority, enabled, match_pattern, action_params, tags, created_at, updated_at";

pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create the trace database: ensures the parent directory,
    /// configures WAL + foreign keys, and runs any pending migrations.
    ///
    /// # Errors
    /// Returns `ReplayError::Storage` when the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    ReplayError::Storage(format!(
                        "failed to create {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|err| {
            ReplayError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;

        let store = Self { conn };
        store.run_migrations()?;
        debug!(path = %path.display(), "trace database opened");
        Ok(store)
    }

    /// Apply any schema versions newer than the database's current one, in
    /// order. Only v0 -> v1 exists today.
    ///
    /// # Errors
    /// Returns `ReplayError::Storage` if a migration cannot be applied.
    pub fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(db_err)?;

        let mut current = self.schema_version()?;
        while current < SCHEMA_VERSION {
            let next = current + 1;
            match next {
                1 => self.conn.execute_batch(SCHEMA_V1).map_err(db_err)?,
                _ => {
                    return Err(ReplayError::Storage(format!(
                        "no migration path to schema version {next}"
                    )))
                }
            }
            self.conn
                .execute(
                    "INSERT INTO schema_version(version, applied_at) VALUES (?1, ?2)",
                    params![next, format_rfc3339(now_utc())?],
                )
                .map_err(db_err)?;
            info!(version = next, "schema migration applied");
            current = next;
        }
        Ok(())
    }

    /// The highest applied schema version, 0 for a fresh database.
    ///
    /// # Errors
    /// Returns `ReplayError::Storage` on an engine fault.
    pub fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(db_err)?;
        Ok(version.unwrap_or(0))
    }

    /// Run `f` inside a single transaction; commit on `Ok`, roll back on
    /// `Err`. All multi-row writes go through here.
    ///
    /// # Errors
    /// Propagates the closure's error, or `ReplayError::Storage` /
    /// `ReplayError::InvalidInput` from the engine.
    pub fn do_tx<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction().map_err(db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Ingest a fully-materialised trace with its steps and snapshots in one
    /// transaction, and return the stored trace row re-read.
    ///
    /// # Errors
    /// `invalid_input` on violated field constraints or duplicate step
    /// numbers.
    pub fn ingest_trace(&mut self, input: &TraceInput) -> Result<TraceRecord> {
        input.validate()?;

        let now = now_utc();
        let status = input.status.unwrap_or(if input.ended_at.is_some() {
            TraceStatus::Completed
        } else {
            TraceStatus::Running
        });
        let trace = TraceRecord {
            id: TraceId::mint(),
            agent_name: input.agent_name.clone(),
            agent_version: input.agent_version.clone(),
            trigger: input.trigger.unwrap_or(Trigger::Manual),
            status,
            input: input.input.clone().unwrap_or_else(|| json!({})),
            output: input.output.clone(),
            started_at: input.started_at.unwrap_or(now),
            ended_at: input.ended_at,
            total_duration_ms: input.total_duration_ms,
            total_tokens: input.total_tokens,
            total_cost_usd: input.total_cost_usd,
            error: input.error.clone(),
            tags: input.tags.clone().unwrap_or_default(),
            metadata: input.metadata.clone().unwrap_or_else(|| json!({})),
            parent_trace_id: input.parent_trace_id.clone(),
            forked_from_step: input.forked_from_step,
            created_at: now,
        };

        let mut steps = Vec::with_capacity(input.steps.len());
        for step_input in &input.steps {
            steps.push(step_record_from_input(&trace.id, step_input));
        }

        self.do_tx(|tx| {
            insert_trace_row(tx, &trace)?;
            for (step, snapshot) in &steps {
                insert_step_row(tx, step)?;
                if let Some(snapshot) = snapshot {
                    insert_snapshot_row(tx, snapshot)?;
                }
            }
            Ok(())
        })?;

        debug!(trace_id = %trace.id, steps = steps.len(), "trace ingested");
        self.get_trace_record(trace.id.as_str())?
            .ok_or_else(|| ReplayError::Storage("ingested trace row missing on re-read".to_string()))
    }

    /// Append one step (and its optional snapshot) to a running trace.
    ///
    /// # Errors
    /// `not_found` for an unknown trace, `invalid_state` for a terminal one,
    /// `invalid_input` for field violations or a duplicate step number.
    pub fn append_step(&mut self, trace_id: &str, input: &StepInput) -> Result<StepRecord> {
        input.validate()?;
        let trace = self
            .get_trace_record(trace_id)?
            .ok_or_else(|| ReplayError::NotFound(format!("trace '{trace_id}' not found")))?;
        if trace.status.is_terminal() {
            return Err(ReplayError::InvalidState(format!(
                "trace '{}' is {}; steps can only be appended while running",
                trace.id,
                trace.status.as_str()
            )));
        }

        let (step, snapshot) = step_record_from_input(&trace.id, input);
        self.do_tx(|tx| {
            insert_step_row(tx, &step)?;
            if let Some(snapshot) = &snapshot {
                insert_snapshot_row(tx, snapshot)?;
            }
            Ok(())
        })?;
        debug!(trace_id = %trace.id, step_number = step.step_number, "step appended");
        Ok(step)
    }

    /// Resolve a trace by exact id or unique id prefix, returning it with
    /// its steps (ascending) and verdicts (most recent first).
    ///
    /// # Errors
    /// `invalid_input` when the prefix matches more than one trace.
    pub fn get_trace(&self, id_or_prefix: &str) -> Result<Option<ResolvedTrace>> {
        let id = match self.resolve_trace_id(id_or_prefix)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let trace = match self.get_trace_record(&id)? {
            Some(trace) => trace,
            None => return Ok(None),
        };
        let steps = self.steps_for_trace(&id)?;
        let evals = self.evals_for_trace(&id)?;
        Ok(Some(ResolvedTrace {
            trace,
            steps,
            evals,
        }))
    }

    /// List traces matching the filter, with the unpaginated total.
    ///
    /// # Errors
    /// `ReplayError::Storage` on an engine fault.
    pub fn list_traces(&self, filter: &TraceFilter) -> Result<TraceList> {
        use rusqlite::types::Value as SqlValue;

        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(agent_name) = &filter.agent_name {
            clauses.push("agent_name LIKE '%' || ? || '%'");
            args.push(SqlValue::Text(agent_name.clone()));
        }
        if let Some(tag) = &filter.tag {
            // Tags persist as a canonical JSON array, so containment is a
            // substring test against the quoted element.
            clauses.push("tags LIKE '%' || ? || '%'");
            args.push(SqlValue::Text(canonical_json(&Value::String(tag.clone()))?));
        }
        if let Some(since) = filter.since {
            clauses.push("started_at >= ?");
            args.push(SqlValue::Text(format_rfc3339(since)?));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM agent_traces{where_sql}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let order_column = match filter.sort.unwrap_or(TraceSort::StartedAt) {
            TraceSort::StartedAt => "started_at",
            TraceSort::Duration => "total_duration_ms",
            TraceSort::Tokens => "total_tokens",
            TraceSort::Cost => "total_cost_usd",
            TraceSort::AgentName => "agent_name",
        };
        let direction = if filter.ascending { "ASC" } else { "DESC" };
        let limit = filter.limit.unwrap_or(25).max(0);
        let offset = filter.offset.unwrap_or(0).max(0);

        let sql = format!(
            "SELECT {TRACE_COLUMNS} FROM agent_traces{where_sql}
             ORDER BY {order_column} {direction}, id ASC LIMIT ? OFFSET ?"
        );
        args.push(SqlValue::Integer(limit));
        args.push(SqlValue::Integer(offset));

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params_from_iter(args.iter())).map_err(db_err)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            items.push(trace_from_row(row)?);
        }
        Ok(TraceList { items, total })
    }

    /// Write the populated fields of `patch`; an empty patch reads the row
    /// back unchanged.
    ///
    /// # Errors
    /// `not_found` for an unknown trace, `invalid_input` for violated
    /// numeric constraints.
    pub fn update_trace(&mut self, id: &str, patch: &TracePatch) -> Result<TraceRecord> {
        use rusqlite::types::Value as SqlValue;

        let current = self
            .get_trace_record(id)?
            .ok_or_else(|| ReplayError::NotFound(format!("trace '{id}' not found")))?;
        if patch.is_empty() {
            return Ok(current);
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(status) = patch.status {
            sets.push("status = ?");
            args.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(output) = &patch.output {
            sets.push("output = ?");
            args.push(SqlValue::Text(canonical_json(output)?));
        }
        if let Some(ended_at) = patch.ended_at {
            sets.push("ended_at = ?");
            args.push(SqlValue::Text(format_rfc3339(ended_at)?));
        }
        if let Some(duration) = patch.total_duration_ms {
            if duration < 0 {
                return Err(ReplayError::InvalidInput(format!(
                    "total_duration_ms MUST be non-negative, got {duration}"
                )));
            }
            sets.push("total_duration_ms = ?");
            args.push(SqlValue::Integer(duration));
        }
        if let Some(tokens) = patch.total_tokens {
            if tokens < 0 {
                return Err(ReplayError::InvalidInput(format!(
                    "total_tokens MUST be non-negative, got {tokens}"
                )));
            }
            sets.push("total_tokens = ?");
            args.push(SqlValue::Integer(tokens));
        }
        if let Some(cost) = patch.total_cost_usd {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ReplayError::InvalidInput(format!(
                    "total_cost_usd MUST be finite and non-negative, got {cost}"
                )));
            }
            sets.push("total_cost_usd = ?");
            args.push(SqlValue::Real(cost));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            args.push(SqlValue::Text(error.clone()));
        }
        if let Some(tags) = &patch.tags {
            sets.push("tags = ?");
            args.push(SqlValue::Text(tags_to_text(tags)?));
        }
        if let Some(metadata) = &patch.metadata {
            sets.push("metadata = ?");
            args.push(SqlValue::Text(canonical_json(metadata)?));
        }

        let sql = format!(
            "UPDATE agent_traces SET {} WHERE id = ?",
            sets.join(", ")
        );
        args.push(SqlValue::Text(current.id.as_str().to_string()));
        self.conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(db_err)?;

        self.get_trace_record(current.id.as_str())?
            .ok_or_else(|| ReplayError::Storage("updated trace row missing on re-read".to_string()))
    }

    /// Delete a trace; steps, snapshots, and verdicts cascade with it.
    ///
    /// # Errors
    /// `not_found` for an unknown trace.
    pub fn delete_trace(&mut self, id: &str) -> Result<()> {
        let affected = self.do_tx(|tx| {
            tx.execute("DELETE FROM agent_traces WHERE id = ?1", params![id])
                .map_err(db_err)
        })?;
        if affected == 0 {
            return Err(ReplayError::NotFound(format!("trace '{id}' not found")));
        }
        debug!(trace_id = id, "trace deleted");
        Ok(())
    }

    /// # Errors
    /// `ReplayError::Storage` on an engine fault.
    pub fn get_step_snapshot(
        &self,
        trace_id: &str,
        step_number: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let sql = format!(
            "SELECT {} FROM agent_trace_snapshots s
             JOIN agent_trace_steps st ON st.id = s.step_id
             WHERE st.trace_id = ?1 AND st.step_number = ?2",
            SNAPSHOT_COLUMNS
                .split(", ")
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt
            .query(params![trace_id, step_number])
            .map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(snapshot_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Store an evaluation verdict. The score is clamped to [0, 1] and
    /// `passed` is stored explicitly, never derived at read time.
    ///
    /// # Errors
    /// `not_found` for an unknown trace, `invalid_input` for a non-finite
    /// score or empty evaluator name.
    pub fn create_eval(&mut self, trace_id: &str, input: &EvalInput) -> Result<EvalRecord> {
        input.validate()?;
        let trace = self
            .get_trace_record(trace_id)?
            .ok_or_else(|| ReplayError::NotFound(format!("trace '{trace_id}' not found")))?;

        let record = EvalRecord {
            id: EvalId::mint(),
            trace_id: trace.id,
            evaluator_type: input.evaluator_type,
            evaluator_name: input.evaluator_name.clone(),
            score: input.score.clamp(0.0, 1.0),
            passed: input.passed,
            details: input.details.clone().unwrap_or_else(|| json!({})),
            evaluated_at: now_utc(),
        };
        self.do_tx(|tx| insert_eval_row(tx, &record))?;
        Ok(record)
    }

    /// Fork a trace: copy the parent's step prefix (snapshots included) up
    /// to `from_step` into a fresh trace born `running`, optionally
    /// overriding the input and the fork-point snapshot environment.
    ///
    /// # Errors
    /// `invalid_input` for a non-positive `from_step`, `not_found` for an
    /// unknown parent, `invalid_state` for a stepless parent or a
    /// `from_step` past the parent's last step.
    pub fn fork_trace(
        &mut self,
        parent_id: &str,
        from_step: i64,
        modified_input: Option<Value>,
        modified_env: Option<Value>,
    ) -> Result<ForkResult> {
        if from_step < 1 {
            return Err(ReplayError::InvalidInput(format!(
                "from_step MUST be a positive integer, got {from_step}"
            )));
        }
        let parent = self
            .get_trace_record(parent_id)?
            .ok_or_else(|| ReplayError::NotFound(format!("trace '{parent_id}' not found")))?;
        let parent_steps = self.steps_for_trace(parent.id.as_str())?;
        if parent_steps.is_empty() {
            return Err(ReplayError::InvalidState(format!(
                "trace '{}' has no steps to fork from",
                parent.id
            )));
        }
        let last_step = parent_steps
            .iter()
            .map(|step| step.step_number)
            .max()
            .unwrap_or(0);
        if from_step > last_step {
            return Err(ReplayError::InvalidState(format!(
                "from_step {from_step} is past the last step {last_step} of trace '{}'",
                parent.id
            )));
        }

        let now = now_utc();
        let forked = TraceRecord {
            id: TraceId::mint(),
            agent_name: parent.agent_name.clone(),
            agent_version: parent.agent_version.clone(),
            trigger: Trigger::Manual,
            status: TraceStatus::Running,
            input: modified_input.unwrap_or_else(|| parent.input.clone()),
            output: None,
            started_at: now,
            ended_at: None,
            total_duration_ms: None,
            total_tokens: None,
            total_cost_usd: None,
            error: None,
            tags: parent.tags.clone(),
            metadata: json!({
                "forked_from": parent.id.as_str(),
                "forked_at_step": from_step,
            }),
            parent_trace_id: Some(parent.id.clone()),
            forked_from_step: Some(from_step),
            created_at: now,
        };

        let mut copies = Vec::new();
        for step in parent_steps
            .iter()
            .filter(|step| step.step_number <= from_step)
        {
            let mut copy = step.clone();
            copy.id = StepId::mint();
            copy.trace_id = forked.id.clone();

            let snapshot = self.snapshot_for_step(step.id.as_str())?.map(|snapshot| {
                let mut snapshot_copy = snapshot;
                snapshot_copy.id = SnapshotId::mint();
                snapshot_copy.step_id = copy.id.clone();
                // The environment override applies only at the fork point;
                // context window, tool state, and token count carry over.
                if step.step_number == from_step {
                    if let Some(env) = &modified_env {
                        snapshot_copy.environment = env.clone();
                    }
                }
                snapshot_copy
            });
            copies.push((copy, snapshot));
        }

        self.do_tx(|tx| {
            insert_trace_row(tx, &forked)?;
            for (step, snapshot) in &copies {
                insert_step_row(tx, step)?;
                if let Some(snapshot) = snapshot {
                    insert_snapshot_row(tx, snapshot)?;
                }
            }
            Ok(())
        })?;

        info!(
            parent = %parent.id,
            fork = %forked.id,
            steps_copied = copies.len(),
            "trace forked"
        );
        Ok(ForkResult {
            original_trace_id: parent.id,
            forked_trace_id: forked.id,
            forked_from_step: from_step,
            steps_copied: copies.len() as i64,
        })
    }

    /// # Errors
    /// `invalid_input` for a duplicate policy name or violated field
    /// constraint.
    pub fn add_policy(&mut self, input: &PolicyInput) -> Result<PolicyRecord> {
        input.validate()?;
        let now = now_utc();
        let record = PolicyRecord {
            id: PolicyId::mint(),
            name: input.name.clone(),
            description: input.description.clone(),
            action: input.action,
            priority: input.priority.unwrap_or(0),
            enabled: input.enabled.unwrap_or(true),
            match_pattern: input.match_pattern.clone(),
            action_params: input.action_params.clone(),
            tags: input.tags.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        self.do_tx(|tx| insert_policy_row(tx, &record))?;
        debug!(policy = %record.name, action = record.action.as_str(), "policy added");
        Ok(record)
    }

    /// List policies ordered by descending priority (name breaks ties).
    ///
    /// # Errors
    /// `ReplayError::Storage` on an engine fault.
    pub fn list_policies(&self, enabled_only: bool) -> Result<Vec<PolicyRecord>> {
        let sql = if enabled_only {
            format!(
                "SELECT {POLICY_COLUMNS} FROM guardrail_policies
                 WHERE enabled = 1 ORDER BY priority DESC, name ASC"
            )
        } else {
            format!(
                "SELECT {POLICY_COLUMNS} FROM guardrail_policies
                 ORDER BY priority DESC, name ASC"
            )
        };
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(policy_from_row(row)?);
        }
        Ok(out)
    }

    /// Remove a policy by id, falling back to its unique name.
    ///
    /// # Errors
    /// `not_found` when neither matches.
    pub fn remove_policy(&mut self, id_or_name: &str) -> Result<()> {
        let affected = self.do_tx(|tx| {
            let by_id = tx
                .execute(
                    "DELETE FROM guardrail_policies WHERE id = ?1",
                    params![id_or_name],
                )
                .map_err(db_err)?;
            if by_id > 0 {
                return Ok(by_id);
            }
            tx.execute(
                "DELETE FROM guardrail_policies WHERE name = ?1",
                params![id_or_name],
            )
            .map_err(db_err)
        })?;
        if affected == 0 {
            return Err(ReplayError::NotFound(format!(
                "policy '{id_or_name}' not found"
            )));
        }
        Ok(())
    }

    fn resolve_trace_id(&self, id_or_prefix: &str) -> Result<Option<String>> {
        let exact: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM agent_traces WHERE id = ?1",
                params![id_or_prefix],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if exact.is_some() {
            return Ok(exact);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id FROM agent_traces WHERE id LIKE ?1 || '%' ORDER BY id LIMIT 2")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![id_or_prefix]).map_err(db_err)?;
        let mut matches: Vec<String> = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            matches.push(col(row, 0)?);
        }
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(ReplayError::InvalidInput(format!(
                "ambiguous trace id prefix '{id_or_prefix}'"
            ))),
        }
    }

    fn get_trace_record(&self, id: &str) -> Result<Option<TraceRecord>> {
        let sql = format!("SELECT {TRACE_COLUMNS} FROM agent_traces WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![id]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(trace_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn steps_for_trace(&self, trace_id: &str) -> Result<Vec<StepRecord>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM agent_trace_steps
             WHERE trace_id = ?1 ORDER BY step_number ASC"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![trace_id]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(step_from_row(row)?);
        }
        Ok(out)
    }

    fn evals_for_trace(&self, trace_id: &str) -> Result<Vec<EvalRecord>> {
        let sql = format!(
            "SELECT {EVAL_COLUMNS} FROM agent_trace_evals
             WHERE trace_id = ?1 ORDER BY evaluated_at DESC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![trace_id]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            out.push(eval_from_row(row)?);
        }
        Ok(out)
    }

    fn snapshot_for_step(&self, step_id: &str) -> Result<Option<SnapshotRecord>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM agent_trace_snapshots WHERE step_id = ?1"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![step_id]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(snapshot_from_row(row)?)),
            None => Ok(None),
        }
    }
}

fn step_record_from_input(
    trace_id: &TraceId,
    input: &StepInput,
) -> (StepRecord, Option<SnapshotRecord>) {
    let step = StepRecord {
        id: StepId::mint(),
        trace_id: trace_id.clone(),
        step_number: input.step_number,
        step_type: input.step_type,
        name: input.name.clone(),
        input: input.input.clone().unwrap_or_else(|| json!({})),
        output: input.output.clone(),
        started_at: input.started_at,
        ended_at: input.ended_at,
        duration_ms: input.duration_ms,
        tokens_used: input.tokens_used,
        model: input.model.clone(),
        error: input.error.clone(),
        metadata: input.metadata.clone().unwrap_or_else(|| json!({})),
    };
    let snapshot = input.snapshot.as_ref().map(|snapshot| SnapshotRecord {
        id: SnapshotId::mint(),
        step_id: step.id.clone(),
        context_window: snapshot.context_window.clone().unwrap_or_else(|| json!({})),
        environment: snapshot.environment.clone().unwrap_or_else(|| json!({})),
        tool_state: snapshot.tool_state.clone().unwrap_or_else(|| json!({})),
        token_count: snapshot.token_count,
    });
    (step, snapshot)
}

fn insert_trace_row(conn: &Connection, trace: &TraceRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO agent_traces({TRACE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            trace.id.as_str(),
            trace.agent_name,
            trace.agent_version,
            trace.trigger.as_str(),
            trace.status.as_str(),
            canonical_json(&trace.input)?,
            trace.output.as_ref().map(canonical_json).transpose()?,
            format_rfc3339(trace.started_at)?,
            trace.ended_at.map(format_rfc3339).transpose()?,
            trace.total_duration_ms,
            trace.total_tokens,
            trace.total_cost_usd,
            trace.error,
            tags_to_text(&trace.tags)?,
            canonical_json(&trace.metadata)?,
            trace.parent_trace_id.as_ref().map(TraceId::as_str),
            trace.forked_from_step,
            format_rfc3339(trace.created_at)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_step_row(conn: &Connection, step: &StepRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO agent_trace_steps({STEP_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            step.id.as_str(),
            step.trace_id.as_str(),
            step.step_number,
            step.step_type.as_str(),
            step.name,
            canonical_json(&step.input)?,
            step.output.as_ref().map(canonical_json).transpose()?,
            step.started_at.map(format_rfc3339).transpose()?,
            step.ended_at.map(format_rfc3339).transpose()?,
            step.duration_ms,
            step.tokens_used,
            step.model,
            step.error,
            canonical_json(&step.metadata)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_snapshot_row(conn: &Connection, snapshot: &SnapshotRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO agent_trace_snapshots({SNAPSHOT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            snapshot.id.as_str(),
            snapshot.step_id.as_str(),
            canonical_json(&snapshot.context_window)?,
            canonical_json(&snapshot.environment)?,
            canonical_json(&snapshot.tool_state)?,
            snapshot.token_count,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_eval_row(conn: &Connection, eval: &EvalRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO agent_trace_evals({EVAL_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            eval.id.as_str(),
            eval.trace_id.as_str(),
            eval.evaluator_type.as_str(),
            eval.evaluator_name,
            eval.score,
            i64::from(eval.passed),
            canonical_json(&eval.details)?,
            format_rfc3339(eval.evaluated_at)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_policy_row(conn: &Connection, policy: &PolicyRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO guardrail_policies({POLICY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            policy.id.as_str(),
            policy.name,
            policy.description,
            policy.action.as_str(),
            policy.priority,
            i64::from(policy.enabled),
            canonical_json(&policy.match_pattern)?,
            policy.action_params.as_ref().map(canonical_json).transpose()?,
            tags_to_text(&policy.tags)?,
            format_rfc3339(policy.created_at)?,
            format_rfc3339(policy.updated_at)?,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn trace_from_row(row: &Row<'_>) -> Result<TraceRecord> {
    let id: String = col(row, 0)?;
    let trigger_raw: String = col(row, 3)?;
    let status_raw: String = col(row, 4)?;
    let input_raw: String = col(row, 5)?;
    let output_raw: Option<String> = col(row, 6)?;
    let started_raw: String = col(row, 7)?;
    let ended_raw: Option<String> = col(row, 8)?;
    let tags_raw: String = col(row, 13)?;
    let metadata_raw: String = col(row, 14)?;
    let parent_raw: Option<String> = col(row, 15)?;
    let created_raw: String = col(row, 17)?;

    Ok(TraceRecord {
        id: TraceId::parse(&id)?,
        agent_name: col(row, 1)?,
        agent_version: col(row, 2)?,
        trigger: Trigger::parse(&trigger_raw)
            .ok_or_else(|| ReplayError::Storage(format!("unknown trigger '{trigger_raw}'")))?,
        status: TraceStatus::parse(&status_raw)
            .ok_or_else(|| ReplayError::Storage(format!("unknown status '{status_raw}'")))?,
        input: json_from(&input_raw)?,
        output: output_raw.as_deref().map(json_from).transpose()?,
        started_at: parse_rfc3339(&started_raw)?,
        ended_at: ended_raw.as_deref().map(parse_rfc3339).transpose()?,
        total_duration_ms: col(row, 9)?,
        total_tokens: col(row, 10)?,
        total_cost_usd: col(row, 11)?,
        error: col(row, 12)?,
        tags: tags_from_text(&tags_raw)?,
        metadata: json_from(&metadata_raw)?,
        parent_trace_id: parent_raw.as_deref().map(TraceId::parse).transpose()?,
        forked_from_step: col(row, 16)?,
        created_at: parse_rfc3339(&created_raw)?,
    })
}

fn step_from_row(row: &Row<'_>) -> Result<StepRecord> {
    let id: String = col(row, 0)?;
    let trace_id: String = col(row, 1)?;
    let type_raw: String = col(row, 3)?;
    let input_raw: String = col(row, 5)?;
    let output_raw: Option<String> = col(row, 6)?;
    let started_raw: Option<String> = col(row, 7)?;
    let ended_raw: Option<String> = col(row, 8)?;
    let metadata_raw: String = col(row, 13)?;

    Ok(StepRecord {
        id: StepId::parse(&id)?,
        trace_id: TraceId::parse(&trace_id)?,
        step_number: col(row, 2)?,
        step_type: StepType::parse(&type_raw)
            .ok_or_else(|| ReplayError::Storage(format!("unknown step_type '{type_raw}'")))?,
        name: col(row, 4)?,
        input: json_from(&input_raw)?,
        output: output_raw.as_deref().map(json_from).transpose()?,
        started_at: started_raw.as_deref().map(parse_rfc3339).transpose()?,
        ended_at: ended_raw.as_deref().map(parse_rfc3339).transpose()?,
        duration_ms: col(row, 9)?,
        tokens_used: col(row, 10)?,
        model: col(row, 11)?,
        error: col(row, 12)?,
        metadata: json_from(&metadata_raw)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> Result<SnapshotRecord> {
    let id: String = col(row, 0)?;
    let step_id: String = col(row, 1)?;
    let context_raw: String = col(row, 2)?;
    let environment_raw: String = col(row, 3)?;
    let tool_state_raw: String = col(row, 4)?;

    Ok(SnapshotRecord {
        id: SnapshotId::parse(&id)?,
        step_id: StepId::parse(&step_id)?,
        context_window: json_from(&context_raw)?,
        environment: json_from(&environment_raw)?,
        tool_state: json_from(&tool_state_raw)?,
        token_count: col(row, 5)?,
    })
}

fn eval_from_row(row: &Row<'_>) -> Result<EvalRecord> {
    let id: String = col(row, 0)?;
    let trace_id: String = col(row, 1)?;
    let type_raw: String = col(row, 2)?;
    let passed_raw: i64 = col(row, 5)?;
    let details_raw: String = col(row, 6)?;
    let evaluated_raw: String = col(row, 7)?;

    Ok(EvalRecord {
        id: EvalId::parse(&id)?,
        trace_id: TraceId::parse(&trace_id)?,
        evaluator_type: EvaluatorType::parse(&type_raw).ok_or_else(|| {
            ReplayError::Storage(format!("unknown evaluator_type '{type_raw}'"))
        })?,
        evaluator_name: col(row, 3)?,
        score: col(row, 4)?,
        passed: passed_raw != 0,
        details: json_from(&details_raw)?,
        evaluated_at: parse_rfc3339(&evaluated_raw)?,
    })
}

fn policy_from_row(row: &Row<'_>) -> Result<PolicyRecord> {
    let id: String = col(row, 0)?;
    let action_raw: String = col(row, 3)?;
    let enabled_raw: i64 = col(row, 5)?;
    let pattern_raw: String = col(row, 6)?;
    let params_raw: Option<String> = col(row, 7)?;
    let tags_raw: String = col(row, 8)?;
    let created_raw: String = col(row, 9)?;
    let updated_raw: String = col(row, 10)?;

    Ok(PolicyRecord {
        id: PolicyId::parse(&id)?,
        name: col(row, 1)?,
        description: col(row, 2)?,
        action: GuardAction::parse(&action_raw)
            .ok_or_else(|| ReplayError::Storage(format!("unknown action '{action_raw}'")))?,
        priority: col(row, 4)?,
        enabled: enabled_raw != 0,
        match_pattern: json_from(&pattern_raw)?,
        action_params: params_raw.as_deref().map(json_from).transpose()?,
        tags: tags_from_text(&tags_raw)?,
        created_at: parse_rfc3339(&created_raw)?,
        updated_at: parse_rfc3339(&updated_raw)?,
    })
}

fn col<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> Result<T> {
    row.get(idx).map_err(db_err)
}

fn json_from(text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|err| ReplayError::Storage(format!("invalid stored JSON: {err}")))
}

fn tags_to_text(tags: &[String]) -> Result<String> {
    serde_json::to_string(tags)
        .map_err(|err| ReplayError::Storage(format!("json serialization failed: {err}")))
}

fn tags_from_text(text: &str) -> Result<Vec<String>> {
    serde_json::from_str(text)
        .map_err(|err| ReplayError::Storage(format!("invalid stored tags: {err}")))
}

/// Translate engine errors before they cross the API boundary: constraint
/// violations (uniqueness, foreign keys, CHECKs) become `invalid_input`,
/// everything else stays a storage fault.
fn db_err(err: rusqlite::Error) -> ReplayError {
    match &err {
        rusqlite::Error::SqliteFailure(cause, message)
            if cause.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ReplayError::InvalidInput(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            )
        }
        _ => ReplayError::Storage(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_replay_domain::SnapshotInput;
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "agent-replay-store-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteTraceStore {
        let store = SqliteTraceStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        store.unwrap_or_else(|_| unreachable!())
    }

    fn fixture_steps() -> Vec<StepInput> {
        let mut tool_call = StepInput::new(2, StepType::ToolCall, "search_docs");
        tool_call.input = Some(json!({"query": "rust sqlite"}));
        tool_call.output = Some(json!({"hits": 3}));
        tool_call.snapshot = Some(SnapshotInput {
            context_window: Some(json!({"messages": 4})),
            environment: Some(json!({"cwd": "/work"})),
            tool_state: Some(json!({"open_files": []})),
            token_count: 300,
        });
        vec![
            StepInput::new(1, StepType::Thought, "plan"),
            tool_call,
            StepInput::new(3, StepType::Output, "answer"),
        ]
    }

    fn fixture_trace(agent_name: &str) -> TraceInput {
        let mut input = TraceInput::new(agent_name);
        input.steps = fixture_steps();
        input
    }

    #[test]
    fn open_applies_schema_version_one_and_is_idempotent() {
        let path = temp_db_path("migrate");
        let store = SqliteTraceStore::open(&path);
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert_eq!(store.schema_version().unwrap_or(0), 1);
        assert!(store.run_migrations().is_ok());
        drop(store);

        let reopened = SqliteTraceStore::open(&path);
        assert!(reopened.is_ok());
        assert_eq!(
            reopened.unwrap_or_else(|_| unreachable!()).schema_version().unwrap_or(0),
            1
        );
    }

    #[test]
    fn minimal_ingest_resolves_defaults() {
        let mut store = open_store("minimal-ingest");
        let stored = store.ingest_trace(&TraceInput::new("a"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        assert!(stored.id.as_str().starts_with("trc_"));
        assert_eq!(stored.status, TraceStatus::Running);
        assert_eq!(stored.trigger, Trigger::Manual);
        assert!(stored.tags.is_empty());
        assert_eq!(stored.metadata, json!({}));
        assert_eq!(stored.input, json!({}));

        let resolved = store.get_trace(stored.id.as_str());
        assert!(resolved.is_ok());
        let resolved = resolved.unwrap_or_else(|_| unreachable!());
        assert!(resolved.is_some());
        let resolved = resolved.unwrap_or_else(|| unreachable!());
        assert_eq!(resolved.trace, stored);
        assert!(resolved.steps.is_empty());
        assert!(resolved.evals.is_empty());
    }

    #[test]
    fn ingest_with_ended_at_defaults_to_completed() {
        let mut store = open_store("ended-ingest");
        let mut input = TraceInput::new("a");
        input.ended_at = Some(now_utc());
        let stored = store.ingest_trace(&input);
        assert!(stored.is_ok());
        assert_eq!(
            stored.unwrap_or_else(|_| unreachable!()).status,
            TraceStatus::Completed
        );
    }

    #[test]
    fn snapshots_land_on_their_steps() {
        let mut store = open_store("snapshots");
        let stored = store.ingest_trace(&fixture_trace("snapper"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let snapshot = store.get_step_snapshot(stored.id.as_str(), 2);
        assert!(snapshot.is_ok());
        let snapshot = snapshot.unwrap_or_else(|_| unreachable!());
        assert!(snapshot.is_some());
        let snapshot = snapshot.unwrap_or_else(|| unreachable!());
        assert_eq!(snapshot.token_count, 300);
        assert_eq!(snapshot.environment, json!({"cwd": "/work"}));

        let missing = store.get_step_snapshot(stored.id.as_str(), 1);
        assert!(missing.is_ok());
        assert!(missing.unwrap_or_else(|_| unreachable!()).is_none());
    }

    #[test]
    fn append_step_rejects_terminal_trace() {
        let mut store = open_store("append-terminal");
        let mut input = TraceInput::new("a");
        input.status = Some(TraceStatus::Completed);
        let stored = store.ingest_trace(&input);
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let rejected = store.append_step(
            stored.id.as_str(),
            &StepInput::new(1, StepType::Thought, "late"),
        );
        assert!(matches!(rejected, Err(ReplayError::InvalidState(_))));
    }

    #[test]
    fn append_step_duplicate_number_is_invalid_input() {
        let mut store = open_store("append-dup");
        let stored = store.ingest_trace(&fixture_trace("dup"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let duplicate = store.append_step(
            stored.id.as_str(),
            &StepInput::new(2, StepType::Thought, "again"),
        );
        assert!(matches!(duplicate, Err(ReplayError::InvalidInput(_))));

        let appended = store.append_step(
            stored.id.as_str(),
            &StepInput::new(4, StepType::Decision, "pick"),
        );
        assert!(appended.is_ok());
    }

    #[test]
    fn append_step_unknown_trace_is_not_found() {
        let mut store = open_store("append-missing");
        let missing = store.append_step(
            "trc_000000000000",
            &StepInput::new(1, StepType::Thought, "ghost"),
        );
        assert!(matches!(missing, Err(ReplayError::NotFound(_))));
    }

    #[test]
    fn prefix_resolution_matches_exact_lookup() {
        let mut store = open_store("prefix");
        let stored = store.ingest_trace(&TraceInput::new("prefixed"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let prefix = &stored.id.as_str()[..8];
        let by_prefix = store.get_trace(prefix);
        assert!(by_prefix.is_ok());
        let by_prefix = by_prefix.unwrap_or_else(|_| unreachable!());
        assert!(by_prefix.is_some());
        assert_eq!(
            by_prefix.unwrap_or_else(|| unreachable!()).trace.id,
            stored.id
        );

        // "trc_" matches every trace once a second one exists.
        let second = store.ingest_trace(&TraceInput::new("other"));
        assert!(second.is_ok());
        let ambiguous = store.get_trace("trc_");
        assert!(matches!(ambiguous, Err(ReplayError::InvalidInput(_))));
    }

    #[test]
    fn delete_cascades_to_steps_snapshots_and_evals() {
        let mut store = open_store("cascade");
        let stored = store.ingest_trace(&fixture_trace("cascade"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());
        let verdict = store.create_eval(
            stored.id.as_str(),
            &EvalInput {
                evaluator_type: EvaluatorType::Rubric,
                evaluator_name: "manual".to_string(),
                score: 0.9,
                passed: true,
                details: None,
            },
        );
        assert!(verdict.is_ok());

        assert!(store.delete_trace(stored.id.as_str()).is_ok());
        let gone = store.get_trace(stored.id.as_str());
        assert!(gone.is_ok());
        assert!(gone.unwrap_or_else(|_| unreachable!()).is_none());

        let step_count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM agent_trace_steps", [], |row| {
                row.get(0)
            })
            .unwrap_or(-1);
        assert_eq!(step_count, 0);
        let snapshot_count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM agent_trace_snapshots", [], |row| {
                row.get(0)
            })
            .unwrap_or(-1);
        assert_eq!(snapshot_count, 0);
        let eval_count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM agent_trace_evals", [], |row| {
                row.get(0)
            })
            .unwrap_or(-1);
        assert_eq!(eval_count, 0);

        let again = store.delete_trace(stored.id.as_str());
        assert!(matches!(again, Err(ReplayError::NotFound(_))));
    }

    #[test]
    fn update_trace_writes_only_patched_fields() {
        let mut store = open_store("patch");
        let stored = store.ingest_trace(&TraceInput::new("patchable"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let unchanged = store.update_trace(stored.id.as_str(), &TracePatch::default());
        assert!(unchanged.is_ok());
        assert_eq!(unchanged.unwrap_or_else(|_| unreachable!()), stored);

        let patch = TracePatch {
            status: Some(TraceStatus::Failed),
            error: Some("tool exploded".to_string()),
            total_tokens: Some(512),
            ..TracePatch::default()
        };
        let updated = store.update_trace(stored.id.as_str(), &patch);
        assert!(updated.is_ok());
        let updated = updated.unwrap_or_else(|_| unreachable!());
        assert_eq!(updated.status, TraceStatus::Failed);
        assert_eq!(updated.error.as_deref(), Some("tool exploded"));
        assert_eq!(updated.total_tokens, Some(512));
        assert_eq!(updated.agent_name, stored.agent_name);
        assert_eq!(updated.started_at, stored.started_at);

        let missing = store.update_trace("trc_000000000000", &patch);
        assert!(matches!(missing, Err(ReplayError::NotFound(_))));
    }

    #[test]
    fn list_traces_filters_sorts_and_paginates() {
        let mut store = open_store("list");
        for (agent, tokens, tag) in [
            ("alpha-bot", 10_i64, "prod"),
            ("beta-bot", 30, "prod"),
            ("gamma-crawler", 20, "dev"),
        ] {
            let mut input = TraceInput::new(agent);
            input.total_tokens = Some(tokens);
            input.tags = Some(vec![tag.to_string()]);
            assert!(store.ingest_trace(&input).is_ok());
        }

        let all = store.list_traces(&TraceFilter::default());
        assert!(all.is_ok());
        let all = all.unwrap_or_else(|_| unreachable!());
        assert_eq!(all.total, 3);
        assert_eq!(all.items.len(), 3);

        let bots = store.list_traces(&TraceFilter {
            agent_name: Some("bot".to_string()),
            ..TraceFilter::default()
        });
        assert!(bots.is_ok());
        assert_eq!(bots.unwrap_or_else(|_| unreachable!()).total, 2);

        let prod = store.list_traces(&TraceFilter {
            tag: Some("prod".to_string()),
            ..TraceFilter::default()
        });
        assert!(prod.is_ok());
        assert_eq!(prod.unwrap_or_else(|_| unreachable!()).total, 2);

        let by_tokens = store.list_traces(&TraceFilter {
            sort: Some(TraceSort::Tokens),
            ..TraceFilter::default()
        });
        assert!(by_tokens.is_ok());
        let by_tokens = by_tokens.unwrap_or_else(|_| unreachable!());
        assert_eq!(by_tokens.items[0].total_tokens, Some(30));

        let page = store.list_traces(&TraceFilter {
            sort: Some(TraceSort::AgentName),
            ascending: true,
            limit: Some(1),
            offset: Some(1),
            ..TraceFilter::default()
        });
        assert!(page.is_ok());
        let page = page.unwrap_or_else(|_| unreachable!());
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].agent_name, "beta-bot");
    }

    #[test]
    fn create_eval_clamps_score_and_stores_passed() {
        let mut store = open_store("eval");
        let stored = store.ingest_trace(&TraceInput::new("scored"));
        assert!(stored.is_ok());
        let stored = stored.unwrap_or_else(|_| unreachable!());

        let verdict = store.create_eval(
            stored.id.as_str(),
            &EvalInput {
                evaluator_type: EvaluatorType::LlmJudge,
                evaluator_name: "quality".to_string(),
                score: 1.7,
                passed: true,
                details: Some(json!({"note": "clamped"})),
            },
        );
        assert!(verdict.is_ok());
        let verdict = verdict.unwrap_or_else(|_| unreachable!());
        assert!(verdict.id.as_str().starts_with("evl_"));
        assert!((verdict.score - 1.0).abs() < f64::EPSILON);

        let resolved = store.get_trace(stored.id.as_str());
        assert!(resolved.is_ok());
        let resolved = resolved
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(resolved.evals.len(), 1);
        assert!(resolved.evals[0].passed);

        let missing = store.create_eval(
            "trc_000000000000",
            &EvalInput {
                evaluator_type: EvaluatorType::Rubric,
                evaluator_name: "quality".to_string(),
                score: 0.5,
                passed: false,
                details: None,
            },
        );
        assert!(matches!(missing, Err(ReplayError::NotFound(_))));
    }

    #[test]
    fn policy_names_are_unique() {
        let mut store = open_store("policy-unique");
        let input = PolicyInput {
            name: "no-deletes".to_string(),
            description: None,
            action: GuardAction::Deny,
            priority: Some(10),
            enabled: None,
            match_pattern: json!({"name_contains": "delete"}),
            action_params: None,
            tags: None,
        };
        assert!(store.add_policy(&input).is_ok());
        let duplicate = store.add_policy(&input);
        assert!(matches!(duplicate, Err(ReplayError::InvalidInput(_))));
    }

    #[test]
    fn policies_list_by_priority_and_remove_by_name_or_id() {
        let mut store = open_store("policy-list");
        for (name, priority, enabled) in
            [("low", 1_i64, true), ("high", 9, true), ("off", 5, false)]
        {
            let added = store.add_policy(&PolicyInput {
                name: name.to_string(),
                description: None,
                action: GuardAction::Warn,
                priority: Some(priority),
                enabled: Some(enabled),
                match_pattern: json!({"step_type": "tool_call"}),
                action_params: None,
                tags: None,
            });
            assert!(added.is_ok());
        }

        let enabled = store.list_policies(true);
        assert!(enabled.is_ok());
        let enabled = enabled.unwrap_or_else(|_| unreachable!());
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[0].name, "high");

        let everything = store.list_policies(false);
        assert!(everything.is_ok());
        assert_eq!(everything.unwrap_or_else(|_| unreachable!()).len(), 3);

        assert!(store.remove_policy("off").is_ok());
        let high_id = store
            .list_policies(false)
            .unwrap_or_else(|_| unreachable!())
            .into_iter()
            .find(|policy| policy.name == "high")
            .map(|policy| policy.id.as_str().to_string())
            .unwrap_or_default();
        assert!(store.remove_policy(&high_id).is_ok());
        assert!(matches!(
            store.remove_policy("nope"),
            Err(ReplayError::NotFound(_))
        ));
    }
}
