#![forbid(unsafe_code)]

//! The `LanguageJudge` capability: the one outbound boundary of the core.
//!
//! Everything above this crate is synchronous; a judge call blocks until the
//! adapter's own timeout expires. A failed or cancelled call surfaces a
//! [`JudgeFailure`] and never produces a stored verdict.

use std::cell::Cell;
use std::time::Duration;

use agent_replay_domain::{now_utc, JudgeFailure, JudgeFailureKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgeRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: String,
    pub cost_estimate_usd: f64,
    pub latency_ms: u64,
}

pub trait LanguageJudge {
    fn provider(&self) -> &str;

    /// Send one grading request and block for the reply.
    ///
    /// # Errors
    /// Returns a classified [`JudgeFailure`]; the caller must not write a
    /// verdict for a failed call.
    fn call(&self, request: &JudgeRequest) -> std::result::Result<JudgeReply, JudgeFailure>;
}

/// A deterministic judge that replays canned responses in order. Used by
/// tests and offline runs; also counts calls so skip paths can prove the
/// judge was never invoked.
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    responses: Vec<String>,
    cursor: Cell<usize>,
    calls: Cell<usize>,
}

impl ScriptedJudge {
    #[must_use]
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: Cell::new(0),
            calls: Cell::new(0),
        }
    }

    #[must_use]
    pub fn single(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl LanguageJudge for ScriptedJudge {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn call(&self, request: &JudgeRequest) -> std::result::Result<JudgeReply, JudgeFailure> {
        self.calls.set(self.calls.get() + 1);
        let index = self.cursor.get();
        let text = self.responses.get(index).cloned().ok_or_else(|| {
            JudgeFailure::new(
                JudgeFailureKind::Server,
                "scripted",
                "scripted judge ran out of responses",
            )
        })?;
        if index + 1 < self.responses.len() {
            self.cursor.set(index + 1);
        }
        Ok(JudgeReply {
            input_tokens: (request.prompt.len() as u64).div_ceil(4),
            output_tokens: (text.len() as u64).div_ceil(4),
            text,
            model: "scripted-v1".to_string(),
            provider: "scripted".to_string(),
            cost_estimate_usd: 0.0,
            latency_ms: 0,
        })
    }
}

/// The resolved `{provider, model, credential}` tuple handed down by the
/// (out-of-scope) configuration layer, plus the transport knobs the adapter
/// owns.
#[derive(Debug, Clone)]
pub struct JudgeEndpoint {
    pub provider: String,
    pub model: String,
    pub url: String,
    pub credential: Option<String>,
    pub timeout_ms: u64,
}

/// Blocking HTTP adapter speaking a plain JSON grading contract:
/// POST `{model, system, prompt, max_tokens}`, read
/// `{text, input_tokens, output_tokens, cost_estimate_usd}`.
#[derive(Debug, Clone)]
pub struct HttpJsonJudge {
    endpoint: JudgeEndpoint,
}

impl HttpJsonJudge {
    #[must_use]
    pub fn new(endpoint: JudgeEndpoint) -> Self {
        Self { endpoint }
    }
}

impl LanguageJudge for HttpJsonJudge {
    fn provider(&self) -> &str {
        &self.endpoint.provider
    }

    fn call(&self, request: &JudgeRequest) -> std::result::Result<JudgeReply, JudgeFailure> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.endpoint.timeout_ms))
            .build();

        let mut outbound = agent
            .request("POST", &self.endpoint.url)
            .set("content-type", "application/json");
        if let Some(credential) = &self.endpoint.credential {
            outbound = outbound.set("authorization", &format!("Bearer {credential}"));
        }

        let payload = json!({
            "model": self.endpoint.model,
            "system": request.system,
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
        });

        let started = now_utc();
        let response = match outbound.send_json(&payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(
                    JudgeFailure::new(
                        classify_status(code),
                        &self.endpoint.provider,
                        format!("http status {code}"),
                    )
                    .with_status(code),
                );
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(JudgeFailure::new(
                    JudgeFailureKind::Network,
                    &self.endpoint.provider,
                    err.to_string(),
                ));
            }
        };

        let body: Value = response.into_json().map_err(|err| {
            JudgeFailure::new(
                JudgeFailureKind::Parse,
                &self.endpoint.provider,
                format!("non-JSON judge response: {err}"),
            )
        })?;
        let elapsed = now_utc() - started;
        let latency_ms = u64::try_from(elapsed.whole_milliseconds().max(0)).unwrap_or(0);

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                JudgeFailure::new(
                    JudgeFailureKind::Parse,
                    &self.endpoint.provider,
                    "judge response is missing 'text'",
                )
            })?
            .to_string();
        let input_tokens = body
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = body
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cost_estimate_usd = body
            .get("cost_estimate_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        debug!(
            provider = %self.endpoint.provider,
            model = %self.endpoint.model,
            input_tokens,
            output_tokens,
            latency_ms,
            "judge call completed"
        );
        Ok(JudgeReply {
            text,
            input_tokens,
            output_tokens,
            model: self.endpoint.model.clone(),
            provider: self.endpoint.provider.clone(),
            cost_estimate_usd,
            latency_ms,
        })
    }
}

/// HTTP status class to failure kind; the taxonomy the whole core reports.
#[must_use]
pub fn classify_status(status: u16) -> JudgeFailureKind {
    match status {
        401 | 403 => JudgeFailureKind::Auth,
        429 => JudgeFailureKind::RateLimit,
        _ => JudgeFailureKind::Server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_request() -> JudgeRequest {
        JudgeRequest {
            system: Some("You grade traces.".to_string()),
            prompt: "TRACE: demo [COMPLETED]".to_string(),
            max_tokens: 1024,
        }
    }

    #[test]
    fn scripted_judge_replays_responses_in_order() {
        let judge = ScriptedJudge::new(vec!["first".to_string(), "second".to_string()]);
        let request = fixture_request();

        let first = judge.call(&request);
        assert!(first.is_ok());
        assert_eq!(first.unwrap_or_else(|_| unreachable!()).text, "first");

        let second = judge.call(&request);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert_eq!(second.text, "second");
        assert_eq!(second.provider, "scripted");

        // The last response repeats once the script is exhausted.
        let third = judge.call(&request);
        assert!(third.is_ok());
        assert_eq!(third.unwrap_or_else(|_| unreachable!()).text, "second");
        assert_eq!(judge.calls(), 3);
    }

    #[test]
    fn empty_script_is_a_server_failure() {
        let judge = ScriptedJudge::default();
        let failed = judge.call(&fixture_request());
        assert!(failed.is_err());
        let failure = failed.err().unwrap_or_else(|| unreachable!());
        assert_eq!(failure.kind, JudgeFailureKind::Server);
        assert_eq!(failure.provider, "scripted");
    }

    #[test]
    fn status_codes_map_onto_failure_kinds() {
        assert_eq!(classify_status(401), JudgeFailureKind::Auth);
        assert_eq!(classify_status(403), JudgeFailureKind::Auth);
        assert_eq!(classify_status(429), JudgeFailureKind::RateLimit);
        assert_eq!(classify_status(500), JudgeFailureKind::Server);
        assert_eq!(classify_status(503), JudgeFailureKind::Server);
        assert_eq!(classify_status(418), JudgeFailureKind::Server);
    }

    #[test]
    fn transport_failure_classifies_as_network() {
        let judge = HttpJsonJudge::new(JudgeEndpoint {
            provider: "loopback".to_string(),
            model: "grader-1".to_string(),
            // Port 9 is the discard service; nothing listens there.
            url: "http://127.0.0.1:9/grade".to_string(),
            credential: None,
            timeout_ms: 200,
        });
        let failed = judge.call(&fixture_request());
        assert!(failed.is_err());
        assert_eq!(
            failed.err().unwrap_or_else(|| unreachable!()).kind,
            JudgeFailureKind::Network
        );
    }
}
