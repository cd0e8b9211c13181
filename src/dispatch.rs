//! Execution Dispatcher: the Execute envelope and the
//! acquire → forward → release sequence, including the full failure
//! taxonomy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::pool::Pool;

/// Languages the in-guest agent knows how to run.
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["python", "typescript", "rust"];

/// Default execution timeout applied when the caller's `timeout` is
/// absent or non-positive.
const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Deadline for acquiring a VM from the pool before reporting
/// saturation.
const ACQUIRE_DEADLINE: Duration = Duration::from_secs(5);

/// Extra slack added to the caller's timeout for the outbound HTTP
/// round-trip to the in-guest agent.
const GUEST_CALL_SLACK: Duration = Duration::from_secs(5);

/// `{language, code, timeout}` — identical at the host boundary and to
/// the in-guest agent (byte-identical to the in-guest agent's own API).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecuteRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub timeout: i64,
}

/// `{success, output, error, execution_time, request_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub execution_time: f64,
}

/// The dispatcher's classified outcomes. `BadRequest` maps to
/// HTTP 400 and never touches the pool; everything else is reported as
/// a `200`-with-`success=false` envelope (Saturation is the one
/// exception, mapped to 503 at the HTTP layer). Every variant carries
/// the `request_id` stamped at the start of `execute`, so every
/// envelope that reaches the caller — including 400s and 503s — names
/// the request it answers.
#[derive(Debug)]
pub enum DispatchOutcome {
    BadRequest { request_id: String, message: String },
    Saturation { request_id: String },
    Envelope(ExecuteResponse),
}

pub struct Dispatcher {
    pool: Arc<Pool>,
    agent_port: u16,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>, config: &Config) -> Self {
        Self {
            pool,
            agent_port: config.agent_port,
            http: reqwest::Client::new(),
        }
    }

    pub async fn execute(&self, mut request: ExecuteRequest) -> DispatchOutcome {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        if !SUPPORTED_LANGUAGES.contains(&request.language.as_str()) {
            return DispatchOutcome::BadRequest {
                request_id,
                message: format!("Unsupported language: {}", request.language),
            };
        }

        if request.timeout <= 0 {
            request.timeout = DEFAULT_TIMEOUT_SECS;
        }

        let slot = match self.pool.acquire(ACQUIRE_DEADLINE).await {
            Ok(slot) => slot,
            Err(_) => return DispatchOutcome::Saturation { request_id },
        };

        let guest_ip = { slot.lock().await.guest_ip.clone() };

        let result = self.forward(&guest_ip, &request).await;

        // Measured immediately after the guest round-trip, before the
        // handle is released, so a slow return probe (readiness
        // re-check, or a poisoned-handle replacement) never inflates
        // the reported duration.
        let execution_time = start.elapsed().as_secs_f64();

        // Released in the background: the pool's Release step (a
        // readiness re-probe, and on failure a full stop + restart) can
        // take up to the readiness deadline and must never hold up the
        // response already owed to this caller.
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.release(slot).await;
        });

        let mut response = match result {
            Ok(mut guest_response) => {
                // The guest's own execution_time is replaced with the
                // host-measured one; its success/error/output pass
                // through unchanged (GuestFailure is not distinguished
                // from success at this layer — both are valid envelopes).
                guest_response.execution_time = execution_time;
                guest_response
            }
            Err(message) => ExecuteResponse {
                request_id: String::new(),
                success: false,
                output: String::new(),
                error: message,
                execution_time,
            },
        };

        response.request_id = request_id;
        DispatchOutcome::Envelope(response)
    }

    /// POST the envelope to the in-guest agent and parse its response.
    /// Transport and protocol failures are folded into a single
    /// human-readable error string; the caller wraps it in an envelope.
    async fn forward(
        &self,
        guest_ip: &str,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, String> {
        let url = format!("http://{guest_ip}:{}/execute", self.agent_port);
        let client_deadline =
            Duration::from_secs(request.timeout as u64) + GUEST_CALL_SLACK;

        let response = self
            .http
            .post(&url)
            .json(request)
            .timeout(client_deadline)
            .send()
            .await
            .map_err(|e| format!("transport error: {e}"))?;

        response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| format!("failed to parse guest response: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_language_rejected_by_name() {
        assert!(!SUPPORTED_LANGUAGES.contains(&"ocaml"));
        assert!(SUPPORTED_LANGUAGES.contains(&"python"));
        assert!(SUPPORTED_LANGUAGES.contains(&"typescript"));
        assert!(SUPPORTED_LANGUAGES.contains(&"rust"));
    }

    #[test]
    fn test_default_timeout_applied_for_non_positive() {
        let mut req = ExecuteRequest {
            language: "python".to_string(),
            code: "print(1)".to_string(),
            timeout: 0,
        };
        if req.timeout <= 0 {
            req.timeout = DEFAULT_TIMEOUT_SECS;
        }
        assert_eq!(req.timeout, 30);

        let mut req = ExecuteRequest {
            language: "python".to_string(),
            code: "print(1)".to_string(),
            timeout: -5,
        };
        if req.timeout <= 0 {
            req.timeout = DEFAULT_TIMEOUT_SECS;
        }
        assert_eq!(req.timeout, 30);
    }

    #[test]
    fn test_bad_request_and_saturation_carry_a_request_id() {
        let bad = DispatchOutcome::BadRequest {
            request_id: "req-1".to_string(),
            message: "Unsupported language: ocaml".to_string(),
        };
        match bad {
            DispatchOutcome::BadRequest { request_id, message } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(message, "Unsupported language: ocaml");
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        let saturated = DispatchOutcome::Saturation {
            request_id: "req-2".to_string(),
        };
        match saturated {
            DispatchOutcome::Saturation { request_id } => assert_eq!(request_id, "req-2"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_execute_response_defaults_parse_from_minimal_json() {
        let body = r#"{"success":true,"output":"2\n","error":"","execution_time":0.2}"#;
        let parsed: ExecuteResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.output, "2\n");
        assert!(parsed.request_id.is_empty());
    }
}
