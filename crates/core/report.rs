//! Wire protocol between the pool and an out-of-process handler.
//!
//! The child receives its job as JSON in the `JOB_DATA` environment variable
//! and the retry counter in `JOB_ATTEMPT`. It reports back by writing exactly
//! one JSON line to stdout, either `{"success":true,"result":...}` or
//! `{"success":false,"error":"..."}`. When several lines are written the last
//! non-empty one is the report.

use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::{CourierError, Result};
use crate::job::Job;

/// Environment variable carrying the job envelope.
pub const JOB_DATA_ENV: &str = "JOB_DATA";

/// Environment variable carrying the retry counter.
pub const JOB_ATTEMPT_ENV: &str = "JOB_ATTEMPT";

/// Result reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Success(serde_json::Value),
    Failure(String),
}

#[derive(Serialize, Deserialize)]
struct WireReport {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExecutionReport {
    /// Parse a report line.
    pub fn parse(line: &str) -> Result<Self> {
        let wire: WireReport = serde_json::from_str(line.trim())?;
        Ok(if wire.success {
            Self::Success(wire.result.unwrap_or(serde_json::Value::Null))
        } else {
            Self::Failure(
                wire.error
                    .unwrap_or_else(|| "handler reported failure without a message".to_string()),
            )
        })
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String> {
        let wire = match self {
            Self::Success(result) => WireReport {
                success: true,
                result: Some(result.clone()),
                error: None,
            },
            Self::Failure(error) => WireReport {
                success: false,
                result: None,
                error: Some(error.clone()),
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Write the report to stdout. Handler programs call this once, last.
    pub fn emit(&self) -> Result<()> {
        let line = self.to_line()?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line)
            .and_then(|_| stdout.flush())
            .map_err(|e| CourierError::HandlerFailure(format!("cannot write report: {}", e)))
    }
}

/// Read the job handed to this process by the pool.
pub fn job_from_env() -> Result<Job> {
    decode_job(
        std::env::var(JOB_DATA_ENV).ok().as_deref(),
        std::env::var(JOB_ATTEMPT_ENV).ok().as_deref(),
    )
}

fn decode_job(data: Option<&str>, attempt: Option<&str>) -> Result<Job> {
    let data = data.ok_or_else(|| CourierError::Config(format!("{} is not set", JOB_DATA_ENV)))?;
    let mut job: Job = serde_json::from_str(data)?;
    job.attempt = attempt.and_then(|a| a.trim().parse().ok()).unwrap_or(0);
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_success() {
        let report = ExecutionReport::parse(r#"{"success":true,"result":{"pages":3}}"#).unwrap();
        assert_eq!(report, ExecutionReport::Success(json!({"pages": 3})));
    }

    #[test]
    fn test_parse_success_without_result() {
        let report = ExecutionReport::parse(r#"{"success":true}"#).unwrap();
        assert_eq!(report, ExecutionReport::Success(serde_json::Value::Null));
    }

    #[test]
    fn test_parse_failure() {
        let report = ExecutionReport::parse(r#" {"success":false,"error":"smtp down"} "#).unwrap();
        assert_eq!(report, ExecutionReport::Failure("smtp down".to_string()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ExecutionReport::parse("done!"),
            Err(CourierError::Deserialization(_))
        ));
        assert!(ExecutionReport::parse(r#"{"result":1}"#).is_err());
    }

    #[test]
    fn test_failure_line_omits_result() {
        let line = ExecutionReport::Failure("bad".to_string()).to_line().unwrap();
        assert_eq!(line, r#"{"success":false,"error":"bad"}"#);
    }

    #[test]
    fn test_decode_job_reads_attempt() {
        let job = Job::new("emails", json!({"to": "x"}));
        let encoded = job.to_json().unwrap();

        let decoded = decode_job(Some(&encoded), Some("2")).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.data, job.data);
        assert_eq!(decoded.attempt, 2);

        let decoded = decode_job(Some(&encoded), Some("many")).unwrap();
        assert_eq!(decoded.attempt, 0);
    }

    #[test]
    fn test_decode_job_requires_data() {
        let err = decode_job(None, None).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: JOB_DATA is not set");
    }
}
