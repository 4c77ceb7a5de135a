//! Wire types for the two endpoints: line-delimited JSON, one object per
//! message.
//!
//! Requests are tagged by an upper-case `type`. Subprocess streams ride in
//! the EXECUTE response as UTF-8 when valid, otherwise base64, with a
//! companion `*_encoding` field. The denial banner format is stable; AI
//! agents downstream parse it.

use crate::approvals::PendingSummary;
use crate::models::{ApprovalOutcome, Decision, ExecutionContext, ExecutionResult};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A client- or observer-side message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "EVALUATE")]
    Evaluate(CommandParams),
    #[serde(rename = "EXECUTE")]
    Execute(CommandParams),
    #[serde(rename = "APPROVE")]
    Approve(ApprovalParams),
    #[serde(rename = "DENY")]
    Deny(ApprovalParams),
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "RELOAD_RULES")]
    ReloadRules,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParams {
    pub command: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Absent means: derive from the environment marker, default human.
    #[serde(default)]
    pub execution_context: Option<ExecutionContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalParams {
    pub approval_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response to `EVALUATE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub decision: String,
    pub rule: Option<String>,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_override: Option<bool>,
}

impl EvaluateResponse {
    pub fn from_decision(decision: &Decision) -> Self {
        let (substituted_command, allow_override) = match decision {
            Decision::Redirect {
                substituted_command,
                ..
            } => (Some(substituted_command.clone()), None),
            Decision::Deny { allow_override, .. } => (None, Some(*allow_override)),
            _ => (None, None),
        };
        Self {
            decision: decision.action().as_str().to_string(),
            rule: decision.rule_name().map(str::to_string),
            message: decision.message().map(str::to_string),
            substituted_command,
            allow_override,
        }
    }
}

/// Response to `EXECUTE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub decision: String,
    pub rule: Option<String>,
    pub message: Option<String>,
    pub executed: bool,
    pub approval_outcome: Option<ApprovalOutcome>,
    pub approval_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_encoding: StreamEncoding,
    pub stderr_encoding: StreamEncoding,
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_override: Option<bool>,
}

impl ExecuteResponse {
    /// A response that carries a decision but no execution (deny, declined
    /// or timed-out approval). `stderr` carries the denial banner when the
    /// command was refused.
    pub fn not_executed(
        decision: &Decision,
        approval: Option<(&ApprovalOutcome, Option<&str>)>,
        banner: Option<String>,
    ) -> Self {
        let evaluate = EvaluateResponse::from_decision(decision);
        let (stderr, stderr_encoding) = match banner {
            Some(text) => (text, StreamEncoding::Utf8),
            None => (String::new(), StreamEncoding::Utf8),
        };
        Self {
            decision: evaluate.decision,
            rule: evaluate.rule,
            message: evaluate.message,
            executed: false,
            approval_outcome: approval.map(|(o, _)| *o),
            approval_reason: approval.and_then(|(_, r)| r.map(str::to_string)),
            exit_code: None,
            stdout: String::new(),
            stderr,
            stdout_encoding: StreamEncoding::Utf8,
            stderr_encoding,
            execution_time_ms: None,
            substituted_command: evaluate.substituted_command,
            allow_override: evaluate.allow_override,
        }
    }

    pub fn executed(
        decision: &Decision,
        approval: Option<(&ApprovalOutcome, Option<&str>)>,
        result: &ExecutionResult,
    ) -> Self {
        let evaluate = EvaluateResponse::from_decision(decision);
        let (stdout, stdout_encoding) = encode_stream(&result.stdout);
        let (stderr, stderr_encoding) = encode_stream(&result.stderr);
        Self {
            decision: evaluate.decision,
            rule: evaluate.rule,
            message: evaluate.message,
            executed: true,
            approval_outcome: approval.map(|(o, _)| *o),
            approval_reason: approval.and_then(|(_, r)| r.map(str::to_string)),
            exit_code: Some(result.exit_code),
            stdout,
            stderr,
            stdout_encoding,
            stderr_encoding,
            execution_time_ms: Some(result.wall_time.as_millis() as u64),
            substituted_command: evaluate.substituted_command,
            allow_override: evaluate.allow_override,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// UTF-8 when valid, base64 otherwise.
pub fn encode_stream(bytes: &[u8]) -> (String, StreamEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), StreamEncoding::Utf8),
        Err(_) => (
            base64::engine::general_purpose::STANDARD.encode(bytes),
            StreamEncoding::Base64,
        ),
    }
}

/// Inverse of [`encode_stream`]; undecodable base64 comes back empty.
pub fn decode_stream(text: &str, encoding: StreamEncoding) -> Vec<u8> {
    match encoding {
        StreamEncoding::Utf8 => text.as_bytes().to_vec(),
        StreamEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(text)
            .unwrap_or_default(),
    }
}

/// Response to APPROVE/DENY/RELOAD_RULES/SHUTDOWN, and the shape of any
/// protocol-level error line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Response to `STATUS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub version: String,
    pub rules_loaded: usize,
    pub rules_fingerprint: String,
    pub pending_approvals: Vec<PendingSummary>,
    pub uptime_ms: u64,
    pub active_connections: usize,
}

/// The stable refusal text consumed by downstream AI agents. The reason and
/// rule name are quoted from the matched rule; nothing else is added.
pub fn denial_banner(rule: &str, message: &str) -> String {
    format!(
        "[SafetyLayer] BLOCKED\n\
         Reason: {message}\n\
         Rule: {rule}\n\
         \n\
         This operation has been intentionally prevented by policy.\n\
         Do not attempt to work around this restriction.\n"
    )
}
