//! Core types for the shellgate policy engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Ai,
    #[default]
    Human,
}

impl ExecutionContext {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionContext::Ai => "ai",
            ExecutionContext::Human => "human",
        }
    }
}

/// One command as seen by the engine: the full string plus the parsed
/// executable and arguments, the caller's working directory and (filtered)
/// environment, and lazily resolved git metadata.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Full command string, including arguments.
    pub command: String,
    /// First word of the primary command, after stripping redirections and
    /// leading variable assignments.
    pub executable: String,
    /// Remaining words of the primary command.
    pub args: Vec<String>,
    /// Absolute path of the caller's cwd.
    pub working_dir: PathBuf,
    /// Environment subset forwarded by the caller.
    pub environment: HashMap<String, String>,
    pub execution_context: ExecutionContext,
    /// Current branch, populated from the git cache when a rule needs it.
    pub git_branch: Option<String>,
    /// Whether `working_dir` is inside a git repository; same lazy contract.
    pub in_git_repo: Option<bool>,
}

impl CommandContext {
    pub fn new(
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        environment: HashMap<String, String>,
        execution_context: ExecutionContext,
    ) -> Self {
        let command = command.into();
        let parsed = crate::parser::parse_primary(&command);
        Self {
            command,
            executable: parsed.executable,
            args: parsed.args,
            working_dir: working_dir.into(),
            environment,
            execution_context,
            git_branch: None,
            in_git_repo: None,
        }
    }

    /// Stable 64-bit identity over (command, working_dir, execution_context).
    /// Used to coalesce duplicate approval prompts; scope is one engine
    /// process, so the std hasher is sufficient.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.command.hash(&mut hasher);
        self.working_dir.hash(&mut hasher);
        self.execution_context.hash(&mut hasher);
        hasher.finish()
    }

    /// Fingerprint as it appears on the wire: 16 lowercase hex chars.
    pub fn fingerprint_hex(&self) -> String {
        format!("{:016x}", self.fingerprint())
    }
}

/// The enforcement outcome attached to a rule, ordered by aggregation
/// priority: Deny > RequireApproval > Redirect > Allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow = 0,
    Redirect = 1,
    RequireApproval = 2,
    Deny = 3,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Redirect => "redirect",
            Action::RequireApproval => "require_approval",
            Action::Deny => "deny",
        }
    }
}

/// The evaluator's verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        rule: String,
        message: String,
        /// Parsed and surfaced, never acted on (no escalation path).
        allow_override: bool,
    },
    RequireApproval {
        rule: String,
        message: String,
    },
    Redirect {
        rule: String,
        substituted_command: String,
        message: String,
    },
}

impl Decision {
    pub fn action(&self) -> Action {
        match self {
            Decision::Allow => Action::Allow,
            Decision::Deny { .. } => Action::Deny,
            Decision::RequireApproval { .. } => Action::RequireApproval,
            Decision::Redirect { .. } => Action::Redirect,
        }
    }

    pub fn rule_name(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny { rule, .. }
            | Decision::RequireApproval { rule, .. }
            | Decision::Redirect { rule, .. } => Some(rule),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny { message, .. }
            | Decision::RequireApproval { message, .. }
            | Decision::Redirect { message, .. } => Some(message),
        }
    }
}

/// Outcome of running a command through the executor.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub wall_time: Duration,
}

impl ExecutionResult {
    /// Conventional "could not spawn" result: exit 127 with the error on
    /// stderr, matching what a shell reports for a missing binary.
    pub fn spawn_failure(err: &std::io::Error) -> Self {
        Self {
            exit_code: 127,
            stdout: Vec::new(),
            stderr: format!("shellgate: failed to spawn command: {err}\n").into_bytes(),
            wall_time: Duration::ZERO,
        }
    }
}

/// How a pending approval was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Timeout,
}

impl ApprovalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Denied => "denied",
            ApprovalOutcome::Timeout => "timeout",
        }
    }
}
