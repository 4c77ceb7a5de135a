//! Claude Code `PreToolUse` hook adapter.
//!
//! Translates the hook's stdin JSON into an `EVALUATE` round-trip and the
//! decision back into hook JSON. The adapter fails open: if the engine is
//! unreachable or the input is malformed, the hook approves and gets out of
//! the way. The safety layer must never wedge the editor.

use crate::client::{self, EngineClient};
use crate::models::ExecutionContext;
use crate::protocol::denial_banner;
use crate::settings::Paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tool input from Claude Code.
#[derive(Debug, Deserialize, Default)]
pub struct ToolInput {
    #[serde(default)]
    pub command: String,
}

/// Input received by the `PreToolUse` hook.
#[derive(Debug, Deserialize, Default)]
pub struct HookInput {
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: ToolInputVariant,
}

/// Tool input can be either structured or a raw map.
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
pub enum ToolInputVariant {
    Structured(ToolInput),
    Map(serde_json::Map<String, serde_json::Value>),
    #[default]
    Empty,
}

impl HookInput {
    /// Extract the command string from `tool_input`.
    pub fn get_command(&self) -> String {
        match &self.tool_input {
            ToolInputVariant::Structured(ti) => ti.command.clone(),
            ToolInputVariant::Map(m) => m
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            ToolInputVariant::Empty => String::new(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    pub permission_decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
}

/// Output format for the hook.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
}

impl HookOutput {
    /// Pass-through approval (defer to the editor's own permission flow).
    pub fn approve() -> Self {
        Self {
            decision: Some("approve".to_string()),
            hook_specific_output: None,
        }
    }

    fn with_decision(decision: &str, reason: Option<String>) -> Self {
        Self {
            decision: None,
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: "PreToolUse".to_string(),
                permission_decision: decision.to_string(),
                permission_decision_reason: reason,
            }),
        }
    }

    pub fn allow(reason: Option<String>) -> Self {
        Self::with_decision("allow", reason)
    }

    pub fn ask(reason: String) -> Self {
        Self::with_decision("ask", Some(reason))
    }

    pub fn deny(reason: String) -> Self {
        Self::with_decision("deny", Some(reason))
    }
}

/// Process one hook invocation. Never fails; the worst case is approve.
pub fn run_hook(raw_input: &str, paths: &Paths) -> HookOutput {
    let Ok(input) = serde_json::from_str::<HookInput>(raw_input) else {
        return HookOutput::approve();
    };

    // Only shell commands are policed.
    if input.tool_name != "Bash" {
        return HookOutput::approve();
    }
    let command = input.get_command();
    if command.trim().is_empty() {
        return HookOutput::approve();
    }

    let Ok(mut engine) = EngineClient::connect(paths) else {
        // Engine down: transparently bypass, as the shim does.
        return HookOutput::approve();
    };

    let working_dir = if input.cwd.is_empty() {
        None
    } else {
        Some(PathBuf::from(&input.cwd))
    };
    // Hook invocations come from the agent by definition.
    let params = client::params_from_caller(&command, working_dir, Some(ExecutionContext::Ai));

    match engine.evaluate(params) {
        Ok(response) => match response.decision.as_str() {
            "deny" => {
                let rule = response.rule.as_deref().unwrap_or("policy");
                let message = response.message.as_deref().unwrap_or("denied");
                HookOutput::deny(denial_banner(rule, message))
            }
            "require_approval" => HookOutput::ask(
                response
                    .message
                    .unwrap_or_else(|| "Approval required by policy".to_string()),
            ),
            "redirect" => {
                let target = response.substituted_command.unwrap_or_default();
                HookOutput::ask(format!("Policy would run `{target}` instead"))
            }
            _ => HookOutput::allow(response.message),
        },
        Err(_) => HookOutput::approve(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_bash_tool_approves() {
        let input = r#"{"tool_name":"Read","tool_input":{"file_path":"/etc/passwd"}}"#;
        let paths = Paths::in_dir("/nonexistent");
        assert_eq!(run_hook(input, &paths), HookOutput::approve());
    }

    #[test]
    fn test_engine_down_approves() {
        let input = r#"{"tool_name":"Bash","tool_input":{"command":"rm -rf /"}}"#;
        let paths = Paths::in_dir("/nonexistent");
        // No engine socket: fail open.
        assert_eq!(run_hook(input, &paths), HookOutput::approve());
    }

    #[test]
    fn test_malformed_input_approves() {
        let paths = Paths::in_dir("/nonexistent");
        assert_eq!(run_hook("{not json", &paths), HookOutput::approve());
    }

    #[test]
    fn test_command_extraction_from_map() {
        let input: HookInput = serde_json::from_str(
            r#"{"tool_name":"Bash","tool_input":{"command":"git status","timeout":5}}"#,
        )
        .unwrap();
        assert_eq!(input.get_command(), "git status");
    }

    #[test]
    fn test_output_serialization() {
        let output = HookOutput::deny("blocked".to_string());
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(
            json["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
        assert_eq!(
            json["hookSpecificOutput"]["hookEventName"],
            "PreToolUse"
        );

        let approve = serde_json::to_value(HookOutput::approve()).unwrap();
        assert_eq!(approve["decision"], "approve");
    }
}
