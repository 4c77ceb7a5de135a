//! Raw YAML document types for rule files.
//!
//! Documents deserialize into these permissive structs first; the loader
//! then validates, resolves overrides, and compiles. Conditions are kept as
//! raw YAML values here so the loader can report a precise
//! `layer:rules[i].conditions[j]` path: each one is parsed by reading its
//! `type` tag and dispatching to that variant's strict payload parser.
//! Unknown tags are errors, not extension points.

use crate::models::{Action, ExecutionContext};
use crate::rules::conditions::ConditionSpec;
use serde::Deserialize;

/// One rule layer as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub overrides: Option<Vec<OverrideSpec>>,
}

/// One rule as written on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub context: Option<ExecutionContext>,
    #[serde(default)]
    pub conditions: Vec<serde_yaml::Value>,
    pub action: Action,
    #[serde(default)]
    pub allow_override: bool,
    #[serde(default)]
    pub redirect_to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// An `overrides:` entry (global layer only).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideSpec {
    pub name: String,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Why a condition value failed to parse. The loader prepends the field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionParseError {
    NotAMapping,
    MissingType,
    UnknownType(String),
    BadPayload(String),
}

impl std::fmt::Display for ConditionParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionParseError::NotAMapping => write!(f, "condition must be a mapping"),
            ConditionParseError::MissingType => write!(f, "condition is missing `type`"),
            ConditionParseError::UnknownType(t) => write!(f, "unknown condition type `{t}`"),
            ConditionParseError::BadPayload(msg) => write!(f, "{msg}"),
        }
    }
}

macro_rules! payload {
    ($value:expr, $ty:ty) => {
        serde_yaml::from_value::<$ty>($value)
            .map_err(|e| ConditionParseError::BadPayload(e.to_string()))
    };
}

/// Parse one condition value by dispatching on its `type` tag.
pub fn parse_condition(value: &serde_yaml::Value) -> Result<ConditionSpec, ConditionParseError> {
    let serde_yaml::Value::Mapping(mapping) = value else {
        return Err(ConditionParseError::NotAMapping);
    };

    let tag = mapping
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(ConditionParseError::MissingType)?
        .to_string();

    // Strict per-variant payload parsers; leftover keys are errors.
    let mut rest = mapping.clone();
    rest.remove("type");
    let rest = serde_yaml::Value::Mapping(rest);

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PatternPayload {
        pattern: String,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SubstringPayload {
        substring: String,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PrefixPayload {
        prefix: String,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct BranchesPayload {
        branches: Vec<String>,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ValueBoolPayload {
        value: bool,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PathPayload {
        path: String,
    }
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EnvPayload {
        variable: String,
        value: String,
    }

    let spec = match tag.as_str() {
        "command_matches" => {
            let p = payload!(rest, PatternPayload)?;
            ConditionSpec::CommandMatches { pattern: p.pattern }
        }
        "command_contains" => {
            let p = payload!(rest, SubstringPayload)?;
            ConditionSpec::CommandContains {
                substring: p.substring,
            }
        }
        "command_startswith" => {
            let p = payload!(rest, PrefixPayload)?;
            ConditionSpec::CommandStartswith { prefix: p.prefix }
        }
        "git_branch_in" => {
            let p = payload!(rest, BranchesPayload)?;
            ConditionSpec::GitBranchIn {
                branches: p.branches,
            }
        }
        "git_branch_matches" => {
            let p = payload!(rest, PatternPayload)?;
            ConditionSpec::GitBranchMatches { pattern: p.pattern }
        }
        "in_git_repo" => {
            let p = payload!(rest, ValueBoolPayload)?;
            ConditionSpec::InGitRepo { value: p.value }
        }
        "path_matches" => {
            let p = payload!(rest, PatternPayload)?;
            ConditionSpec::PathMatches { pattern: p.pattern }
        }
        "file_exists" => {
            let p = payload!(rest, PathPayload)?;
            ConditionSpec::FileExists { path: p.path }
        }
        "env_equals" => {
            let p = payload!(rest, EnvPayload)?;
            ConditionSpec::EnvEquals {
                variable: p.variable,
                value: p.value,
            }
        }
        other => return Err(ConditionParseError::UnknownType(other.to_string())),
    };

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_command_matches() {
        let spec = parse_condition(&yaml(r#"{type: command_matches, pattern: "^rm"}"#)).unwrap();
        assert_eq!(
            spec,
            ConditionSpec::CommandMatches {
                pattern: "^rm".to_string()
            }
        );
    }

    #[test]
    fn test_parse_env_equals() {
        let spec =
            parse_condition(&yaml(r#"{type: env_equals, variable: CI, value: "true"}"#)).unwrap();
        assert_eq!(
            spec,
            ConditionSpec::EnvEquals {
                variable: "CI".to_string(),
                value: "true".to_string()
            }
        );
    }

    #[test]
    fn test_parse_git_branch_in() {
        let spec =
            parse_condition(&yaml(r#"{type: git_branch_in, branches: [main, master]}"#)).unwrap();
        assert_eq!(
            spec,
            ConditionSpec::GitBranchIn {
                branches: vec!["main".to_string(), "master".to_string()]
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = parse_condition(&yaml(r#"{type: command_globs, glob: "*"}"#)).unwrap_err();
        assert_eq!(err, ConditionParseError::UnknownType("command_globs".to_string()));
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = parse_condition(&yaml(r#"{pattern: "^rm"}"#)).unwrap_err();
        assert_eq!(err, ConditionParseError::MissingType);
    }

    #[test]
    fn test_extra_keys_rejected() {
        let err =
            parse_condition(&yaml(r#"{type: command_contains, substring: x, extra: y}"#))
                .unwrap_err();
        assert!(matches!(err, ConditionParseError::BadPayload(_)));
    }

    #[test]
    fn test_scalar_rejected() {
        let err = parse_condition(&yaml(r#""command_matches""#)).unwrap_err();
        assert_eq!(err, ConditionParseError::NotAMapping);
    }

    #[test]
    fn test_rule_doc_rejects_unknown_fields() {
        let doc: Result<RuleDoc, _> = serde_yaml::from_str("ruels: []");
        assert!(doc.is_err());
    }

    #[test]
    fn test_rule_spec_defaults() {
        let doc: RuleDoc = serde_yaml::from_str(
            r#"
rules:
  - name: r1
    action: allow
    commands: [ls]
"#,
        )
        .unwrap();
        let rule = &doc.rules[0];
        assert!(!rule.disabled);
        assert!(!rule.allow_override);
        assert!(rule.conditions.is_empty());
        assert!(rule.directory.is_none());
    }
}
