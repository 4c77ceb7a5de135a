//! Condition predicates over a [`CommandContext`].
//!
//! Every condition is total: missing inputs (no git metadata, unset
//! variables, unreadable paths) evaluate to `false`, never an error. Regexes
//! are compiled once at rule-set build time; the `regex` crate's linear-time
//! engine keeps user-authored patterns from going pathological.

use crate::models::CommandContext;
use regex::Regex;
use std::path::PathBuf;

/// An unvalidated condition as written in a rule file. Regex fields are
/// still strings; [`ConditionSpec::compile`] turns them into a [`Condition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionSpec {
    CommandMatches { pattern: String },
    CommandContains { substring: String },
    CommandStartswith { prefix: String },
    GitBranchIn { branches: Vec<String> },
    GitBranchMatches { pattern: String },
    InGitRepo { value: bool },
    PathMatches { pattern: String },
    FileExists { path: String },
    EnvEquals { variable: String, value: String },
}

impl ConditionSpec {
    /// Compile regex payloads. Returns the offending pattern on failure so
    /// the loader can attach its field path.
    pub fn compile(&self) -> Result<Condition, (String, regex::Error)> {
        let compiled = match self {
            ConditionSpec::CommandMatches { pattern } => Condition::CommandMatches(
                Regex::new(pattern).map_err(|e| (pattern.clone(), e))?,
            ),
            ConditionSpec::CommandContains { substring } => {
                Condition::CommandContains(substring.clone())
            }
            ConditionSpec::CommandStartswith { prefix } => {
                Condition::CommandStartswith(prefix.clone())
            }
            ConditionSpec::GitBranchIn { branches } => Condition::GitBranchIn(branches.clone()),
            ConditionSpec::GitBranchMatches { pattern } => Condition::GitBranchMatches(
                Regex::new(pattern).map_err(|e| (pattern.clone(), e))?,
            ),
            ConditionSpec::InGitRepo { value } => Condition::InGitRepo(*value),
            ConditionSpec::PathMatches { pattern } => {
                Condition::PathMatches(Regex::new(pattern).map_err(|e| (pattern.clone(), e))?)
            }
            ConditionSpec::FileExists { path } => Condition::FileExists(PathBuf::from(path)),
            ConditionSpec::EnvEquals { variable, value } => Condition::EnvEquals {
                variable: variable.clone(),
                value: value.clone(),
            },
        };
        Ok(compiled)
    }
}

/// A compiled, evaluatable predicate.
#[derive(Debug, Clone)]
pub enum Condition {
    CommandMatches(Regex),
    CommandContains(String),
    CommandStartswith(String),
    GitBranchIn(Vec<String>),
    GitBranchMatches(Regex),
    InGitRepo(bool),
    PathMatches(Regex),
    FileExists(PathBuf),
    EnvEquals { variable: String, value: String },
}

impl Condition {
    /// Evaluate against a request. Total: absent inputs yield `false`.
    pub fn evaluate(&self, ctx: &CommandContext) -> bool {
        match self {
            Condition::CommandMatches(re) => re.is_match(&ctx.command),
            Condition::CommandContains(sub) => ctx.command.contains(sub.as_str()),
            Condition::CommandStartswith(prefix) => ctx.command.starts_with(prefix.as_str()),
            Condition::GitBranchIn(branches) => match &ctx.git_branch {
                Some(branch) => branches.iter().any(|b| b == branch),
                None => false,
            },
            Condition::GitBranchMatches(re) => match &ctx.git_branch {
                Some(branch) => re.is_match(branch),
                None => false,
            },
            Condition::InGitRepo(expected) => match ctx.in_git_repo {
                Some(actual) => actual == *expected,
                None => false,
            },
            Condition::PathMatches(re) => re.is_match(&ctx.working_dir.to_string_lossy()),
            Condition::FileExists(path) => {
                let full = if path.is_absolute() {
                    path.clone()
                } else {
                    ctx.working_dir.join(path)
                };
                full.exists()
            }
            Condition::EnvEquals { variable, value } => {
                ctx.environment.get(variable).is_some_and(|v| v == value)
            }
        }
    }

    /// Whether evaluating this condition needs git metadata on the context.
    pub fn wants_git(&self) -> bool {
        matches!(
            self,
            Condition::GitBranchIn(_) | Condition::GitBranchMatches(_) | Condition::InGitRepo(_)
        )
    }
}
