//! Layered rule loading: built-in defaults, the user's global layer, and an
//! additive repo layer merge into one immutable [`RuleSet`].
//!
//! The loader works on byte blobs handed to it by the caller (the rule cache
//! owns the filesystem side), so every failure mode is reachable from tests.
//! Errors carry the `layer:rules[i].field` path of the offending input.

use crate::models::{Action, ExecutionContext};
use crate::rules::conditions::{Condition, ConditionSpec};
use crate::rules::schema::{self, OverrideSpec, RuleDoc, RuleSpec};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// Which file a rule came from. Reported in errors and status output, never
/// consulted for ranking at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Default,
    Global,
    Repo,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Default => write!(f, "default"),
            Layer::Global => write!(f, "global"),
            Layer::Repo => write!(f, "repo"),
        }
    }
}

/// A rule-load failure, naming the offending layer, rule, and field.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{layer}: invalid YAML: {message}")]
    Parse { layer: Layer, message: String },

    #[error("{path}: {message}")]
    Condition { path: String, message: String },

    #[error("{path}: invalid regex `{pattern}`: {message}")]
    Regex {
        path: String,
        pattern: String,
        message: String,
    },

    #[error("{layer}: duplicate rule name `{name}`")]
    DuplicateName { layer: Layer, name: String },

    #[error("global:overrides[{index}]: no earlier rule named `{name}`")]
    UnknownOverrideTarget { index: usize, name: String },

    #[error("{layer}: layer may not carry an `overrides` block")]
    OverridesNotAllowed { layer: Layer },

    #[error("{path}: rule `{name}` would match every request; give it commands, conditions, or a directory filter")]
    Unconstrained { path: String, name: String },

    #[error("{path}: rule `{name}` has action `redirect` but no `redirect_to`")]
    MissingRedirectTarget { path: String, name: String },
}

/// The three layer blobs. `None` means the layer file does not exist, which
/// is not an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadInputs<'a> {
    pub defaults: &'a str,
    pub global: Option<&'a str>,
    pub repo: Option<&'a str>,
}

/// A compiled, active rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Executables this rule applies to; empty means any.
    pub commands: Vec<String>,
    pub directory: Option<Regex>,
    pub context_filter: Option<ExecutionContext>,
    pub conditions: Vec<Condition>,
    pub action: Action,
    pub allow_override: bool,
    pub redirect_to: Option<String>,
    pub message: Option<String>,
    pub source_layer: Layer,
}

impl Rule {
    /// Message to attach to denials and prompts; falls back to the rule name.
    pub fn display_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("Matched rule `{}`", self.name))
    }
}

/// The immutable product of a load: ordered active rules plus the
/// executable fast-path index.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    index_by_executable: HashMap<String, Vec<usize>>,
    unconstrained: Vec<usize>,
    fingerprint: String,
}

impl RuleSet {
    /// Content hash over all three input blobs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// True when no rule could possibly apply to this executable; the
    /// evaluator's O(1) fast path.
    pub fn fast_path_allows(&self, executable: &str) -> bool {
        self.unconstrained.is_empty() && !self.index_by_executable.contains_key(executable)
    }

    /// Candidate rules for an executable, in rule-set insertion order.
    pub fn candidates(&self, executable: &str) -> Vec<&Rule> {
        let indexed = self
            .index_by_executable
            .get(executable)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        // Merge the two ordered index lists by position.
        let mut out = Vec::with_capacity(indexed.len() + self.unconstrained.len());
        let (mut i, mut j) = (0, 0);
        while i < indexed.len() || j < self.unconstrained.len() {
            let next = match (indexed.get(i), self.unconstrained.get(j)) {
                (Some(&a), Some(&b)) => {
                    if a < b {
                        i += 1;
                        a
                    } else {
                        j += 1;
                        b
                    }
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => break,
            };
            out.push(&self.rules[next]);
        }
        out
    }

    /// Whether any candidate for this executable consults git metadata.
    pub fn wants_git(&self, executable: &str) -> bool {
        self.candidates(executable)
            .iter()
            .any(|rule| rule.conditions.iter().any(Condition::wants_git))
    }
}

/// Build a [`RuleSet`] from the three layers.
pub fn load(inputs: LoadInputs<'_>) -> Result<RuleSet, LoadError> {
    let default_doc = parse_layer(Layer::Default, inputs.defaults)?;
    let global_doc = match inputs.global {
        Some(blob) => Some(parse_layer(Layer::Global, blob)?),
        None => None,
    };
    let repo_doc = match inputs.repo {
        Some(blob) => Some(parse_layer(Layer::Repo, blob)?),
        None => None,
    };

    // Only the global layer may override; defaults are shipped without an
    // overrides block and the repo layer is purely additive.
    if default_doc.overrides.is_some() {
        return Err(LoadError::OverridesNotAllowed {
            layer: Layer::Default,
        });
    }
    if repo_doc.as_ref().is_some_and(|d| d.overrides.is_some()) {
        return Err(LoadError::OverridesNotAllowed { layer: Layer::Repo });
    }

    // Concatenate defaults -> global -> repo, rejecting duplicate names.
    let mut specs: Vec<(Layer, usize, RuleSpec)> = Vec::new();
    let mut seen: HashMap<String, Layer> = HashMap::new();
    for (layer, doc) in [
        (Layer::Default, Some(&default_doc)),
        (Layer::Global, global_doc.as_ref()),
        (Layer::Repo, repo_doc.as_ref()),
    ] {
        let Some(doc) = doc else { continue };
        for (idx, spec) in doc.rules.iter().enumerate() {
            if seen.insert(spec.name.clone(), layer).is_some() {
                return Err(LoadError::DuplicateName {
                    layer,
                    name: spec.name.clone(),
                });
            }
            specs.push((layer, idx, spec.clone()));
        }
    }

    // Apply the global layer's overrides to the accumulated list.
    if let Some(overrides) = global_doc.as_ref().and_then(|d| d.overrides.as_ref()) {
        for (ov_idx, ov) in overrides.iter().enumerate() {
            apply_override(&mut specs, ov_idx, ov)?;
        }
    }

    let mut rules: Vec<Rule> = Vec::new();
    for (layer, idx, spec) in &specs {
        if spec.disabled {
            continue;
        }
        rules.push(compile_rule(*layer, *idx, spec)?);
    }

    let mut index_by_executable: HashMap<String, Vec<usize>> = HashMap::new();
    let mut unconstrained = Vec::new();
    for (pos, rule) in rules.iter().enumerate() {
        if rule.commands.is_empty() {
            unconstrained.push(pos);
        } else {
            for command in &rule.commands {
                index_by_executable
                    .entry(command.clone())
                    .or_default()
                    .push(pos);
            }
        }
    }

    Ok(RuleSet {
        rules,
        index_by_executable,
        unconstrained,
        fingerprint: fingerprint(inputs),
    })
}

fn parse_layer(layer: Layer, blob: &str) -> Result<RuleDoc, LoadError> {
    // An empty or comment-only file deserializes as a null document and
    // counts as a valid, empty layer.
    serde_yaml::from_str::<Option<RuleDoc>>(blob)
        .map(Option::unwrap_or_default)
        .map_err(|e| LoadError::Parse {
            layer,
            message: e.to_string(),
        })
}

fn apply_override(
    specs: &mut [(Layer, usize, RuleSpec)],
    ov_idx: usize,
    ov: &OverrideSpec,
) -> Result<(), LoadError> {
    let Some((_, _, target)) = specs.iter_mut().find(|(_, _, s)| s.name == ov.name) else {
        return Err(LoadError::UnknownOverrideTarget {
            index: ov_idx,
            name: ov.name.clone(),
        });
    };
    if let Some(disabled) = ov.disabled {
        target.disabled = disabled;
    }
    if let Some(action) = ov.action {
        target.action = action;
    }
    if let Some(message) = &ov.message {
        target.message = Some(message.clone());
    }
    Ok(())
}

fn compile_rule(layer: Layer, idx: usize, spec: &RuleSpec) -> Result<Rule, LoadError> {
    let rule_path = format!("{layer}:rules[{idx}]");

    let directory = match &spec.directory {
        Some(pattern) => Some(Regex::new(pattern).map_err(|e| LoadError::Regex {
            path: format!("{rule_path}.directory"),
            pattern: pattern.clone(),
            message: e.to_string(),
        })?),
        None => None,
    };

    let mut conditions = Vec::with_capacity(spec.conditions.len());
    for (cond_idx, value) in spec.conditions.iter().enumerate() {
        let cond_path = format!("{rule_path}.conditions[{cond_idx}]");
        let parsed: ConditionSpec = schema::parse_condition(value).map_err(|e| {
            LoadError::Condition {
                path: cond_path.clone(),
                message: e.to_string(),
            }
        })?;
        let compiled = parsed
            .compile()
            .map_err(|(pattern, e)| LoadError::Regex {
                path: cond_path,
                pattern,
                message: e.to_string(),
            })?;
        conditions.push(compiled);
    }

    if spec.action == Action::Redirect && spec.redirect_to.is_none() {
        return Err(LoadError::MissingRedirectTarget {
            path: rule_path,
            name: spec.name.clone(),
        });
    }

    // A rule with no executable list, no conditions, and no directory filter
    // would match literally everything.
    if spec.commands.is_empty() && conditions.is_empty() && directory.is_none() {
        return Err(LoadError::Unconstrained {
            path: rule_path,
            name: spec.name.clone(),
        });
    }

    Ok(Rule {
        name: spec.name.clone(),
        commands: spec.commands.clone(),
        directory,
        context_filter: spec.context,
        conditions,
        action: spec.action,
        allow_override: spec.allow_override,
        redirect_to: spec.redirect_to.clone(),
        message: spec.message.clone(),
        source_layer: layer,
    })
}

fn fingerprint(inputs: LoadInputs<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"default\0");
    hasher.update(inputs.defaults.as_bytes());
    hasher.update(b"\0global\0");
    hasher.update(inputs.global.unwrap_or("").as_bytes());
    hasher.update(b"\0repo\0");
    hasher.update(inputs.repo.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_layers(global: Option<&str>, repo: Option<&str>) -> Result<RuleSet, LoadError> {
        load(LoadInputs {
            defaults: "",
            global,
            repo,
        })
    }

    const GLOBAL: &str = r#"
rules:
  - name: no-rm-root
    commands: [rm]
    conditions:
      - type: command_matches
        pattern: '^rm\s+-rf\s+/(\s|$)'
    action: deny
    message: "Refusing to remove /."
  - name: force-push
    commands: [git]
    conditions:
      - type: command_matches
        pattern: '^git\s+push\s+--force'
    action: require_approval
"#;

    #[test]
    fn test_empty_inputs_yield_empty_set() {
        let rules = load_layers(None, None).unwrap();
        assert!(rules.is_empty());
        assert!(rules.fast_path_allows("anything"));
    }

    #[test]
    fn test_basic_load_and_index() {
        let rules = load_layers(Some(GLOBAL), None).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(!rules.fast_path_allows("rm"));
        assert!(!rules.fast_path_allows("git"));
        assert!(rules.fast_path_allows("ls"));
        assert_eq!(rules.candidates("rm").len(), 1);
        assert_eq!(rules.candidates("rm")[0].name, "no-rm-root");
    }

    #[test]
    fn test_builtin_defaults_parse() {
        let rules = load(LoadInputs {
            defaults: crate::rules::DEFAULT_RULES,
            global: None,
            repo: None,
        })
        .unwrap();
        assert!(!rules.is_empty());
        // The defaults keep the fast path intact for unmentioned commands.
        assert!(rules.fast_path_allows("ls"));
        assert!(!rules.fast_path_allows("rm"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let repo = r#"
rules:
  - name: no-rm-root
    commands: [rm]
    action: deny
"#;
        let err = load_layers(Some(GLOBAL), Some(repo)).unwrap_err();
        match err {
            LoadError::DuplicateName { layer, name } => {
                assert_eq!(layer, Layer::Repo);
                assert_eq!(name, "no-rm-root");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_override_disables_rule() {
        let global = format!(
            "{GLOBAL}
overrides:
  - name: no-rm-root
    disabled: true
"
        );
        let rules = load_layers(Some(&global), None).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.rules().iter().all(|r| r.name != "no-rm-root"));
    }

    #[test]
    fn test_override_changes_action_and_message() {
        let global = format!(
            "{GLOBAL}
overrides:
  - name: no-rm-root
    action: require_approval
    message: \"Ask first.\"
"
        );
        let rules = load_layers(Some(&global), None).unwrap();
        let rule = rules
            .rules()
            .iter()
            .find(|r| r.name == "no-rm-root")
            .unwrap();
        assert_eq!(rule.action, Action::RequireApproval);
        assert_eq!(rule.message.as_deref(), Some("Ask first."));
    }

    #[test]
    fn test_override_unknown_target_rejected() {
        let global = r#"
rules: []
overrides:
  - name: nonexistent
    disabled: true
"#;
        let err = load_layers(Some(global), None).unwrap_err();
        match err {
            LoadError::UnknownOverrideTarget { name, .. } => assert_eq!(name, "nonexistent"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_repo_overrides_rejected() {
        let repo = r#"
rules: []
overrides:
  - name: no-rm-root
    disabled: true
"#;
        let err = load_layers(Some(GLOBAL), Some(repo)).unwrap_err();
        assert!(matches!(
            err,
            LoadError::OverridesNotAllowed { layer: Layer::Repo }
        ));
    }

    #[test]
    fn test_bad_regex_names_field() {
        let global = r#"
rules:
  - name: broken
    commands: [rm]
    conditions:
      - type: command_matches
        pattern: '(unclosed'
    action: deny
"#;
        let err = load_layers(Some(global), None).unwrap_err();
        match err {
            LoadError::Regex { path, pattern, .. } => {
                assert_eq!(path, "global:rules[0].conditions[0]");
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_condition_type_names_path() {
        let global = r#"
rules:
  - name: odd
    commands: [rm]
    conditions:
      - type: command_matches
        pattern: '^rm'
      - type: phase_of_moon
        full: true
    action: deny
"#;
        let err = load_layers(Some(global), None).unwrap_err();
        match err {
            LoadError::Condition { path, message } => {
                assert_eq!(path, "global:rules[0].conditions[1]");
                assert!(message.contains("phase_of_moon"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unconstrained_rule_rejected() {
        let global = r#"
rules:
  - name: match-everything
    action: deny
"#;
        let err = load_layers(Some(global), None).unwrap_err();
        assert!(matches!(err, LoadError::Unconstrained { .. }));
    }

    #[test]
    fn test_directory_filter_is_a_constraint() {
        let global = r#"
rules:
  - name: protect-prod-dir
    directory: '/prod/'
    action: require_approval
"#;
        let rules = load_layers(Some(global), None).unwrap();
        assert_eq!(rules.len(), 1);
        // Unconstrained-by-executable means the fast path is off for all.
        assert!(!rules.fast_path_allows("ls"));
    }

    #[test]
    fn test_redirect_requires_target() {
        let global = r#"
rules:
  - name: rm-to-trash
    commands: [rm]
    action: redirect
"#;
        let err = load_layers(Some(global), None).unwrap_err();
        assert!(matches!(err, LoadError::MissingRedirectTarget { .. }));
    }

    #[test]
    fn test_disabled_rules_not_indexed() {
        let global = r#"
rules:
  - name: off
    commands: [rm]
    action: deny
    disabled: true
"#;
        let rules = load_layers(Some(global), None).unwrap();
        assert!(rules.is_empty());
        assert!(rules.fast_path_allows("rm"));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = load_layers(Some(GLOBAL), None).unwrap();
        let b = load_layers(Some(GLOBAL), None).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = load_layers(Some(GLOBAL), Some("rules: []")).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_candidates_preserve_insertion_order() {
        let global = r#"
rules:
  - name: first
    commands: [git]
    action: allow
  - name: anywhere
    conditions:
      - type: command_contains
        substring: secret
    action: deny
  - name: last
    commands: [git]
    action: require_approval
"#;
        let rules = load_layers(Some(global), None).unwrap();
        let names: Vec<_> = rules.candidates("git").iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "anywhere", "last"]);
    }

    #[test]
    fn test_wants_git() {
        let global = r#"
rules:
  - name: branch-guard
    commands: [git]
    conditions:
      - type: git_branch_in
        branches: [main]
    action: deny
  - name: plain
    commands: [rm]
    conditions:
      - type: command_contains
        substring: "-rf"
    action: deny
"#;
        let rules = load_layers(Some(global), None).unwrap();
        assert!(rules.wants_git("git"));
        assert!(!rules.wants_git("rm"));
        assert!(!rules.wants_git("ls"));
    }

    #[test]
    fn test_malformed_yaml_names_layer() {
        let err = load_layers(Some("rules: ["), None).unwrap_err();
        match err {
            LoadError::Parse { layer, .. } => assert_eq!(layer, Layer::Global),
            other => panic!("unexpected error: {other}"),
        }
    }
}
