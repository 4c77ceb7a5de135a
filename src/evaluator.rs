//! Matching and aggregation: a [`CommandContext`] against a [`RuleSet`]
//! yields one [`Decision`].
//!
//! Priority when several rules match: Deny > RequireApproval > Redirect >
//! Allow, with rule-set order breaking ties. The evaluator itself never
//! fails; callers treat any upstream anomaly as Allow and report it out of
//! band (the engine fails open for its own malfunctions).

use crate::models::{Action, CommandContext, Decision};
use crate::rules::{Rule, RuleSet};

/// Evaluate a request against the active rule set.
pub fn evaluate(ctx: &CommandContext, rules: &RuleSet) -> Decision {
    // Dominant path: nothing mentions this executable and no rule is
    // unconstrained, so no condition code runs at all.
    if rules.fast_path_allows(&ctx.executable) {
        return Decision::Allow;
    }

    let mut winner: Option<&Rule> = None;
    for rule in rules.candidates(&ctx.executable) {
        if !rule_matches(ctx, rule) {
            continue;
        }
        let stricter = match winner {
            None => true,
            Some(current) => rule.action > current.action,
        };
        if stricter {
            winner = Some(rule);
        }
        // A matched deny cannot be outranked.
        if rule.action == Action::Deny {
            break;
        }
    }

    match winner {
        None => Decision::Allow,
        Some(rule) => decision_for(ctx, rule),
    }
}

/// All of a rule's gates, in cheap-to-expensive order. Conditions are
/// AND-composed with short-circuit.
fn rule_matches(ctx: &CommandContext, rule: &Rule) -> bool {
    if let Some(filter) = rule.context_filter {
        if filter != ctx.execution_context {
            return false;
        }
    }
    if let Some(directory) = &rule.directory {
        if !directory.is_match(&ctx.working_dir.to_string_lossy()) {
            return false;
        }
    }
    rule.conditions.iter().all(|cond| cond.evaluate(ctx))
}

fn decision_for(ctx: &CommandContext, rule: &Rule) -> Decision {
    match rule.action {
        Action::Allow => Decision::Allow,
        Action::Deny => Decision::Deny {
            rule: rule.name.clone(),
            message: rule.display_message(),
            allow_override: rule.allow_override,
        },
        Action::RequireApproval => Decision::RequireApproval {
            rule: rule.name.clone(),
            message: rule.display_message(),
        },
        Action::Redirect => Decision::Redirect {
            rule: rule.name.clone(),
            substituted_command: substitute(
                rule.redirect_to.as_deref().unwrap_or_default(),
                ctx,
            ),
            message: rule.display_message(),
        },
    }
}

/// Literal substitution of `$ARGS`, `$CMD`, `$PWD` in a redirect template.
fn substitute(template: &str, ctx: &CommandContext) -> String {
    template
        .replace("$ARGS", &ctx.args.join(" "))
        .replace("$CMD", &ctx.command)
        .replace("$PWD", &ctx.working_dir.to_string_lossy())
}
