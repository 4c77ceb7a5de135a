//! Shellgate - cooperative safety layer for shell commands.
//!
//! Intercepts commands issued by humans and AI coding agents, evaluates them
//! against a layered YAML rule set, and enforces one of four outcomes:
//! allow, deny with a structured explanation, redirect to a substituted
//! command, or block on interactive human approval. The caller is assumed
//! cooperative; the goal is preventing destructive accidents, not containing
//! a hostile process.
//!
//! The long-lived engine (see [`daemon`]) serves line-delimited JSON over
//! two local Unix sockets: a client endpoint for evaluate/execute requests
//! and an observer endpoint streaming lifecycle events and accepting
//! approval verdicts. Thin clients (the generated shim, the Claude Code
//! hook adapter, the observer TUI, and the CLI subcommands) all speak the
//! same protocol.
//!
//! # Example
//!
//! ```
//! use shellgate::evaluator::evaluate;
//! use shellgate::models::{CommandContext, Decision, ExecutionContext};
//! use shellgate::rules::{LoadInputs, load};
//!
//! let rules = load(LoadInputs {
//!     defaults: shellgate::rules::DEFAULT_RULES,
//!     global: None,
//!     repo: None,
//! })
//! .unwrap();
//!
//! let ctx = CommandContext::new(
//!     "rm -rf /",
//!     "/tmp",
//!     Default::default(),
//!     ExecutionContext::Human,
//! );
//! assert!(matches!(evaluate(&ctx, &rules), Decision::Deny { .. }));
//! ```

pub mod approvals;
pub mod cache;
pub mod client;
pub mod daemon;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod git_context;
pub mod hook;
pub mod models;
pub mod parser;
pub mod protocol;
pub mod rules;
pub mod settings;
pub mod shim;
pub mod tui;

pub use evaluator::evaluate;
pub use models::{CommandContext, Decision, ExecutionContext};
pub use rules::{RuleSet, load};
