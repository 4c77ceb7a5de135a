//! Rule model: condition predicates, YAML schema, and the layered loader
//! that produces an immutable [`RuleSet`].

pub mod conditions;
pub mod loader;
pub mod schema;

pub use conditions::Condition;
pub use loader::{Layer, LoadError, LoadInputs, Rule, RuleSet, load};

/// The built-in default layer, compiled into the binary.
pub const DEFAULT_RULES: &str = include_str!("../../rules/defaults.yaml");
