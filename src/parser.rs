//! Command parsing using tree-sitter-bash for AST parsing.
//!
//! The engine evaluates a request against its *primary* command: the first
//! simple command in the string, with leading variable assignments
//! (`FOO=bar cmd`) and redirections stripped. Compound commands are policed
//! by rules over the full command string (`command_matches` etc.), so only
//! the head command feeds the executable fast-path index.

use std::sync::{LazyLock, Mutex};
use tree_sitter::{Node, Parser};
use tree_sitter_bash::LANGUAGE;

static PARSER: LazyLock<Mutex<Parser>> = LazyLock::new(|| {
    let mut parser = Parser::new();
    parser
        .set_language(&LANGUAGE.into())
        .expect("Failed to set language");
    Mutex::new(parser)
});

/// Executable and arguments of the primary command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    pub executable: String,
    pub args: Vec<String>,
}

/// Parse the primary command out of a command string.
///
/// Handles:
/// - Simple commands: `git push origin main`
/// - Variable prefixes: `RUST_LOG=debug cargo test` (executable = cargo)
/// - Redirections: `make build > log 2>&1` (redirects dropped from args)
/// - Chains and pipelines: `rm -rf dist && ls` (primary = rm)
/// - Quoted strings: `echo "rm -rf /"` (quoted text stays one argument)
pub fn parse_primary(command_string: &str) -> ParsedCommand {
    if command_string.trim().is_empty() {
        return ParsedCommand::default();
    }

    let tree = {
        let mut parser = PARSER.lock().unwrap();
        match parser.parse(command_string, None) {
            Some(tree) => tree,
            None => return fallback_parse(command_string),
        }
    };

    match first_command(tree.root_node(), command_string) {
        Some(parsed) if !parsed.executable.is_empty() => parsed,
        _ => fallback_parse(command_string),
    }
}

/// Depth-first search for the first `command` node.
fn first_command(node: Node, source: &str) -> Option<ParsedCommand> {
    if node.kind() == "command" {
        return extract_command(node, source);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        // Quoted strings and heredoc bodies are data, not commands.
        if matches!(child.kind(), "string" | "raw_string" | "heredoc_body") {
            continue;
        }
        if let Some(found) = first_command(child, source) {
            return Some(found);
        }
    }
    None
}

fn extract_command(node: Node, source: &str) -> Option<ParsedCommand> {
    let mut parts: Vec<String> = Vec::new();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            // `FOO=bar cmd`: assignment prefixes are not the executable.
            "variable_assignment" => {}
            // `> out`, `2>&1`, `< in`: redirections are not arguments.
            "file_redirect" | "herestring_redirect" | "heredoc_redirect" => {}
            "command_name" => {
                if let Some(inner) = child.child(0) {
                    if let Ok(text) = inner.utf8_text(source.as_bytes()) {
                        parts.push(unquote(text));
                    }
                }
            }
            "word" | "number" | "simple_expansion" | "expansion" => {
                if let Ok(text) = child.utf8_text(source.as_bytes()) {
                    parts.push(text.to_string());
                }
            }
            "string" | "raw_string" => {
                if let Ok(text) = child.utf8_text(source.as_bytes()) {
                    parts.push(unquote(text));
                }
            }
            "concatenation" => {
                if let Some(text) = extract_concatenation(child, source) {
                    parts.push(text);
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        return None;
    }

    let executable = parts.remove(0);
    Some(ParsedCommand {
        executable,
        args: parts,
    })
}

/// Join the pieces of a concatenation node (e.g. `"foo"bar`).
fn extract_concatenation(node: Node, source: &str) -> Option<String> {
    let mut result = String::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Ok(text) = child.utf8_text(source.as_bytes()) {
            result.push_str(&unquote(text));
        }
    }
    if result.is_empty() { None } else { Some(result) }
}

/// Remove one layer of surrounding quotes.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Fallback parser using simple tokenization when tree-sitter fails.
fn fallback_parse(command_string: &str) -> ParsedCommand {
    let head = command_string
        .split(['|', ';', '&'])
        .next()
        .unwrap_or(command_string);
    let tokens = tokenize(head);

    let mut iter = tokens.into_iter().peekable();

    // Skip leading variable assignments.
    while let Some(tok) = iter.peek() {
        if is_assignment(tok) {
            iter.next();
        } else {
            break;
        }
    }

    let Some(executable) = iter.next() else {
        return ParsedCommand::default();
    };

    let mut args = Vec::new();
    let mut skip_next = false;
    for tok in iter {
        if skip_next {
            skip_next = false;
            continue;
        }
        if let Some(standalone) = redirection_operator(&tok) {
            // `> file` consumes the target token; `>file` is self-contained.
            skip_next = standalone;
            continue;
        }
        args.push(tok);
    }

    ParsedCommand { executable, args }
}

fn is_assignment(tok: &str) -> bool {
    match tok.find('=') {
        Some(pos) if pos > 0 => tok[..pos]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Returns Some(true) if `tok` is a bare redirection operator whose target is
/// the following token, Some(false) if it embeds its target, None otherwise.
fn redirection_operator(tok: &str) -> Option<bool> {
    let trimmed = tok.trim_start_matches(|c: char| c.is_ascii_digit());
    if !trimmed.starts_with('>') && !trimmed.starts_with('<') {
        return None;
    }
    let rest = trimmed.trim_start_matches(['>', '<', '&']);
    Some(rest.is_empty() && !trimmed.contains('&'))
}

/// Simple tokenizer that handles quoted strings.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            current.push(c);
            escape_next = false;
            continue;
        }

        match c {
            '\\' if !in_single_quote => {
                escape_next = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
            }
            ' ' | '\t' if !in_single_quote && !in_double_quote => {
                if !current.is_empty() {
                    tokens.push(current.clone());
                    current.clear();
                }
            }
            _ => {
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
