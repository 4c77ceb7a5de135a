//! Shim materialization: the small external client that ordinary shell
//! invocations route through, plus the shell-integration snippet.
//!
//! The shim is deliberately not a Rust binary: its startup cost must be
//! trivial and it must fail open when the engine (or anything else) is
//! missing. It is a bash launcher that hands off to an embedded python3
//! client speaking the EXECUTE protocol; with no python3 or no socket it
//! runs the real command directly, exit code preserved. Interception works
//! by symlinking command names onto the script in a directory that the
//! integration snippet prepends to `PATH`.

use crate::settings::{self, Paths};
use anyhow::{Context as _, Result};
use std::fs;

const SHIM_TEMPLATE: &str = r#"#!/usr/bin/env bash
# Generated by `shellgate shim install`. Do not edit; reinstall instead.
#
# Called via a command-name symlink (rm, git, ...) or directly as
# `shellgate-shim <command> [args...]`. Routes the invocation through the
# shellgate engine; if the engine, python3, or the socket is missing, the
# real command runs untouched.

SHELLGATE_SOCKET="${SHELLGATE_SOCKET:-__SOCKET__}"
SHELLGATE_SHIM_DIR="${SHELLGATE_SHIM_DIR:-__SHIM_DIR__}"
export SHELLGATE_SOCKET SHELLGATE_SHIM_DIR

cmd="$(basename "$0")"
if [ "$cmd" = "shellgate-shim" ]; then
    if [ "$#" -eq 0 ]; then
        echo "usage: shellgate-shim <command> [args...]" >&2
        exit 64
    fi
    cmd="$1"
    shift
fi

run_real() {
    # Strip the shim dir from PATH so we do not recurse into ourselves.
    cleaned=""
    old_ifs="$IFS"; IFS=:
    for entry in $PATH; do
        [ "$entry" = "$SHELLGATE_SHIM_DIR" ] && continue
        cleaned="${cleaned:+$cleaned:}$entry"
    done
    IFS="$old_ifs"
    PATH="$cleaned" exec "$cmd" "$@"
}

[ -S "$SHELLGATE_SOCKET" ] || run_real "$@"
command -v python3 >/dev/null 2>&1 || run_real "$@"

exec python3 - "$cmd" "$@" <<'SHELLGATE_CLIENT'
import base64
import json
import os
import shlex
import socket
import sys

SOCKET = os.environ["SHELLGATE_SOCKET"]
SHIM_DIR = os.environ["SHELLGATE_SHIM_DIR"]
ENV_ALLOWLIST = {__ENV_ALLOWLIST__}
AI_MARKER = "__AI_MARKER__"


def run_real(argv):
    """Fail open: run the real command with the shim dir stripped from PATH."""
    entries = os.environ.get("PATH", "").split(":")
    os.environ["PATH"] = ":".join(e for e in entries if e and e != SHIM_DIR)
    try:
        os.execvp(argv[0], argv)
    except OSError:
        sys.stderr.write("%s: command not found\n" % argv[0])
        sys.exit(127)


def emit(stream, text, encoding):
    data = base64.b64decode(text) if encoding == "base64" else text.encode()
    stream.buffer.write(data)
    stream.buffer.flush()


argv = sys.argv[1:]
request = {
    "type": "EXECUTE",
    "command": shlex.join(argv),
    "working_dir": os.getcwd(),
    "environment": {k: v for k, v in os.environ.items() if k in ENV_ALLOWLIST},
    "execution_context": "ai" if os.environ.get(AI_MARKER) else "human",
}

try:
    conn = socket.socket(socket.AF_UNIX, socket.SOCK_STREAM)
    conn.connect(SOCKET)
    conn.sendall((json.dumps(request) + "\n").encode())
    line = conn.makefile("rb").readline()
    if not line:
        run_real(argv)
    response = json.loads(line)
except (OSError, ValueError):
    run_real(argv)

emit(sys.stdout, response.get("stdout", ""), response.get("stdout_encoding", "utf-8"))
emit(sys.stderr, response.get("stderr", ""), response.get("stderr_encoding", "utf-8"))

code = response.get("exit_code")
if code is None:
    # Not executed: denied, declined, or timed out. The banner is already on
    # stderr; exit nonzero so callers notice.
    code = 0 if response.get("executed") else 1
sys.exit(code)
SHELLGATE_CLIENT
"#;

const INTEGRATION_TEMPLATE: &str = r#"# shellgate shell integration. Source from ~/.bashrc:
#   source "__SELF__"
# Generated by `shellgate shim install`. Do not edit; reinstall instead.

export SHELLGATE_SHIM_DIR="__SHIM_DIR__"
case ":$PATH:" in
    *":$SHELLGATE_SHIM_DIR:"*) ;;
    *) PATH="$SHELLGATE_SHIM_DIR:$PATH" ;;
esac

# Builtins cannot be intercepted from PATH; wrap the policy-relevant ones so
# they make an evaluate round-trip first. Fails open when shellgate is gone.
shellgate__guard_builtin() {
    local name="$1"
    shift
    if command -v shellgate >/dev/null 2>&1; then
        if ! shellgate check --quiet -- "$name $*"; then
            echo "shellgate: $name blocked by policy" >&2
            return 1
        fi
    fi
    builtin "$name" "$@"
}
__BUILTIN_WRAPPERS__
"#;

/// Render the shim client for this installation.
pub fn shim_script(paths: &Paths) -> String {
    let allowlist = settings::ENV_ALLOWLIST
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    SHIM_TEMPLATE
        .replace("__SOCKET__", &paths.engine_socket().to_string_lossy())
        .replace("__SHIM_DIR__", &paths.shim_dir().to_string_lossy())
        .replace("__ENV_ALLOWLIST__", &allowlist)
        .replace("__AI_MARKER__", settings::AI_MARKER_ENV)
}

/// Render the sourced integration snippet.
pub fn integration_script(paths: &Paths, builtins: &[String]) -> String {
    let wrappers = builtins
        .iter()
        .map(|name| format!("{name}() {{ shellgate__guard_builtin {name} \"$@\"; }}"))
        .collect::<Vec<_>>()
        .join("\n");
    INTEGRATION_TEMPLATE
        .replace("__SELF__", &paths.integration_script().to_string_lossy())
        .replace("__SHIM_DIR__", &paths.shim_dir().to_string_lossy())
        .replace("__BUILTIN_WRAPPERS__", &wrappers)
}

/// What `shim install` did, for reporting.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub script: std::path::PathBuf,
    pub integration: std::path::PathBuf,
    pub linked: Vec<String>,
}

/// Write the shim script, one symlink per command, and the integration
/// snippet.
pub fn install(paths: &Paths, commands: &[String], builtins: &[String]) -> Result<InstallReport> {
    let shim_dir = paths.shim_dir();
    fs::create_dir_all(&shim_dir)
        .with_context(|| format!("create {}", shim_dir.display()))?;

    let script_path = paths.shim_script();
    fs::write(&script_path, shim_script(paths))
        .with_context(|| format!("write {}", script_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    let mut report = InstallReport {
        script: script_path.clone(),
        integration: paths.integration_script(),
        linked: Vec::new(),
    };

    for command in commands {
        let link = shim_dir.join(command);
        match fs::symlink_metadata(&link) {
            Ok(_) => {
                fs::remove_file(&link)
                    .with_context(|| format!("replace {}", link.display()))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("stat {}", link.display())),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&script_path, &link)
            .with_context(|| format!("link {}", link.display()))?;
        report.linked.push(command.clone());
    }

    fs::write(paths.integration_script(), integration_script(paths, builtins))
        .with_context(|| format!("write {}", paths.integration_script().display()))?;

    Ok(report)
}

/// Delete the shim directory and the integration snippet.
pub fn remove(paths: &Paths) -> Result<()> {
    match fs::remove_dir_all(paths.shim_dir()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("remove shim dir"),
    }
    match fs::remove_file(paths.integration_script()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("remove integration script"),
    }
    Ok(())
}

/// Which command names currently resolve to the shim.
pub fn installed_links(paths: &Paths) -> Vec<String> {
    let shim_dir = paths.shim_dir();
    let Ok(entries) = fs::read_dir(&shim_dir) else {
        return Vec::new();
    };
    let mut links: Vec<String> = entries
        .flatten()
        .filter(|entry| {
            entry
                .path()
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    links.sort();
    links
}
