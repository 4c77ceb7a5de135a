//! Runs an approved (or redirected) command through the delegate shell and
//! captures its outcome.
//!
//! Output is buffered, not streamed, and no timeout is imposed: long-running
//! or interactive commands are not a design target for this path. The shell
//! is invoked as `<shell> -c <command>` so pipelines, globs, and
//! redirections behave exactly as they would in the caller's own shell.

use crate::models::ExecutionResult;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

pub struct Executor {
    shell: String,
}

impl Executor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Execute `command` in `working_dir` with exactly the given environment.
    pub async fn execute(
        &self,
        command: &str,
        working_dir: &Path,
        environment: &HashMap<String, String>,
    ) -> ExecutionResult {
        let started = Instant::now();

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .env_clear()
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) => ExecutionResult {
                exit_code: exit_code_of(&output.status),
                stdout: output.stdout,
                stderr: output.stderr,
                wall_time: started.elapsed(),
            },
            Err(err) => ExecutionResult::spawn_failure(&err),
        }
    }
}

/// Exit code, using the shell convention of 128+signal for signal deaths.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
