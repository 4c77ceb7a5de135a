//! Blocking client for the engine's Unix-socket endpoints.
//!
//! Used by the CLI subcommands, the hook adapter, and the observer TUI:
//! short-lived callers that have no reason to spin up an async runtime. One
//! request per call: write a line, read a line.

use crate::models::ExecutionContext;
use crate::protocol::{
    Ack, ApprovalParams, CommandParams, EvaluateResponse, ExecuteResponse, Request, StatusResponse,
};
use crate::settings::{self, Paths};
use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

pub struct EngineClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl EngineClient {
    /// Connect to the client endpoint. Fails when the engine is not running;
    /// callers that want fail-open behavior handle that themselves.
    pub fn connect(paths: &Paths) -> Result<Self> {
        Self::connect_socket(paths.engine_socket())
    }

    /// Connect to the observer endpoint (event stream + APPROVE/DENY).
    pub fn connect_observer(paths: &Paths) -> Result<Self> {
        Self::connect_socket(paths.observer_socket())
    }

    fn connect_socket(path: PathBuf) -> Result<Self> {
        let stream = UnixStream::connect(&path)
            .with_context(|| format!("connect {} (is the engine running?)", path.display()))?;
        let reader = BufReader::new(stream.try_clone().context("clone socket")?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Split into independent read and write halves (the observer TUI reads
    /// events on one thread and sends verdicts from another).
    pub fn split(self) -> (BufReader<UnixStream>, UnixStream) {
        (self.reader, self.writer)
    }

    pub fn send(&mut self, request: &Request) -> Result<()> {
        let line = serde_json::to_string(request)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one response line and decode it.
    pub fn read_line<R: DeserializeOwned>(&mut self) -> Result<R> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        anyhow::ensure!(n > 0, "engine closed the connection");
        serde_json::from_str(line.trim_end()).context("decode response")
    }

    fn round_trip<R: DeserializeOwned>(&mut self, request: &Request) -> Result<R> {
        self.send(request)?;
        self.read_line()
    }

    pub fn evaluate(&mut self, params: CommandParams) -> Result<EvaluateResponse> {
        self.round_trip(&Request::Evaluate(params))
    }

    pub fn execute(&mut self, params: CommandParams) -> Result<ExecuteResponse> {
        self.round_trip(&Request::Execute(params))
    }

    pub fn status(&mut self) -> Result<StatusResponse> {
        self.round_trip(&Request::Status)
    }

    pub fn reload_rules(&mut self) -> Result<Ack> {
        self.round_trip(&Request::ReloadRules)
    }

    pub fn shutdown(&mut self) -> Result<Ack> {
        self.round_trip(&Request::Shutdown)
    }

    pub fn approve(&mut self, approval_id: &str, message: Option<String>) -> Result<Ack> {
        self.round_trip(&Request::Approve(ApprovalParams {
            approval_id: approval_id.to_string(),
            message,
        }))
    }

    pub fn deny(&mut self, approval_id: &str, message: Option<String>) -> Result<Ack> {
        self.round_trip(&Request::Deny(ApprovalParams {
            approval_id: approval_id.to_string(),
            message,
        }))
    }
}

/// Build EVALUATE/EXECUTE params from the calling process's own state.
pub fn params_from_caller(
    command: &str,
    working_dir: Option<PathBuf>,
    execution_context: Option<ExecutionContext>,
) -> CommandParams {
    let working_dir = working_dir
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let environment: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| settings::ENV_ALLOWLIST.contains(&k.as_str()))
        .collect();
    CommandParams {
        command: command.to_string(),
        working_dir,
        environment,
        execution_context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_caller_filters_environment() {
        let params = params_from_caller("ls", Some(PathBuf::from("/tmp")), None);
        assert_eq!(params.command, "ls");
        assert_eq!(params.working_dir, PathBuf::from("/tmp"));
        for key in params.environment.keys() {
            assert!(
                settings::ENV_ALLOWLIST.contains(&key.as_str()),
                "unexpected env var {key}"
            );
        }
    }

    #[test]
    fn test_connect_missing_socket_is_error() {
        let paths = Paths::in_dir("/nonexistent/shellgate");
        assert!(EngineClient::connect(&paths).is_err());
    }
}
